use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::model::{CriterionOutcome, Verdict};
use crate::util::{now_utc_string, truncate_chars, write_json_pretty, write_text};

pub const REPORT_VERSION: u32 = 1;
const RULE_WIDTH: usize = 70;
const TEXT_EVIDENCE_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct CriterionMetrics {
    pub index: usize,
    pub criterion: String,
    pub duration_secs: f64,
    pub attempts: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditMetrics {
    pub total_time_secs: f64,
    pub avg_time_secs: f64,
    pub avg_attempts: f64,
    pub avg_confidence: f64,
    pub criteria: Vec<CriterionMetrics>,
}

impl AuditMetrics {
    pub fn from_criteria(criteria: Vec<CriterionMetrics>, total: Duration) -> Self {
        let count = criteria.len();
        let average = |value: fn(&CriterionMetrics) -> f64| {
            if count == 0 {
                0.0
            } else {
                criteria.iter().map(value).sum::<f64>() / count as f64
            }
        };
        Self {
            total_time_secs: total.as_secs_f64(),
            avg_time_secs: average(|metric| metric.duration_secs),
            avg_attempts: average(|metric| metric.attempts as f64),
            avg_confidence: average(|metric| metric.confidence),
            criteria,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub report_version: u32,
    pub generated_at: String,
    pub document: String,
    pub doc_type: String,
    pub total_criteria: usize,
    pub criteria_present: usize,
    pub criteria_absent: usize,
    pub compliance_rate: f64,
    pub results: Vec<CriterionOutcome>,
    pub metrics: AuditMetrics,
}

impl AuditReport {
    pub fn assemble(
        document: &str,
        doc_type: &str,
        results: Vec<CriterionOutcome>,
        metrics: AuditMetrics,
    ) -> Self {
        let criteria_present = results
            .iter()
            .filter(|outcome| outcome.status == Verdict::Present)
            .count();
        let criteria_absent = results.len() - criteria_present;

        Self {
            report_version: REPORT_VERSION,
            generated_at: now_utc_string(),
            document: document.to_string(),
            doc_type: doc_type.to_string(),
            total_criteria: results.len(),
            criteria_present,
            criteria_absent,
            compliance_rate: compliance_rate(criteria_present, criteria_absent),
            results,
            metrics,
        }
    }
}

/// Percentage of PRESENT verdicts, rounded to two decimals; 0 when nothing was judged.
pub fn compliance_rate(present: usize, absent: usize) -> f64 {
    let judged = present + absent;
    if judged == 0 {
        return 0.0;
    }
    let rate = present as f64 / judged as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

pub fn render_text(report: &AuditReport) -> String {
    let heavy = "=".repeat(RULE_WIDTH);
    let light = "-".repeat(RULE_WIDTH);
    let mut lines = vec![
        heavy.clone(),
        "AUDIT REPORT".to_string(),
        heavy.clone(),
        format!("Document: {}", report.document),
        format!("Document Type: {}", report.doc_type),
        format!("Total Criteria: {}", report.total_criteria),
        format!("Present: {}", report.criteria_present),
        format!("Absent: {}", report.criteria_absent),
        format!("Compliance Rate: {}%", report.compliance_rate),
        String::new(),
        light.clone(),
        "DETAILED RESULTS".to_string(),
        light,
    ];

    for (position, outcome) in report.results.iter().enumerate() {
        let pages = if outcome.cited_pages.is_empty() {
            "N/A".to_string()
        } else {
            outcome
                .cited_pages
                .iter()
                .map(u32::to_string)
                .collect::<Vec<String>>()
                .join(", ")
        };
        let evidence = truncate_chars(&outcome.evidence_text, TEXT_EVIDENCE_CHARS);
        let ellipsis = if evidence.len() < outcome.evidence_text.len() {
            "..."
        } else {
            ""
        };

        lines.push(format!("\n{}. {}", position + 1, outcome.criterion));
        lines.push(format!("   Status: {}", outcome.status.as_str()));
        lines.push(format!("   Confidence: {:.0}%", outcome.confidence * 100.0));
        lines.push(format!("   Pages: {pages}"));
        lines.push(format!("   Attempts: {}", outcome.attempts));
        if outcome.cancelled {
            lines.push("   Note: session cancelled before completion".to_string());
        }
        lines.push(format!("   Evidence: {evidence}{ellipsis}"));
    }

    lines.push(format!("\n{heavy}"));
    lines.join("\n")
}

pub fn render_metrics(metrics: &AuditMetrics) -> String {
    [
        "Performance Metrics".to_string(),
        format!("  Total Criteria      {}", metrics.criteria.len()),
        format!("  Total Time          {:.2}s", metrics.total_time_secs),
        format!("  Avg Time/Criterion  {:.2}s", metrics.avg_time_secs),
        format!("  Avg Attempts        {:.1}", metrics.avg_attempts),
        format!("  Avg Confidence      {:.0}%", metrics.avg_confidence * 100.0),
    ]
    .join("\n")
}

/// Writes the enabled artifacts as `<stem>_audit_report.{json,txt}` and returns their paths.
pub fn save_report(
    report: &AuditReport,
    directory: &Path,
    save_json: bool,
    save_txt: bool,
) -> Result<Vec<PathBuf>> {
    let stem = Path::new(&report.document)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let mut written = Vec::new();

    if save_json {
        let path = directory.join(format!("{stem}_audit_report.json"));
        write_json_pretty(&path, report)?;
        written.push(path);
    }
    if save_txt {
        let path = directory.join(format!("{stem}_audit_report.txt"));
        write_text(&path, &render_text(report))?;
        written.push(path);
    }

    for path in &written {
        info!(path = %path.display(), "report written");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::model::TerminalState;

    fn outcome(
        status: Verdict,
        confidence: f64,
        pages: Vec<u32>,
        evidence: &str,
    ) -> CriterionOutcome {
        CriterionOutcome {
            criterion: "Is there a registered tax ID?".to_string(),
            threshold: 0.8,
            status,
            confidence,
            evidence_text: evidence.to_string(),
            cited_pages: pages,
            attempts: 1,
            terminal_state: TerminalState::Sufficient,
            cancelled: false,
            queries: vec!["Is there a registered tax ID?".to_string()],
        }
    }

    fn metric(duration_secs: f64, attempts: usize, confidence: f64) -> CriterionMetrics {
        CriterionMetrics {
            index: 0,
            criterion: "c".to_string(),
            duration_secs,
            attempts,
            confidence,
        }
    }

    #[test]
    fn compliance_rate_rounds_to_two_decimals() {
        assert_eq!(compliance_rate(1, 2), 33.33);
        assert_eq!(compliance_rate(2, 1), 66.67);
        assert_eq!(compliance_rate(3, 0), 100.0);
        assert_eq!(compliance_rate(0, 0), 0.0);
    }

    #[test]
    fn report_counts_verdicts() {
        let report = AuditReport::assemble(
            "contract.pdf",
            "contract",
            vec![
                outcome(Verdict::Present, 0.95, vec![2], "CNPJ 12.345"),
                outcome(Verdict::Absent, 0.4, vec![], ""),
                outcome(Verdict::Present, 0.85, vec![5], "Penalty clause"),
            ],
            AuditMetrics::default(),
        );
        assert_eq!(report.total_criteria, 3);
        assert_eq!(report.criteria_present, 2);
        assert_eq!(report.criteria_absent, 1);
        assert_eq!(report.compliance_rate, 66.67);
    }

    #[test]
    fn text_report_lists_pages_and_truncates_evidence() {
        let long_evidence = "x".repeat(150);
        let report = AuditReport::assemble(
            "contract.pdf",
            "contract",
            vec![
                outcome(Verdict::Present, 0.95, vec![2, 5], &long_evidence),
                outcome(Verdict::Absent, 0.0, vec![], "not found"),
            ],
            AuditMetrics::default(),
        );
        let text = render_text(&report);

        assert!(text.starts_with(&"=".repeat(70)));
        assert!(text.contains("Compliance Rate: 50%"));
        assert!(text.contains("   Confidence: 95%"));
        assert!(text.contains("   Pages: 2, 5"));
        assert!(text.contains("   Pages: N/A"));
        assert!(text.contains(&format!("   Evidence: {}...", "x".repeat(100))));
        assert!(text.contains("   Evidence: not found\n"));
    }

    #[test]
    fn metrics_average_over_criteria() {
        let metrics = AuditMetrics::from_criteria(
            vec![metric(2.0, 1, 0.9), metric(4.0, 3, 0.5)],
            Duration::from_secs(7),
        );
        assert_eq!(metrics.total_time_secs, 7.0);
        assert_eq!(metrics.avg_time_secs, 3.0);
        assert_eq!(metrics.avg_attempts, 2.0);
        assert!((metrics.avg_confidence - 0.7).abs() < 1e-12);
        assert!(render_metrics(&metrics).contains("Avg Attempts        2.0"));
    }

    #[test]
    fn save_report_writes_enabled_artifacts() {
        let dir = TempDir::new().expect("tempdir");
        let report = AuditReport::assemble(
            "docs/contract.pdf",
            "contract",
            vec![outcome(Verdict::Present, 0.9, vec![1], "ok")],
            AuditMetrics::default(),
        );

        let written = save_report(&report, dir.path(), true, false).expect("save");
        assert_eq!(written, vec![dir.path().join("contract_audit_report.json")]);
        let json = std::fs::read_to_string(&written[0]).expect("read");
        assert!(json.contains("\"status\": \"PRESENT\""));
        assert!(json.contains("\"compliance_rate\": 100.0"));
    }
}
