use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::AuditError;
use crate::llm::{LanguageModel, extract_json_object};
use crate::model::{Criterion, Hint};
use crate::research::prompts::hint_prompt;
use crate::util::{CancelToken, RetryPolicy, retry_with_backoff, truncate_chars};

pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 120_000;

/// Page texts of one document, page 1 first.
#[derive(Debug, Clone, Default)]
pub struct DocumentText {
    pages: Vec<String>,
}

impl DocumentText {
    pub fn from_pages(pages: Vec<String>) -> Self {
        Self { pages }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Page-aligned slices of the labelled text, each at most `max_chars` long.
    /// Pages are never split across segments; a single page longer than
    /// `max_chars` becomes its own segment, truncated.
    pub fn segments(&self, max_chars: usize) -> Vec<String> {
        let mut segments = Vec::new();
        let mut current = Vec::<String>::new();
        let mut current_chars = 0_usize;

        for block in self.page_blocks() {
            // Counts the "\n\n" separator too.
            let block_chars = block.chars().count() + 2;
            if current_chars + block_chars > max_chars && !current.is_empty() {
                segments.push(current.join("\n\n"));
                current.clear();
                current_chars = 0;
            }
            current.push(block);
            current_chars += block_chars;
        }
        if !current.is_empty() {
            segments.push(current.join("\n\n"));
        }

        segments
            .iter()
            .map(|segment| truncate_chars(segment, max_chars).to_string())
            .collect()
    }

    fn page_blocks(&self) -> impl Iterator<Item = String> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(index, text)| format!("[Page {}]\n{}", index + 1, text.trim()))
    }
}

pub trait HintGenerator: Send + Sync {
    fn generate(&self, criterion: &Criterion, document: &DocumentText) -> Result<Hint, AuditError>;
}

/// Read-only per-criterion hint lookup handed to every session.
pub trait HintLookup: Send + Sync {
    fn hint_for(&self, criterion: &Criterion) -> Option<&Hint>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHints;

impl HintLookup for NoHints {
    fn hint_for(&self, _criterion: &Criterion) -> Option<&Hint> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct HintBook {
    hints: HashMap<usize, Hint>,
}

impl HintBook {
    pub fn insert(&mut self, criterion_index: usize, hint: Hint) {
        self.hints.insert(criterion_index, hint);
    }

    pub fn len(&self) -> usize {
        self.hints.len()
    }

    pub fn found_count(&self) -> usize {
        self.hints.values().filter(|hint| hint.found).count()
    }
}

impl HintLookup for HintBook {
    fn hint_for(&self, criterion: &Criterion) -> Option<&Hint> {
        self.hints.get(&criterion.index)
    }
}

pub struct LlmHintGenerator<'a> {
    model: &'a dyn LanguageModel,
    retry: RetryPolicy,
    max_document_chars: usize,
}

impl<'a> LlmHintGenerator<'a> {
    pub fn new(
        model: &'a dyn LanguageModel,
        retry: RetryPolicy,
        max_document_chars: usize,
    ) -> Self {
        Self {
            model,
            retry,
            max_document_chars,
        }
    }
}

impl HintGenerator for LlmHintGenerator<'_> {
    /// One request per document segment. Segment answers are merged; the
    /// criterion fails only when every segment failed.
    fn generate(&self, criterion: &Criterion, document: &DocumentText) -> Result<Hint, AuditError> {
        let segments = document.segments(self.max_document_chars);
        if segments.len() > 1 {
            debug!(
                criterion = criterion.index,
                segments = segments.len(),
                "document split for hint generation"
            );
        }

        let mut hints = Vec::with_capacity(segments.len());
        let mut first_error = None;
        for (segment_index, segment) in segments.iter().enumerate() {
            let prompt = hint_prompt(criterion, segment);
            let hint = retry_with_backoff(&self.retry, "hint generator", || {
                self.model.complete(&prompt)
            })
            .and_then(|raw| parse_hint(&raw, document.page_count()));
            match hint {
                Ok(hint) => hints.push(hint),
                Err(error) => {
                    warn!(
                        criterion = criterion.index,
                        segment = segment_index + 1,
                        error = %error,
                        "hint segment failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        match first_error {
            Some(error) if hints.is_empty() => Err(error),
            _ => Ok(merge_hints(hints)),
        }
    }
}

/// Found answers joined in segment order; pages of found segments only.
fn merge_hints(hints: Vec<Hint>) -> Hint {
    let found = hints.into_iter().filter(|hint| hint.found).collect::<Vec<Hint>>();
    Hint {
        found: !found.is_empty(),
        answer: found
            .iter()
            .map(|hint| hint.answer.as_str())
            .collect::<Vec<&str>>()
            .join(" "),
        pages: found.iter().flat_map(|hint| hint.pages.iter().copied()).collect(),
    }
}

#[derive(Debug, Deserialize)]
struct RawHint {
    #[serde(default)]
    found: bool,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    relevant_pages: Vec<Value>,
}

/// Pages outside `1..=page_count` are discarded rather than rejected.
pub fn parse_hint(raw: &str, page_count: usize) -> Result<Hint, AuditError> {
    let payload: RawHint = serde_json::from_str(extract_json_object(raw))
        .map_err(|error| AuditError::malformed(format!("hint is not valid json: {error}")))?;

    let pages = payload
        .relevant_pages
        .iter()
        .filter_map(|page| match page {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().parse::<u64>().ok(),
            _ => None,
        })
        .filter(|page| *page >= 1 && *page <= page_count as u64)
        .filter_map(|page| u32::try_from(page).ok())
        .collect::<BTreeSet<u32>>();

    let answer = payload.answer.trim().to_string();
    Ok(Hint {
        found: payload.found && !answer.is_empty(),
        answer,
        pages,
    })
}

/// One hint per criterion, generated concurrently on the current rayon pool.
/// A failure degrades that criterion to "no hint"; criteria not started
/// before cancellation get no hint either.
pub fn generate_hints(
    generator: &dyn HintGenerator,
    criteria: &[Criterion],
    document: &DocumentText,
    cancel: &CancelToken,
) -> HintBook {
    let generated = criteria
        .par_iter()
        .filter_map(|criterion| {
            if cancel.is_cancelled() {
                debug!(criterion = criterion.index, "hint skipped after cancellation");
                return None;
            }
            match generator.generate(criterion, document) {
                Ok(hint) => Some((criterion.index, hint)),
                Err(error) => {
                    warn!(
                        criterion = criterion.index,
                        error = %error,
                        "hint generation failed, continuing without hint"
                    );
                    None
                }
            }
        })
        .collect::<Vec<(usize, Hint)>>();

    let mut book = HintBook::default();
    for (index, hint) in generated {
        book.insert(index, hint);
    }
    info!(
        criteria = criteria.len(),
        hints = book.len(),
        found = book.found_count(),
        cancelled = cancel.is_cancelled(),
        "hint generation complete"
    );
    book
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::research::test_support::criterion;

    struct FlakyGenerator;

    impl HintGenerator for FlakyGenerator {
        fn generate(&self, criterion: &Criterion, _: &DocumentText) -> Result<Hint, AuditError> {
            if criterion.index == 1 {
                return Err(AuditError::Llm {
                    reason: "status=400".to_string(),
                });
            }
            Ok(Hint {
                found: true,
                answer: format!("answer {}", criterion.index),
                pages: BTreeSet::from([1]),
            })
        }
    }

    /// Answers from the segment that mentions the tax ID, fails on "broken"
    /// segments and counts every request.
    #[derive(Default)]
    struct SegmentModel {
        prompts: Mutex<Vec<String>>,
    }

    impl LanguageModel for SegmentModel {
        fn complete(&self, prompt: &str) -> Result<String, AuditError> {
            self.prompts.lock().expect("prompts").push(prompt.to_string());
            if prompt.contains("broken") {
                return Err(AuditError::Llm {
                    reason: "status=400".to_string(),
                });
            }
            let reply = if prompt.contains("Tax ID") {
                r#"{"found": true, "answer": "Tax ID on page 3", "relevant_pages": [3]}"#
            } else {
                r#"{"found": false, "answer": "", "relevant_pages": []}"#
            };
            Ok(reply.to_string())
        }
    }

    fn contract() -> DocumentText {
        DocumentText::from_pages(vec![
            "Cover".to_string(),
            "   ".to_string(),
            "Tax ID 12.345".to_string(),
        ])
    }

    #[test]
    fn segments_label_pages_and_skip_blank_ones() {
        assert_eq!(
            contract().segments(1_000),
            vec!["[Page 1]\nCover\n\n[Page 3]\nTax ID 12.345".to_string()]
        );
        assert!(DocumentText::default().segments(1_000).is_empty());
    }

    #[test]
    fn segments_never_split_a_page() {
        // "[Page 1]\nCover" is 14 chars, "[Page 3]\nTax ID 12.345" is 22.
        assert_eq!(
            contract().segments(30),
            vec![
                "[Page 1]\nCover".to_string(),
                "[Page 3]\nTax ID 12.345".to_string(),
            ]
        );
        assert_eq!(contract().segments(8), vec!["[Page 1]", "[Page 3]"]);
    }

    #[test]
    fn large_document_is_asked_once_per_segment() {
        let model = SegmentModel::default();
        let generator = LlmHintGenerator::new(&model, RetryPolicy::new(1, Duration::ZERO), 30);

        let hint = generator
            .generate(&criterion("tax id", 0.7), &contract())
            .expect("hint");
        assert!(hint.found);
        assert_eq!(hint.answer, "Tax ID on page 3");
        assert_eq!(hint.pages, BTreeSet::from([3]));
        assert_eq!(model.prompts.lock().expect("prompts").len(), 2);
    }

    #[test]
    fn one_failed_segment_keeps_the_others() {
        let model = SegmentModel::default();
        let generator = LlmHintGenerator::new(&model, RetryPolicy::new(1, Duration::ZERO), 30);
        let document = DocumentText::from_pages(vec![
            "broken scan".to_string(),
            "Tax ID 12.345".to_string(),
        ]);

        let hint = generator
            .generate(&criterion("tax id", 0.7), &document)
            .expect("hint");
        assert!(hint.found);

        let all_broken = DocumentText::from_pages(vec!["broken scan".to_string()]);
        let result = generator.generate(&criterion("tax id", 0.7), &all_broken);
        assert!(matches!(result, Err(AuditError::Llm { .. })));
    }

    #[test]
    fn parse_hint_drops_pages_outside_document() {
        let hint = parse_hint(
            r#"{"found": true, "answer": "CNPJ on cover", "relevant_pages": [1, "3", 0, 40]}"#,
            3,
        )
        .expect("hint");
        assert!(hint.found);
        assert_eq!(hint.pages, BTreeSet::from([1, 3]));
    }

    #[test]
    fn found_without_answer_is_not_found() {
        let hint = parse_hint(r#"{"found": true, "answer": "  "}"#, 3).expect("hint");
        assert!(!hint.found);
        assert!(hint.query_text().is_none());
    }

    #[test]
    fn failing_criterion_degrades_alone() {
        let mut criteria = vec![criterion("a", 0.7), criterion("b", 0.7), criterion("c", 0.7)];
        for (index, criterion) in criteria.iter_mut().enumerate() {
            criterion.index = index;
        }
        let book = generate_hints(
            &FlakyGenerator,
            &criteria,
            &DocumentText::default(),
            &CancelToken::new(),
        );

        assert_eq!(book.len(), 2);
        assert!(book.hint_for(&criteria[0]).is_some());
        assert!(book.hint_for(&criteria[1]).is_none());
        assert_eq!(
            book.hint_for(&criteria[2]).map(|hint| hint.answer.as_str()),
            Some("answer 2")
        );
    }

    #[test]
    fn expired_deadline_generates_no_hints() {
        let criteria = vec![criterion("a", 0.7), criterion("b", 0.7)];
        let model = SegmentModel::default();
        let generator = LlmHintGenerator::new(&model, RetryPolicy::new(3, Duration::ZERO), 1_000);
        let cancel = CancelToken::with_deadline(Instant::now());

        let book = generate_hints(&generator, &criteria, &contract(), &cancel);
        assert_eq!(book.len(), 0);
        assert!(model.prompts.lock().expect("prompts").is_empty());
    }
}
