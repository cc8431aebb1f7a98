use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::model::{Chunk, Criterion, Hint};

pub const NO_CONTEXT: &str = "No context found.";

pub fn format_evidence(evidence: &[Arc<Chunk>]) -> String {
    if evidence.is_empty() {
        return NO_CONTEXT.to_string();
    }

    evidence
        .iter()
        .map(|chunk| {
            format!(
                "[File: {} | Type: {} | Page: {}]\n{}",
                chunk.doc_id,
                chunk.doc_type,
                chunk.page_number,
                chunk.text.trim()
            )
        })
        .collect::<Vec<String>>()
        .join("\n\n---\n\n")
}

fn format_pages(pages: &BTreeSet<u32>) -> String {
    if pages.is_empty() {
        return "None".to_string();
    }
    pages
        .iter()
        .map(u32::to_string)
        .collect::<Vec<String>>()
        .join(", ")
}

const RESPONSE_FORMAT: &str = r#"Respond EXACTLY in the JSON format below, without markdown and without additional text:
{
    "status": "PRESENT" or "ABSENT",
    "evidence": "EXACT QUOTE from DOCUMENT CONTEXT in its original language, or a brief explanation if absent",
    "confidence": 0.0 to 1.0,
    "relevant_pages": [page numbers taken from DOCUMENT CONTEXT]
}"#;

pub fn evaluation_prompt(
    criterion: &Criterion,
    evidence: &[Arc<Chunk>],
    hint: Option<&Hint>,
) -> String {
    let context = format_evidence(evidence);
    let mut prompt = String::new();

    let _ = writeln!(prompt, "You are a rigorous compliance auditor analyzing a document.");
    let _ = writeln!(prompt, "\nCRITERION TO EVALUATE:\n{}", criterion.text.trim());
    let _ = writeln!(
        prompt,
        "\nDOCUMENT CONTEXT (actual excerpts retrieved from the document):\n{context}"
    );

    match hint.and_then(|hint| hint.query_text().map(|answer| (answer, &hint.pages))) {
        Some((answer, pages)) => {
            let _ = writeln!(
                prompt,
                "\nPOSSIBLE ANSWER (hint from an initial full-document read; verify against the context):\n{answer}\nSuggested pages: {}",
                format_pages(pages)
            );
            prompt.push_str(
                "\nCRITICAL RULES:
1. DOCUMENT CONTEXT is the only source of evidence.
2. The POSSIBLE ANSWER is a hint and may be wrong or incomplete; verify every claim against DOCUMENT CONTEXT.
3. Never quote the POSSIBLE ANSWER as evidence and never cite a page that is not in DOCUMENT CONTEXT.
4. The \"evidence\" field MUST be copied exactly from DOCUMENT CONTEXT: no paraphrase, no translation, no summary.
5. If the criterion is ABSENT, briefly explain why.
6. Rate your confidence from 0.0 (none) to 1.0 (total).\n\n",
            );
        }
        None => {
            prompt.push_str(
                "\nCRITICAL RULES:
1. Decide whether the criterion is PRESENT or ABSENT in DOCUMENT CONTEXT.
2. The \"evidence\" field MUST be copied exactly from DOCUMENT CONTEXT: no paraphrase, no translation, no summary.
3. Keep the original language of the document in the evidence field.
4. If the criterion is ABSENT, briefly explain why.
5. Rate your confidence from 0.0 (none) to 1.0 (total).
6. Only cite pages that appear in DOCUMENT CONTEXT.\n\n",
            );
        }
    }

    prompt.push_str(RESPONSE_FORMAT);
    prompt
}

pub fn reformulation_prompt(
    criterion: &Criterion,
    prior_queries: &[String],
    evidence_summary: &str,
    max_queries: usize,
) -> String {
    let tried = prior_queries
        .iter()
        .map(|query| format!("- {query}"))
        .collect::<Vec<String>>()
        .join("\n");
    let summary = if evidence_summary.trim().is_empty() {
        "Nothing relevant found yet."
    } else {
        evidence_summary.trim()
    };

    format!(
        "You are searching a document for information that verifies this criterion:
\"{criterion}\"

Queries already tried (do not repeat them):
{tried}

Evidence found so far (insufficient):
{summary}

Generate up to {max_queries} alternative search queries to find this information.
Use synonyms, related terms, or a different angle.

Respond ONLY with the queries, one per line, without numbering or explanations.",
        criterion = criterion.text.trim(),
    )
}

pub fn hint_prompt(criterion: &Criterion, document_text: &str) -> String {
    format!(
        "You are an expert document analyst. Find information in a document that answers a specific audit criterion.

AUDIT CRITERION TO FIND:
{criterion}

DOCUMENT CONTENT:
{document_text}

INSTRUCTIONS:
1. Read the entire document content.
2. Find any information that directly or indirectly answers the criterion.
3. If you find it, summarize the key points and note which pages contain them.
4. If nothing relevant is found, say so clearly.

Respond ONLY in valid JSON (no markdown, no additional text):
{{
    \"found\": true or false,
    \"answer\": \"concise summary of the relevant information, or empty string if not found\",
    \"relevant_pages\": [page numbers where the information appears, or empty list]
}}",
        criterion = criterion.text.trim(),
    )
}
