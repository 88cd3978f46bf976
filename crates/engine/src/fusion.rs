//! Fusion of structured and narrative answers
//!
//! When both pipelines ran, a completion model merges their outputs
//! into one response under a strict preservation rule. The model is
//! not trusted to honor that rule: after the merge, every structured
//! row is checked against the merged text and dropped rows are
//! appended verbatim. When only one pipeline ran, its output passes
//! through unchanged.

use std::sync::Arc;
use tracing::warn;

use tandem_common::db::{CellValue, TableRow};
use tandem_common::errors::Result;
use tandem_common::llm::CompletionClient;
use tandem_common::metrics;

use crate::table::format;
use crate::types::{
    FusedAnswer, NarrativeErrorKind, NarrativeResult, SourceKind, StructuredResult,
    TableErrorKind,
};

pub struct FusionEngine {
    llm: Arc<dyn CompletionClient>,
}

impl FusionEngine {
    pub fn new(llm: Arc<dyn CompletionClient>) -> Self {
        Self { llm }
    }

    /// Merge whatever the pipelines produced into one answer.
    pub async fn fuse(
        &self,
        structured: Option<StructuredResult>,
        narrative: Option<NarrativeResult>,
    ) -> Result<FusedAnswer> {
        match (structured, narrative) {
            (Some(structured), Some(narrative)) => self.fuse_pair(structured, narrative).await,
            (Some(structured), None) => Ok(structured_only(structured)),
            (None, Some(narrative)) => Ok(narrative_only(narrative)),
            (None, None) => Ok(no_answer()),
        }
    }

    async fn fuse_pair(
        &self,
        structured: StructuredResult,
        narrative: NarrativeResult,
    ) -> Result<FusedAnswer> {
        match (structured.succeeded, narrative.succeeded) {
            (true, true) => self.fuse_both(structured, narrative).await,
            (true, false) => Ok(FusedAnswer {
                text: format!(
                    "Note: narrative context was unavailable for this question.\n\n{}",
                    structured.answer_text.trim()
                ),
                source_kinds: vec![SourceKind::Table],
            }),
            (false, true) => Ok(FusedAnswer {
                text: format!(
                    "Note: structured data was unavailable for this question.\n\n{}",
                    narrative.answer_text.trim()
                ),
                source_kinds: vec![SourceKind::Narrative],
            }),
            (false, false) => Ok(no_answer()),
        }
    }

    async fn fuse_both(
        &self,
        structured: StructuredResult,
        narrative: NarrativeResult,
    ) -> Result<FusedAnswer> {
        let prompt = build_fusion_prompt(&structured, &narrative);
        let merged = match self.llm.complete(&prompt).await {
            Ok(merged) => merged.trim().to_string(),
            Err(err) if err.is_quota() => return Err(err),
            Err(err) => {
                warn!(error = %err, "Fusion call failed, concatenating pipeline outputs");
                format!(
                    "{}\n\n{}",
                    narrative.answer_text.trim(),
                    structured.answer_text.trim()
                )
            }
        };

        let text = ensure_rows_present(merged, &structured.rows);
        Ok(FusedAnswer {
            text,
            source_kinds: vec![SourceKind::Table, SourceKind::Narrative],
        })
    }
}

fn structured_only(structured: StructuredResult) -> FusedAnswer {
    if structured.succeeded {
        FusedAnswer {
            text: structured.answer_text,
            source_kinds: vec![SourceKind::Table],
        }
    } else {
        FusedAnswer {
            text: table_failure_text(structured.error_kind.as_ref()),
            source_kinds: Vec::new(),
        }
    }
}

fn narrative_only(narrative: NarrativeResult) -> FusedAnswer {
    if narrative.succeeded {
        FusedAnswer {
            text: narrative.answer_text,
            source_kinds: vec![SourceKind::Narrative],
        }
    } else {
        FusedAnswer {
            text: narrative_failure_text(narrative.error_kind.as_ref()),
            source_kinds: Vec::new(),
        }
    }
}

fn no_answer() -> FusedAnswer {
    FusedAnswer {
        text: "I could not produce an answer for this question. Please try rephrasing it."
            .to_string(),
        source_kinds: Vec::new(),
    }
}

fn table_failure_text(kind: Option<&TableErrorKind>) -> String {
    match kind {
        Some(TableErrorKind::NoResults) => "No matching rows were found for this question.",
        Some(TableErrorKind::ConnectionError) => "The structured data store could not be reached.",
        Some(TableErrorKind::SyntaxError) | None => {
            "A valid query could not be produced for this question."
        }
    }
    .to_string()
}

fn narrative_failure_text(kind: Option<&NarrativeErrorKind>) -> String {
    match kind {
        Some(NarrativeErrorKind::NoRelevantContext) => {
            "No relevant passages were found in the document."
        }
        Some(NarrativeErrorKind::ModelError) | None => {
            "The narrative answer could not be generated."
        }
    }
    .to_string()
}

fn build_fusion_prompt(structured: &StructuredResult, narrative: &NarrativeResult) -> String {
    format!(
        "You merge two answers to the same question into one coherent response.\n\n\
        CRITICAL PRESERVATION RULE: the table answer below contains {row_count} records. \
        Every single one must appear in your response. Never drop, summarize, or repeat \
        records; if the table answer has {row_count} items, your response has {row_count} items.\n\n\
        Formatting rules:\n\
        - Start with the direct answer, then the records, then the narrative context.\n\
        - Show overall aggregates once, never once per record.\n\
        - Write scores compactly: \"Home_Score: 4, Away_Score: 2\" reads as \"4-2\".\n\
        - Remove information duplicated between the two answers.\n\
        - Never mention tables, pipelines, or where each part came from.\n\n\
        Table answer:\n{table}\n\n\
        Narrative answer:\n{narrative_text}\n\n\
        Merged response:",
        row_count = structured.rows.len(),
        table = structured.answer_text.trim(),
        narrative_text = narrative.answer_text.trim(),
    )
}

/// Append any structured row the model dropped from the merged text.
fn ensure_rows_present(mut text: String, rows: &[TableRow]) -> String {
    let missing: Vec<&TableRow> = rows
        .iter()
        .filter(|row| !row_is_present(&text, row))
        .collect();
    if missing.is_empty() {
        return text;
    }

    metrics::record_fusion_row_append(missing.len());
    warn!(
        missing = missing.len(),
        total = rows.len(),
        "Merged answer dropped structured rows, appending them"
    );
    text.push_str("\n\nAdditional records:");
    for row in &missing {
        text.push('\n');
        text.push_str(&format::row_line(row));
    }
    text
}

/// A row counts as present when every non-null cell value appears
/// somewhere in the text. Cells are matched individually, so reshaped
/// lines ("4-2" instead of "Home_Score: 4, Away_Score: 2") still count.
fn row_is_present(text: &str, row: &TableRow) -> bool {
    row.columns.iter().all(|(_, value)| match value {
        CellValue::Null => true,
        other => {
            let rendered = other.to_string();
            let rendered = rendered.trim();
            rendered.is_empty() || text.contains(rendered)
        }
    })
}
