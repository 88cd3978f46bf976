//! Core data types for the answer engine
//!
//! Provides:
//! - `Route`, the classification decision as a tagged enum
//! - Pipeline results for the table and narrative sides
//! - The fused answer and the outcome returned to callers

use serde::{Deserialize, Serialize};
use std::fmt;

use tandem_common::db::TableRow;

/// Classification decision for a question.
///
/// A question always needs at least one pipeline, so the invalid
/// "neither" combination cannot be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Route {
    /// Structured-table lookup only
    Table { sub_query: String },
    /// Narrative retrieval only
    Narrative { sub_query: String },
    /// Both pipelines, fused afterwards
    Both {
        table_sub_query: String,
        narrative_sub_query: String,
    },
}

impl Route {
    pub fn kind(&self) -> RouteKind {
        match self {
            Route::Table { .. } => RouteKind::Table,
            Route::Narrative { .. } => RouteKind::Narrative,
            Route::Both { .. } => RouteKind::Both,
        }
    }

    pub fn needs_table(&self) -> bool {
        matches!(self, Route::Table { .. } | Route::Both { .. })
    }

    pub fn needs_narrative(&self) -> bool {
        matches!(self, Route::Narrative { .. } | Route::Both { .. })
    }

    pub fn table_sub_query(&self) -> Option<&str> {
        match self {
            Route::Table { sub_query } => Some(sub_query),
            Route::Both {
                table_sub_query, ..
            } => Some(table_sub_query),
            Route::Narrative { .. } => None,
        }
    }

    pub fn narrative_sub_query(&self) -> Option<&str> {
        match self {
            Route::Narrative { sub_query } => Some(sub_query),
            Route::Both {
                narrative_sub_query,
                ..
            } => Some(narrative_sub_query),
            Route::Table { .. } => None,
        }
    }
}

/// Route discriminant for logging, metrics, and API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    Table,
    Narrative,
    Both,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Table => "table",
            RouteKind::Narrative => "narrative",
            RouteKind::Both => "both",
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure kinds the table pipeline folds into its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableErrorKind {
    /// The synthesized query never became valid SQL for the store
    SyntaxError,
    /// The query ran but matched nothing
    NoResults,
    /// The store was unreachable or the call timed out
    ConnectionError,
}

/// Failure kinds the narrative pipeline folds into its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeErrorKind {
    /// Every retrieved passage scored below the relevance threshold
    NoRelevantContext,
    /// The language model failed to produce an answer
    ModelError,
}

/// Output of the table pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredResult {
    /// Deduplicated result rows in query order
    pub rows: Vec<TableRow>,
    /// Natural-language rendering of the rows
    pub answer_text: String,
    /// The SQL that was executed, when synthesis got that far
    pub synthetic_query: Option<String>,
    pub succeeded: bool,
    pub error_kind: Option<TableErrorKind>,
}

impl StructuredResult {
    pub fn success(rows: Vec<TableRow>, answer_text: String, synthetic_query: String) -> Self {
        Self {
            rows,
            answer_text,
            synthetic_query: Some(synthetic_query),
            succeeded: true,
            error_kind: None,
        }
    }

    pub fn failure(kind: TableErrorKind, synthetic_query: Option<String>) -> Self {
        Self {
            rows: Vec::new(),
            answer_text: String::new(),
            synthetic_query,
            succeeded: false,
            error_kind: Some(kind),
        }
    }
}

/// Output of the narrative pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct NarrativeResult {
    pub answer_text: String,
    /// Passages that cleared the relevance threshold and went into the
    /// context block
    pub retrieved_passage_count: usize,
    pub succeeded: bool,
    pub error_kind: Option<NarrativeErrorKind>,
}

impl NarrativeResult {
    pub fn success(answer_text: String, retrieved_passage_count: usize) -> Self {
        Self {
            answer_text,
            retrieved_passage_count,
            succeeded: true,
            error_kind: None,
        }
    }

    pub fn failure(kind: NarrativeErrorKind, retrieved_passage_count: usize) -> Self {
        Self {
            answer_text: String::new(),
            retrieved_passage_count,
            succeeded: false,
            error_kind: Some(kind),
        }
    }
}

/// Which pipelines contributed to a fused answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Table,
    Narrative,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Table => "table",
            SourceKind::Narrative => "narrative",
        }
    }
}

/// The merged answer produced by the fusion engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedAnswer {
    pub text: String,
    /// Empty when no pipeline produced anything usable
    pub source_kinds: Vec<SourceKind>,
}

/// Everything `answer()` reports back to the caller
#[derive(Debug, Clone, Serialize)]
pub struct AnswerOutcome {
    pub text: String,
    pub source_kinds: Vec<SourceKind>,
    pub classification: RouteKind,
    pub timing_ms: u64,
}

/// Side-by-side run of the routed engine and a narrative-only baseline
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonOutcome {
    pub routed: AnswerOutcome,
    pub baseline_text: String,
    pub baseline_timing_ms: u64,
}
