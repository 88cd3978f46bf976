//! Tandem Answer Engine
//!
//! Answers natural-language questions over documents that carry both
//! narrative text and structured tables:
//! - A router classifies each question as table, narrative, or both
//! - The table pipeline synthesizes, repairs, and executes SQL
//! - The narrative pipeline retrieves passages and synthesizes prose
//! - The fusion engine merges the two without dropping structured rows

pub mod coordinator;
pub mod fusion;
pub mod narrative;
pub mod retrieval;
pub mod router;
pub mod table;
pub mod types;

pub use coordinator::AnswerEngine;
pub use types::{
    AnswerOutcome, ComparisonOutcome, FusedAnswer, NarrativeErrorKind, NarrativeResult, Route,
    RouteKind, SourceKind, StructuredResult, TableErrorKind,
};
