//! Structured-query pipeline
//!
//! Runs a sub-question through synthesis, repair, execution, row
//! deduplication, and natural-language formatting. Failures along the
//! way fold into a failed [`StructuredResult`] carrying an error kind;
//! only a model quota error escapes as an `Err`.

pub mod format;
pub mod repair;
pub mod synthesis;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tandem_common::db::{RelationalStore, TableRow};
use tandem_common::errors::{AppError, Result};
use tandem_common::llm::CompletionClient;
use tandem_common::metrics;
use tandem_common::schema::SchemaDescriptor;

use crate::types::{StructuredResult, TableErrorKind};

pub struct TablePipeline {
    llm: Arc<dyn CompletionClient>,
    store: Arc<dyn RelationalStore>,
    call_timeout: Duration,
}

impl TablePipeline {
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        store: Arc<dyn RelationalStore>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            store,
            call_timeout,
        }
    }

    /// Run the full pipeline for one sub-question.
    pub async fn query(
        &self,
        sub_question: &str,
        schema: &SchemaDescriptor,
    ) -> Result<StructuredResult> {
        let started = Instant::now();
        let result = self.query_inner(sub_question, schema).await;
        let elapsed = started.elapsed().as_secs_f64();
        let succeeded = matches!(&result, Ok(outcome) if outcome.succeeded);
        metrics::record_pipeline("table", elapsed, succeeded);
        result
    }

    async fn query_inner(
        &self,
        sub_question: &str,
        schema: &SchemaDescriptor,
    ) -> Result<StructuredResult> {
        let sql = match synthesis::synthesize(self.llm.as_ref(), sub_question, schema).await {
            Ok(sql) => sql,
            Err(err) if err.is_quota() => return Err(err),
            Err(err) => {
                warn!(error = %err, "SQL synthesis failed");
                return Ok(StructuredResult::failure(TableErrorKind::SyntaxError, None));
            }
        };

        let repaired = repair::repair(&sql, schema);
        if !repaired.applied.is_empty() {
            debug!(transforms = ?repaired.applied, "Repaired synthesized SQL");
        }

        let (mut rows, kind_on_fail) = match self.execute(&repaired.sql).await {
            Ok(rows) => (rows, TableErrorKind::NoResults),
            Err(err) => {
                warn!(error = %err, sql = %repaired.sql, "Synthesized query failed to execute");
                (Vec::new(), execution_error_kind(&err))
            }
        };

        // A failed or empty execution gets one shot at the hard-coded
        // recovery query before the pipeline reports failure.
        if rows.is_empty() {
            if let Some(fallback) = repair::fallback_query(sub_question, schema) {
                metrics::record_sql_fallback();
                info!("Synthesized query produced no rows, trying fallback query");
                match self.execute(&fallback).await {
                    Ok(fallback_rows) => rows = fallback_rows,
                    Err(err) => warn!(error = %err, "Fallback query failed"),
                }
            }
        }

        if rows.is_empty() {
            return Ok(StructuredResult::failure(
                kind_on_fail,
                Some(repaired.sql),
            ));
        }

        let rows = dedup_rows(rows);
        let answer_text = format::format_rows(&rows);
        if answer_text.is_empty() {
            return Ok(StructuredResult::failure(
                TableErrorKind::NoResults,
                Some(repaired.sql),
            ));
        }
        Ok(StructuredResult::success(rows, answer_text, repaired.sql))
    }

    async fn execute(&self, sql: &str) -> Result<Vec<TableRow>> {
        match tokio::time::timeout(self.call_timeout, self.store.execute(sql)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::DatabaseConnection {
                message: format!("query timed out after {}ms", self.call_timeout.as_millis()),
            }),
        }
    }
}

/// Remove exact duplicate rows, keeping first occurrences in order.
fn dedup_rows(rows: Vec<TableRow>) -> Vec<TableRow> {
    let mut unique: Vec<TableRow> = Vec::with_capacity(rows.len());
    for row in rows {
        if !unique.contains(&row) {
            unique.push(row);
        }
    }
    unique
}

fn execution_error_kind(err: &AppError) -> TableErrorKind {
    match err {
        AppError::SqlSyntax { .. } | AppError::SqlExecution { .. } => TableErrorKind::SyntaxError,
        _ => TableErrorKind::ConnectionError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tandem_common::db::{CellValue, MockDbReply, MockRelationalStore};
    use tandem_common::llm::{MockCompletionClient, MockReply};
    use tandem_common::schema::{ColumnDescriptor, TableSchema};
    use uuid::Uuid;

    fn match_schema() -> SchemaDescriptor {
        SchemaDescriptor {
            document_id: Uuid::new_v4(),
            tables: vec![TableSchema {
                table_name: "doc_14f6_matches".to_string(),
                columns: [
                    "Year",
                    "Round",
                    "Winner",
                    "Home_Team",
                    "Away_Team",
                    "Home_Score",
                    "Away_Score",
                ]
                .iter()
                .map(|name| ColumnDescriptor {
                    name: name.to_string(),
                    data_type: "VARCHAR".to_string(),
                })
                .collect(),
                indexed_columns: vec![],
            }],
            created_at: Utc::now(),
        }
    }

    fn winner_row(name: &str) -> TableRow {
        TableRow::new(vec![(
            "Winner".to_string(),
            CellValue::Text(name.to_string()),
        )])
    }

    fn pipeline(
        llm: Arc<MockCompletionClient>,
        store: Arc<MockRelationalStore>,
    ) -> TablePipeline {
        TablePipeline::new(llm, store, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_query_happy_path() {
        let llm = Arc::new(MockCompletionClient::fixed(
            "SELECT winner FROM \"doc_14f6_matches\" WHERE year = 1970",
        ));
        let store = Arc::new(MockRelationalStore::with_rows(vec![winner_row("Brazil")]));
        let result = pipeline(llm, store.clone())
            .query("Who won in 1970?", &match_schema())
            .await
            .unwrap();

        assert!(result.succeeded);
        assert_eq!(result.answer_text, "The answer is: Brazil");
        // The store saw the repaired SQL, not the raw synthesis.
        let executed = store.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("\"Winner\""));
        assert!(executed[0].contains("\"Year\""));
        assert_eq!(
            result.synthetic_query.as_deref(),
            Some(executed[0].as_str())
        );
    }

    #[tokio::test]
    async fn test_query_deduplicates_rows() {
        let llm = Arc::new(MockCompletionClient::fixed(
            "SELECT winner FROM \"doc_14f6_matches\"",
        ));
        let store = Arc::new(MockRelationalStore::with_rows(vec![
            winner_row("Uruguay"),
            winner_row("Uruguay"),
            winner_row("Italy"),
        ]));
        let result = pipeline(llm, store)
            .query("Who won finals?", &match_schema())
            .await
            .unwrap();

        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.answer_text, "The answers are: Uruguay and Italy");
    }

    #[tokio::test]
    async fn test_synthesis_decline_folds_into_failure() {
        let llm = Arc::new(MockCompletionClient::fixed(
            "Cannot generate SQL for this query.",
        ));
        let store = Arc::new(MockRelationalStore::with_rows(vec![]));
        let result = pipeline(llm, store.clone())
            .query("Who won?", &match_schema())
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.error_kind, Some(TableErrorKind::SyntaxError));
        assert!(result.synthetic_query.is_none());
        assert!(store.executed().is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_quota_escapes() {
        let llm = Arc::new(MockCompletionClient::scripted(vec![MockReply::Quota]));
        let store = Arc::new(MockRelationalStore::with_rows(vec![]));
        let err = pipeline(llm, store)
            .query("Who won?", &match_schema())
            .await
            .unwrap_err();
        assert!(err.is_quota());
    }

    #[tokio::test]
    async fn test_syntax_error_reported_with_query() {
        let llm = Arc::new(MockCompletionClient::fixed(
            "SELECT nope FROM \"doc_14f6_matches\"",
        ));
        let store = Arc::new(MockRelationalStore::failing(|| AppError::SqlSyntax {
            message: "column \"nope\" does not exist".to_string(),
        }));
        let result = pipeline(llm, store)
            .query("Who won?", &match_schema())
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.error_kind, Some(TableErrorKind::SyntaxError));
        assert!(result.synthetic_query.is_some());
    }

    #[tokio::test]
    async fn test_connection_error_kind() {
        let llm = Arc::new(MockCompletionClient::fixed(
            "SELECT winner FROM \"doc_14f6_matches\"",
        ));
        let store = Arc::new(MockRelationalStore::failing(|| {
            AppError::DatabaseConnection {
                message: "pool exhausted".to_string(),
            }
        }));
        let result = pipeline(llm, store)
            .query("Who won?", &match_schema())
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(TableErrorKind::ConnectionError));
    }

    #[tokio::test]
    async fn test_zero_rows_reports_no_results() {
        let llm = Arc::new(MockCompletionClient::fixed(
            "SELECT winner FROM \"doc_14f6_matches\" WHERE year = 2100",
        ));
        let store = Arc::new(MockRelationalStore::with_rows(vec![]));
        let result = pipeline(llm, store)
            .query("Who won in 2100?", &match_schema())
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.error_kind, Some(TableErrorKind::NoResults));
    }

    #[tokio::test]
    async fn test_fallback_query_recovers_zero_rows() {
        let llm = Arc::new(MockCompletionClient::fixed(
            "SELECT winner FROM \"doc_14f6_matches\" WHERE year = 1950 AND round = 'Final'",
        ));
        // First execution returns nothing, the fallback finds the winner.
        let store = Arc::new(MockRelationalStore::scripted(vec![
            MockDbReply::Rows(vec![]),
            MockDbReply::Rows(vec![winner_row("Uruguay")]),
        ]));
        let result = pipeline(llm, store.clone())
            .query("Who won the 1950 Final?", &match_schema())
            .await
            .unwrap();

        assert!(result.succeeded);
        assert_eq!(result.answer_text, "The answer is: Uruguay");
        let executed = store.executed();
        assert_eq!(executed.len(), 2);
        assert!(executed[1].contains("ILIKE '%Final%'"));
        assert!(executed[1].contains("'Uruguay'"));
    }

    #[tokio::test]
    async fn test_fallback_query_recovers_execution_failure() {
        let llm = Arc::new(MockCompletionClient::fixed(
            "SELECT winner FROM \"doc_14f6_matches\" WHERE year = 1950 AND round = 'Final'",
        ));
        let store = Arc::new(MockRelationalStore::scripted(vec![
            MockDbReply::Fail(|| AppError::SqlExecution {
                message: "relation does not exist".to_string(),
            }),
            MockDbReply::Rows(vec![winner_row("Uruguay")]),
        ]));
        let result = pipeline(llm, store)
            .query("Who won the 1950 Final?", &match_schema())
            .await
            .unwrap();

        assert!(result.succeeded);
        assert_eq!(result.answer_text, "The answer is: Uruguay");
    }

    #[tokio::test]
    async fn test_fallback_not_attempted_for_other_questions() {
        let llm = Arc::new(MockCompletionClient::fixed(
            "SELECT winner FROM \"doc_14f6_matches\" WHERE year = 1970",
        ));
        let store = Arc::new(MockRelationalStore::with_rows(vec![]));
        let result = pipeline(llm, store.clone())
            .query("Who won in 1970?", &match_schema())
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(store.executed().len(), 1);
    }
}
