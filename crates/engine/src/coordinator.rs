//! Answer coordination across routing, pipelines, and fusion
//!
//! [`AnswerEngine`] owns the router, both pipelines, the fusion stage,
//! and the schema cache, and drives one question through the whole
//! flow: classify, run the routed pipeline or both concurrently, fuse,
//! and report timing.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use tandem_common::config::AppConfig;
use tandem_common::db::RelationalStore;
use tandem_common::errors::{AppError, Result};
use tandem_common::llm::CompletionClient;
use tandem_common::schema::{CachedSchemaProvider, SchemaDescriptor, SchemaStore};

use crate::fusion::FusionEngine;
use crate::narrative::NarrativePipeline;
use crate::retrieval::VectorIndex;
use crate::router::Router;
use crate::table::TablePipeline;
use crate::types::{AnswerOutcome, ComparisonOutcome, Route, StructuredResult, TableErrorKind};

pub struct AnswerEngine {
    router: Router,
    table: TablePipeline,
    narrative: NarrativePipeline,
    fusion: FusionEngine,
    schemas: CachedSchemaProvider,
}

impl AnswerEngine {
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        store: Arc<dyn RelationalStore>,
        index: Arc<dyn VectorIndex>,
        schema_store: Arc<dyn SchemaStore>,
        config: &AppConfig,
    ) -> Self {
        let call_timeout = config.call_timeout();
        Self {
            router: Router::new(llm.clone(), &config.cache),
            table: TablePipeline::new(llm.clone(), store, call_timeout),
            narrative: NarrativePipeline::new(
                llm.clone(),
                index,
                config.retrieval.clone(),
                call_timeout,
            ),
            fusion: FusionEngine::new(llm),
            schemas: CachedSchemaProvider::new(schema_store, config.schema_ttl()),
        }
    }

    /// Answer a question against one document.
    pub async fn answer(&self, question: &str, document_id: Uuid) -> Result<AnswerOutcome> {
        let question = validate_question(question)?;
        let started = Instant::now();

        let schema = self.schema_for(document_id).await;
        let route = self
            .router
            .classify(question, schema.as_ref(), document_id)
            .await?;
        let classification = route.kind();

        let fused = match &route {
            Route::Table { sub_query } => {
                let structured = self.run_table(sub_query, schema.as_ref()).await?;
                self.fusion.fuse(Some(structured), None).await?
            }
            Route::Narrative { sub_query } => {
                let narrative = self.narrative.query(sub_query, document_id).await?;
                self.fusion.fuse(None, Some(narrative)).await?
            }
            Route::Both {
                table_sub_query,
                narrative_sub_query,
            } => {
                let (structured, narrative) = tokio::join!(
                    self.run_table(table_sub_query, schema.as_ref()),
                    self.narrative.query(narrative_sub_query, document_id),
                );
                self.fusion.fuse(Some(structured?), Some(narrative?)).await?
            }
        };

        let timing_ms = started.elapsed().as_millis() as u64;
        info!(
            route = %classification,
            timing_ms,
            sources = fused.source_kinds.len(),
            "Question answered"
        );
        Ok(AnswerOutcome {
            text: fused.text,
            source_kinds: fused.source_kinds,
            classification,
            timing_ms,
        })
    }

    /// Expose the routing decision without running any pipeline.
    pub async fn classify_only(&self, question: &str, document_id: Uuid) -> Result<Route> {
        let question = validate_question(question)?;
        let schema = self.schema_for(document_id).await;
        self.router
            .classify(question, schema.as_ref(), document_id)
            .await
    }

    /// Answer through the router and, separately, through the narrative
    /// pipeline alone for a side-by-side comparison.
    pub async fn compare(&self, question: &str, document_id: Uuid) -> Result<ComparisonOutcome> {
        let routed = self.answer(question, document_id).await?;

        let started = Instant::now();
        let baseline = self
            .narrative
            .query(question.trim(), document_id)
            .await?;
        let baseline_fused = self.fusion.fuse(None, Some(baseline)).await?;
        Ok(ComparisonOutcome {
            routed,
            baseline_text: baseline_fused.text,
            baseline_timing_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// A schema lookup failure degrades to a narrative-only route
    /// instead of failing the question.
    async fn schema_for(&self, document_id: Uuid) -> Option<SchemaDescriptor> {
        match self.schemas.get(document_id).await {
            Ok(schema) => schema,
            Err(err) => {
                warn!(error = %err, "Schema lookup failed, continuing without table route");
                None
            }
        }
    }

    async fn run_table(
        &self,
        sub_question: &str,
        schema: Option<&SchemaDescriptor>,
    ) -> Result<StructuredResult> {
        match schema {
            Some(schema) => self.table.query(sub_question, schema).await,
            // The router never routes to tables without a schema.
            None => Ok(StructuredResult::failure(TableErrorKind::NoResults, None)),
        }
    }
}

fn validate_question(question: &str) -> Result<&str> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation {
            message: "question must not be empty".to_string(),
            field: Some("question".to_string()),
        });
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::InMemoryVectorIndex;
    use chrono::Utc;
    use tandem_common::db::MockRelationalStore;
    use tandem_common::llm::MockCompletionClient;
    use tandem_common::schema::{ColumnDescriptor, InMemorySchemaStore, TableSchema};

    fn test_schema(document_id: Uuid) -> SchemaDescriptor {
        SchemaDescriptor {
            document_id,
            tables: vec![TableSchema {
                table_name: "doc_14f6_matches".to_string(),
                columns: vec![ColumnDescriptor {
                    name: "Winner".to_string(),
                    data_type: "VARCHAR".to_string(),
                }],
                indexed_columns: vec![],
            }],
            created_at: Utc::now(),
        }
    }

    fn engine_with(
        llm: Arc<MockCompletionClient>,
        store: Arc<MockRelationalStore>,
        index: Arc<InMemoryVectorIndex>,
        schema_store: InMemorySchemaStore,
    ) -> AnswerEngine {
        AnswerEngine::new(
            llm,
            store,
            index,
            Arc::new(schema_store),
            &AppConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let engine = engine_with(
            Arc::new(MockCompletionClient::fixed("unused")),
            Arc::new(MockRelationalStore::with_rows(vec![])),
            Arc::new(InMemoryVectorIndex::new()),
            InMemorySchemaStore::new(),
        );
        let err = engine.answer("   ", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));

        let err = engine.classify_only("", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_classify_only_runs_no_pipeline() {
        let doc = Uuid::new_v4();
        let llm = Arc::new(MockCompletionClient::fixed(
            r#"{"status": "table", "table_sub_query": "winners", "narrative_sub_query": ""}"#,
        ));
        let store = Arc::new(MockRelationalStore::with_rows(vec![]));
        let index = Arc::new(InMemoryVectorIndex::new());
        let engine = engine_with(
            llm.clone(),
            store.clone(),
            index.clone(),
            InMemorySchemaStore::new().with_schema(test_schema(doc)),
        );

        let route = engine.classify_only("Who won finals?", doc).await.unwrap();
        assert_eq!(route.kind(), crate::types::RouteKind::Table);
        assert_eq!(llm.calls(), 1);
        assert!(store.executed().is_empty());
        assert_eq!(index.calls(), 0);
    }

    #[tokio::test]
    async fn test_document_without_schema_answers_from_narrative() {
        let doc = Uuid::new_v4();
        // The classifier wants the table route, but no schema exists,
        // so the question resolves through the narrative pipeline.
        let llm = Arc::new(MockCompletionClient::scripted_then_fixed(
            vec![tandem_common::llm::MockReply::Text(
                r#"{"status": "table", "table_sub_query": "winners", "narrative_sub_query": ""}"#
                    .to_string(),
            )],
            "The document mentions Uruguay as the winner.",
        ));
        let store = Arc::new(MockRelationalStore::with_rows(vec![]));
        let index =
            Arc::new(InMemoryVectorIndex::new().with_passage(doc, "Uruguay won the cup.", 0.9));
        let engine = engine_with(llm, store.clone(), index, InMemorySchemaStore::new());

        let outcome = engine.answer("Who won finals?", doc).await.unwrap();
        assert_eq!(outcome.classification, crate::types::RouteKind::Narrative);
        assert_eq!(outcome.text, "The document mentions Uruguay as the winner.");
        assert!(store.executed().is_empty());
    }
}
