//! Question routing via language-model classification
//!
//! Provides:
//! - Prompt construction embedding the document's table schema
//! - Lenient parsing of the model's JSON reply
//! - A bounded decision cache so repeated questions skip the model call
//!
//! Parse failures and exhausted retries fall back to a narrative-only
//! route: a possibly incomplete prose answer beats no answer. Fallback
//! decisions are not cached, so the next ask gets a fresh attempt.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_common::cache::{keys, BoundedTtlCache};
use tandem_common::config::CacheConfig;
use tandem_common::errors::Result;
use tandem_common::llm::CompletionClient;
use tandem_common::metrics;
use tandem_common::schema::SchemaDescriptor;

use crate::types::Route;

/// Wire form of the model's classification reply
#[derive(Debug, Deserialize)]
struct RouteReply {
    #[serde(default)]
    status: String,
    #[serde(default)]
    table_sub_query: Option<String>,
    #[serde(default)]
    narrative_sub_query: Option<String>,
}

/// Classifies questions into routes, caching decisions per document
pub struct Router {
    llm: Arc<dyn CompletionClient>,
    cache: BoundedTtlCache<Route>,
}

impl Router {
    pub fn new(llm: Arc<dyn CompletionClient>, config: &CacheConfig) -> Self {
        Self {
            llm,
            cache: BoundedTtlCache::new(
                config.classification_max_entries,
                Duration::from_secs(config.classification_ttl_secs),
            ),
        }
    }

    /// Classify a question, consulting the decision cache first.
    ///
    /// Only a quota error escapes; any other model failure is retried
    /// once and then resolved to the narrative-only default.
    pub async fn classify(
        &self,
        question: &str,
        schema: Option<&SchemaDescriptor>,
        document_id: Uuid,
    ) -> Result<Route> {
        let key = keys::classification(question, document_id);
        if let Some(route) = self.cache.get(&key) {
            debug!(route = %route.kind(), "Classification cache hit");
            metrics::record_classification(route.kind().as_str(), true);
            return Ok(route);
        }

        let prompt = build_routing_prompt(question, schema);
        let raw = match self.llm.complete(&prompt).await {
            Ok(raw) => raw,
            Err(err) if err.is_quota() => return Err(err),
            Err(err) => {
                warn!(error = %err, "Classification call failed, retrying once");
                match self.llm.complete(&prompt).await {
                    Ok(raw) => raw,
                    Err(err) if err.is_quota() => return Err(err),
                    Err(err) => {
                        warn!(error = %err, "Classification retry failed, defaulting to narrative");
                        metrics::record_classification_fallback("model_error");
                        return Ok(narrative_default(question));
                    }
                }
            }
        };

        match parse_route_reply(&raw, question, schema.is_some()) {
            Some(route) => {
                info!(route = %route.kind(), "Question classified");
                metrics::record_classification(route.kind().as_str(), false);
                self.cache.insert(&key, route.clone());
                Ok(route)
            }
            None => {
                warn!("Unparseable classification reply, defaulting to narrative");
                metrics::record_classification_fallback("parse_error");
                Ok(narrative_default(question))
            }
        }
    }
}

fn narrative_default(question: &str) -> Route {
    Route::Narrative {
        sub_query: question.to_string(),
    }
}

/// Parse the model's reply into a route, or `None` when nothing usable
/// can be recovered.
fn parse_route_reply(raw: &str, question: &str, schema_present: bool) -> Option<Route> {
    let cleaned = extract_json(raw);
    let reply: RouteReply = match serde_json::from_str(&cleaned) {
        Ok(reply) => reply,
        Err(_) => return keyword_route(raw, question, schema_present),
    };

    let table_sub =
        non_empty(reply.table_sub_query).unwrap_or_else(|| question.to_string());
    let narrative_sub =
        non_empty(reply.narrative_sub_query).unwrap_or_else(|| question.to_string());

    let route = match reply.status.trim().to_lowercase().as_str() {
        "table" => Route::Table {
            sub_query: table_sub,
        },
        "narrative" => Route::Narrative {
            sub_query: narrative_sub,
        },
        "both" => Route::Both {
            table_sub_query: table_sub,
            narrative_sub_query: narrative_sub,
        },
        _ => return None,
    };
    Some(constrain_to_schema(route, schema_present))
}

/// Last-ditch salvage when the reply is not JSON: scan for route labels.
fn keyword_route(raw: &str, question: &str, schema_present: bool) -> Option<Route> {
    let lowered = raw.to_lowercase();
    let route = if lowered.contains("both") {
        Route::Both {
            table_sub_query: question.to_string(),
            narrative_sub_query: question.to_string(),
        }
    } else if lowered.contains("table") {
        Route::Table {
            sub_query: question.to_string(),
        }
    } else if lowered.contains("narrative") {
        Route::Narrative {
            sub_query: question.to_string(),
        }
    } else {
        return None;
    };
    Some(constrain_to_schema(route, schema_present))
}

/// A document without structured tables can never take the table route.
fn constrain_to_schema(route: Route, schema_present: bool) -> Route {
    if schema_present {
        return route;
    }
    match route {
        Route::Table { sub_query } => Route::Narrative { sub_query },
        Route::Both {
            narrative_sub_query,
            ..
        } => Route::Narrative {
            sub_query: narrative_sub_query,
        },
        narrative => narrative,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Strip markdown fences and slice to the outermost JSON object.
fn extract_json(raw: &str) -> String {
    let mut content = raw.trim();
    if let Some(stripped) = content.strip_prefix("```json") {
        content = stripped;
    } else if let Some(stripped) = content.strip_prefix("```") {
        content = stripped;
    }
    if let Some(stripped) = content.strip_suffix("```") {
        content = stripped;
    }
    let content = content.trim();

    match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if start < end => content[start..=end].to_string(),
        _ => content.to_string(),
    }
}

fn build_routing_prompt(question: &str, schema: Option<&SchemaDescriptor>) -> String {
    let schema_block = match schema {
        Some(schema) => schema.prompt_block(),
        None => "No structured tables are available for this document.".to_string(),
    };

    format!(
        "You are a query analyzer that routes questions to specialized pipelines \
        and writes a focused sub-question for each one.\n\n\
        AVAILABLE DATABASE SCHEMA:\n{schema_block}\n\n\
        Routing rules:\n\
        - \"table\": the question asks for specific values, counts, totals, averages, \
        or filtered lists that exist in the tables above.\n\
        - \"narrative\": the question asks for history, significance, explanations, \
        or background found in the document text.\n\
        - \"both\": the question explicitly asks for statistics AND the surrounding \
        context or achievements. Prefer a single pipeline unless both are truly needed.\n\n\
        Sub-questions stay natural language; never write SQL here.\n\n\
        Reply with ONLY a JSON object, no markdown:\n\
        {{\"status\": \"table\" | \"narrative\" | \"both\", \
        \"table_sub_query\": \"...\", \"narrative_sub_query\": \"...\"}}\n\n\
        Examples:\n\n\
        Question: What is the historical significance of the FIFA World Cup and when did it start?\n\
        {{\"status\": \"narrative\", \"table_sub_query\": \"\", \"narrative_sub_query\": \
        \"What is the historical significance of the FIFA World Cup and when did it start?\"}}\n\n\
        Question: What are the names of teams that won Final matches?\n\
        {{\"status\": \"table\", \"table_sub_query\": \
        \"What are the names of teams that won Final matches?\", \"narrative_sub_query\": \"\"}}\n\n\
        Question: Give a comprehensive overview of Uruguay's World Cup journey including \
        their match statistics and historical achievements.\n\
        {{\"status\": \"both\", \"table_sub_query\": \
        \"List all of Uruguay's matches with rounds, opponents, and scores\", \
        \"narrative_sub_query\": \
        \"What are Uruguay's historical World Cup achievements and significant moments?\"}}\n\n\
        Question: {question}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tandem_common::llm::{MockCompletionClient, MockReply};
    use tandem_common::schema::{ColumnDescriptor, TableSchema};

    fn test_schema() -> SchemaDescriptor {
        SchemaDescriptor {
            document_id: Uuid::new_v4(),
            tables: vec![TableSchema {
                table_name: "doc_1234_matches".to_string(),
                columns: vec![
                    ColumnDescriptor {
                        name: "Year".to_string(),
                        data_type: "INT".to_string(),
                    },
                    ColumnDescriptor {
                        name: "Winner".to_string(),
                        data_type: "VARCHAR".to_string(),
                    },
                ],
                indexed_columns: vec![],
            }],
            created_at: Utc::now(),
        }
    }

    fn test_config() -> CacheConfig {
        CacheConfig {
            schema_ttl_secs: 300,
            classification_max_entries: 100,
            classification_ttl_secs: 300,
        }
    }

    const TABLE_REPLY: &str = r#"{"status": "table", "table_sub_query": "How many draws?", "narrative_sub_query": ""}"#;

    #[tokio::test]
    async fn test_classify_caches_decision() {
        let llm = Arc::new(MockCompletionClient::fixed(TABLE_REPLY));
        let router = Router::new(llm.clone(), &test_config());
        let schema = test_schema();
        let doc = schema.document_id;

        let first = router
            .classify("How many matches ended in a draw?", Some(&schema), doc)
            .await
            .unwrap();
        let second = router
            .classify("how many matches ended in a draw?  ", Some(&schema), doc)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_classify_expired_entry_reissues_call() {
        let llm = Arc::new(MockCompletionClient::fixed(TABLE_REPLY));
        let config = CacheConfig {
            classification_ttl_secs: 0,
            ..test_config()
        };
        let router = Router::new(llm.clone(), &config);
        let schema = test_schema();
        let doc = schema.document_id;

        router.classify("q", Some(&schema), doc).await.unwrap();
        router.classify("q", Some(&schema), doc).await.unwrap();
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_quota_propagates_without_retry() {
        let llm = Arc::new(MockCompletionClient::scripted(vec![MockReply::Quota]));
        let router = Router::new(llm.clone(), &test_config());
        let schema = test_schema();

        let err = router
            .classify("q", Some(&schema), schema.document_id)
            .await
            .unwrap_err();
        assert!(err.is_quota());
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let llm = Arc::new(MockCompletionClient::scripted(vec![
            MockReply::Error,
            MockReply::Text(TABLE_REPLY.to_string()),
        ]));
        let router = Router::new(llm.clone(), &test_config());
        let schema = test_schema();

        let route = router
            .classify("q", Some(&schema), schema.document_id)
            .await
            .unwrap();
        assert_eq!(route.kind(), crate::types::RouteKind::Table);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_default_to_narrative() {
        let llm = Arc::new(MockCompletionClient::scripted(vec![
            MockReply::Error,
            MockReply::Error,
        ]));
        let router = Router::new(llm.clone(), &test_config());
        let schema = test_schema();

        let route = router
            .classify("What happened?", Some(&schema), schema.document_id)
            .await
            .unwrap();
        assert_eq!(
            route,
            Route::Narrative {
                sub_query: "What happened?".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_fallback_decisions_are_not_cached() {
        let llm = Arc::new(MockCompletionClient::scripted_then_fixed(
            vec![MockReply::Text("no structure here".to_string())],
            TABLE_REPLY,
        ));
        let router = Router::new(llm.clone(), &test_config());
        let schema = test_schema();
        let doc = schema.document_id;

        let first = router.classify("q", Some(&schema), doc).await.unwrap();
        assert_eq!(first.kind(), crate::types::RouteKind::Narrative);

        // The fallback was not cached, so the next ask reaches the model
        // again and gets the real decision.
        let second = router.classify("q", Some(&schema), doc).await.unwrap();
        assert_eq!(second.kind(), crate::types::RouteKind::Table);
        assert_eq!(llm.calls(), 2);
    }

    #[test]
    fn test_parse_fenced_reply() {
        let raw = "```json\n{\"status\": \"both\", \"table_sub_query\": \"stats\", \"narrative_sub_query\": \"history\"}\n```";
        let route = parse_route_reply(raw, "q", true).unwrap();
        assert_eq!(
            route,
            Route::Both {
                table_sub_query: "stats".to_string(),
                narrative_sub_query: "history".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_reply_with_chatter_around_json() {
        let raw = "Sure! Here is the decision:\n{\"status\": \"narrative\", \"narrative_sub_query\": \"why\"}\nHope that helps.";
        let route = parse_route_reply(raw, "q", true).unwrap();
        assert_eq!(
            route,
            Route::Narrative {
                sub_query: "why".to_string()
            }
        );
    }

    #[test]
    fn test_parse_empty_sub_queries_fall_back_to_question() {
        let raw = r#"{"status": "both", "table_sub_query": "", "narrative_sub_query": "  "}"#;
        let route = parse_route_reply(raw, "original question", true).unwrap();
        assert_eq!(route.table_sub_query(), Some("original question"));
        assert_eq!(route.narrative_sub_query(), Some("original question"));
    }

    #[test]
    fn test_parse_keyword_salvage() {
        let route = parse_route_reply("route this to the table pipeline", "q", true).unwrap();
        assert_eq!(route.kind(), crate::types::RouteKind::Table);

        assert!(parse_route_reply("no idea", "q", true).is_none());
    }

    #[test]
    fn test_parse_unknown_status_rejected() {
        // Valid JSON with an unknown status is rejected outright, without
        // falling back to the keyword scan.
        assert!(parse_route_reply(r#"{"status": "neither"}"#, "q", true).is_none());
    }

    #[test]
    fn test_missing_schema_forces_narrative() {
        let raw = r#"{"status": "both", "table_sub_query": "stats", "narrative_sub_query": "history"}"#;
        let route = parse_route_reply(raw, "q", false).unwrap();
        assert_eq!(
            route,
            Route::Narrative {
                sub_query: "history".to_string()
            }
        );

        let raw = r#"{"status": "table", "table_sub_query": "stats"}"#;
        let route = parse_route_reply(raw, "q", false).unwrap();
        assert_eq!(route.kind(), crate::types::RouteKind::Narrative);
    }

    #[test]
    fn test_prompt_embeds_schema_and_question() {
        let schema = test_schema();
        let prompt = build_routing_prompt("How many draws?", Some(&schema));
        assert!(prompt.contains("doc_1234_matches"));
        assert!(prompt.contains("Winner"));
        assert!(prompt.contains("How many draws?"));

        let prompt = build_routing_prompt("How many draws?", None);
        assert!(prompt.contains("No structured tables"));
    }
}
