//! Narrative retrieval pipeline
//!
//! Retrieves the passages most similar to the sub-question, filters
//! them by a relevance floor, and asks the completion model to answer
//! strictly from that context. Retrieval breadth adapts to question
//! length. Failures fold into a failed [`NarrativeResult`]; only a
//! quota error escapes as an `Err`.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use tandem_common::config::RetrievalConfig;
use tandem_common::errors::Result;
use tandem_common::llm::CompletionClient;
use tandem_common::metrics;

use crate::retrieval::{ScoredPassage, VectorIndex};
use crate::types::{NarrativeErrorKind, NarrativeResult};

/// Retrieval breadth for a sub-question: terse questions get a tight
/// context, discursive ones a wide one, everything else the midpoint.
pub fn adaptive_top_k(sub_question: &str, config: &RetrievalConfig) -> usize {
    let words = sub_question.split_whitespace().count();
    if words < config.short_question_words {
        config.min_top_k
    } else if words > config.long_question_words {
        config.max_top_k
    } else {
        (config.min_top_k + config.max_top_k) / 2
    }
}

pub struct NarrativePipeline {
    llm: Arc<dyn CompletionClient>,
    index: Arc<dyn VectorIndex>,
    retrieval: RetrievalConfig,
    call_timeout: Duration,
}

impl NarrativePipeline {
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        index: Arc<dyn VectorIndex>,
        retrieval: RetrievalConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            index,
            retrieval,
            call_timeout,
        }
    }

    /// Answer one sub-question from the document's narrative text.
    pub async fn query(&self, sub_question: &str, document_id: Uuid) -> Result<NarrativeResult> {
        let started = Instant::now();
        let result = self.query_inner(sub_question, document_id).await;
        let elapsed = started.elapsed().as_secs_f64();
        let succeeded = matches!(&result, Ok(outcome) if outcome.succeeded);
        metrics::record_pipeline("narrative", elapsed, succeeded);
        result
    }

    async fn query_inner(
        &self,
        sub_question: &str,
        document_id: Uuid,
    ) -> Result<NarrativeResult> {
        let top_k = adaptive_top_k(sub_question, &self.retrieval);
        debug!(top_k, "Running narrative retrieval");

        let search = self.index.similarity_search(sub_question, top_k, document_id);
        let passages = match tokio::time::timeout(self.call_timeout, search).await {
            Ok(Ok(passages)) => passages,
            Ok(Err(err)) if err.is_quota() => return Err(err),
            Ok(Err(err)) => {
                warn!(error = %err, "Vector search failed");
                return Ok(NarrativeResult::failure(NarrativeErrorKind::ModelError, 0));
            }
            Err(_) => {
                warn!("Vector search timed out");
                return Ok(NarrativeResult::failure(NarrativeErrorKind::ModelError, 0));
            }
        };

        let relevant: Vec<ScoredPassage> = passages
            .into_iter()
            .filter(|passage| passage.score >= self.retrieval.min_score)
            .collect();
        if relevant.is_empty() {
            return Ok(NarrativeResult::failure(
                NarrativeErrorKind::NoRelevantContext,
                0,
            ));
        }

        let prompt = build_answer_prompt(sub_question, &relevant);
        let completion = self.llm.complete(&prompt);
        let answer = match tokio::time::timeout(self.call_timeout, completion).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(err)) if err.is_quota() => return Err(err),
            Ok(Err(err)) => {
                warn!(error = %err, "Narrative completion failed");
                return Ok(NarrativeResult::failure(
                    NarrativeErrorKind::ModelError,
                    relevant.len(),
                ));
            }
            Err(_) => {
                warn!("Narrative completion timed out");
                return Ok(NarrativeResult::failure(
                    NarrativeErrorKind::ModelError,
                    relevant.len(),
                ));
            }
        };

        Ok(NarrativeResult::success(
            answer.trim().to_string(),
            relevant.len(),
        ))
    }
}

/// Passages arrive sorted best first and keep that order in the prompt.
fn build_answer_prompt(sub_question: &str, passages: &[ScoredPassage]) -> String {
    let mut prompt = format!(
        "Answer the question using ONLY the context passages below. \
        If the context does not contain the answer, say so explicitly \
        instead of guessing.\n\n\
        Question: {sub_question}\n\nContext:\n"
    );
    for (i, passage) in passages.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n", i + 1, passage.text.trim()));
    }
    prompt.push_str("\nAnswer:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::InMemoryVectorIndex;
    use tandem_common::errors::AppError;
    use tandem_common::llm::{MockCompletionClient, MockReply};

    fn retrieval_config() -> RetrievalConfig {
        RetrievalConfig {
            min_top_k: 3,
            max_top_k: 5,
            short_question_words: 10,
            long_question_words: 20,
            min_score: 0.25,
        }
    }

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn test_adaptive_top_k_boundaries() {
        let config = retrieval_config();
        assert_eq!(adaptive_top_k(&words(9), &config), 3);
        assert_eq!(adaptive_top_k(&words(10), &config), 4);
        assert_eq!(adaptive_top_k(&words(20), &config), 4);
        assert_eq!(adaptive_top_k(&words(21), &config), 5);
    }

    fn pipeline(
        llm: Arc<MockCompletionClient>,
        index: Arc<InMemoryVectorIndex>,
    ) -> NarrativePipeline {
        NarrativePipeline::new(llm, index, retrieval_config(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_query_answers_from_context() {
        let doc = Uuid::new_v4();
        let llm = Arc::new(MockCompletionClient::fixed(
            "Uruguay hosted and won the first tournament in 1930.",
        ));
        let index = Arc::new(
            InMemoryVectorIndex::new()
                .with_passage(doc, "The first World Cup was held in Uruguay in 1930.", 0.91)
                .with_passage(doc, "Uruguay beat Argentina 4-2 in the final.", 0.84),
        );
        let result = pipeline(llm.clone(), index)
            .query("Who hosted the first World Cup?", doc)
            .await
            .unwrap();

        assert!(result.succeeded);
        assert_eq!(result.retrieved_passage_count, 2);
        assert_eq!(
            result.answer_text,
            "Uruguay hosted and won the first tournament in 1930."
        );

        // Both passages made it into the prompt, best first.
        let prompts = llm.prompts();
        let prompt = &prompts[0];
        let first = prompt.find("held in Uruguay").unwrap();
        let second = prompt.find("beat Argentina").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_low_scores_mean_no_relevant_context() {
        let doc = Uuid::new_v4();
        let llm = Arc::new(MockCompletionClient::fixed("should never be called"));
        let index = Arc::new(
            InMemoryVectorIndex::new()
                .with_passage(doc, "barely related text", 0.12)
                .with_passage(doc, "unrelated text", 0.05),
        );
        let result = pipeline(llm.clone(), index)
            .query("Who hosted the first World Cup?", doc)
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(
            result.error_kind,
            Some(NarrativeErrorKind::NoRelevantContext)
        );
        assert_eq!(result.retrieved_passage_count, 0);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_search_failure_folds_into_result() {
        let llm = Arc::new(MockCompletionClient::fixed("unused"));
        let index = Arc::new(InMemoryVectorIndex::failing(|| {
            AppError::DatabaseConnection {
                message: "index offline".to_string(),
            }
        }));
        let result = pipeline(llm, index)
            .query("Who hosted the first World Cup?", Uuid::new_v4())
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.error_kind, Some(NarrativeErrorKind::ModelError));
    }

    #[tokio::test]
    async fn test_completion_failure_keeps_passage_count() {
        let doc = Uuid::new_v4();
        let llm = Arc::new(MockCompletionClient::scripted(vec![MockReply::Error]));
        let index = Arc::new(InMemoryVectorIndex::new().with_passage(doc, "context", 0.8));
        let result = pipeline(llm, index)
            .query("Who hosted the first World Cup?", doc)
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.error_kind, Some(NarrativeErrorKind::ModelError));
        assert_eq!(result.retrieved_passage_count, 1);
    }

    #[tokio::test]
    async fn test_quota_escapes() {
        let doc = Uuid::new_v4();
        let llm = Arc::new(MockCompletionClient::scripted(vec![MockReply::Quota]));
        let index = Arc::new(InMemoryVectorIndex::new().with_passage(doc, "context", 0.8));
        let err = pipeline(llm, index)
            .query("Who hosted the first World Cup?", doc)
            .await
            .unwrap_err();
        assert!(err.is_quota());
    }
}
