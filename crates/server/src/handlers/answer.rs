//! Question answering handlers

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use tandem_common::errors::{AppError, Result};
use tandem_engine::{AnswerOutcome, ComparisonOutcome, Route, RouteKind};

/// Answer request
#[derive(Debug, Deserialize, Validate)]
pub struct AnswerRequest {
    #[validate(length(min = 1, max = 2000))]
    pub question: String,

    /// Document to answer against
    pub document_id: Uuid,
}

/// Classification response: the routing decision without the answer
#[derive(Serialize)]
pub struct ClassifyResponse {
    pub classification: RouteKind,
    pub route: Route,
}

/// Answer a question over one document
pub async fn answer(
    State(state): State<AppState>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<AnswerOutcome>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let outcome = state
        .engine
        .answer(&request.question, request.document_id)
        .await?;

    tracing::info!(
        document_id = %request.document_id,
        classification = %outcome.classification,
        timing_ms = outcome.timing_ms,
        "Answer request completed"
    );

    Ok(Json(outcome))
}

/// Classify a question without running the pipelines
pub async fn classify(
    State(state): State<AppState>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<ClassifyResponse>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let route = state
        .engine
        .classify_only(&request.question, request.document_id)
        .await?;

    Ok(Json(ClassifyResponse {
        classification: route.kind(),
        route,
    }))
}

/// Answer through the router and through plain retrieval side by side
pub async fn compare(
    State(state): State<AppState>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<ComparisonOutcome>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let comparison = state
        .engine
        .compare(&request.question, request.document_id)
        .await?;

    Ok(Json(comparison))
}
