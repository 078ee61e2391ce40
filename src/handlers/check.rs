use axum::{Json, extract::State};
use std::sync::Arc;

use crate::error::AdmissionError;
use crate::models::{LimitRequest, validate_identifier};
use crate::rate_limit::RateLimitResult;
use crate::state::AppState;

pub async fn check_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LimitRequest>,
) -> Result<Json<RateLimitResult>, AdmissionError> {
    let identifier = validate_identifier(&payload.identifier)?;
    let result = state.coordinator.check_limit(identifier, payload.tier).await?;
    Ok(Json(result))
}
