use axum::{Json, extract::State};
use std::sync::Arc;

use crate::error::AdmissionError;
use crate::models::{LimitRequest, SuccessResponse, validate_identifier};
use crate::state::AppState;

pub async fn record_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LimitRequest>,
) -> Result<Json<SuccessResponse>, AdmissionError> {
    let identifier = validate_identifier(&payload.identifier)?;
    state.coordinator.record_request(identifier, payload.tier).await?;
    Ok(Json(SuccessResponse::ok()))
}
