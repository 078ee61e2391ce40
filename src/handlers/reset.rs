use axum::{Json, extract::State};
use std::sync::Arc;

use crate::error::AdmissionError;
use crate::models::{ResetRequest, SuccessResponse, validate_identifier};
use crate::state::AppState;

pub async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ResetRequest>,
) -> Result<Json<SuccessResponse>, AdmissionError> {
    let identifier = validate_identifier(&payload.identifier)?;
    state.coordinator.reset_limit(identifier).await?;
    Ok(Json(SuccessResponse::ok()))
}
