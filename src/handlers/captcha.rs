use axum::{Json, extract::State};
use std::sync::Arc;

use crate::captcha::VerifyOutcome;
use crate::error::AdmissionError;
use crate::models::{CaptchaConfigResponse, VerifyCaptchaRequest, validate_identifier};
use crate::state::AppState;

pub async fn verify_captcha_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<VerifyCaptchaRequest>,
) -> Result<Json<VerifyOutcome>, AdmissionError> {
    let identifier = validate_identifier(&payload.identifier)?;
    let outcome = state
        .coordinator
        .verify_captcha_from(identifier, &payload.token, payload.remote_ip.as_deref())
        .await?;
    Ok(Json(outcome))
}

// Public widget settings; the secret stays on the server
pub async fn captcha_config_handler(State(state): State<Arc<AppState>>) -> Json<CaptchaConfigResponse> {
    let captcha = &state.coordinator.config().captcha;
    Json(CaptchaConfigResponse {
        enabled: captcha.enabled,
        site_key: captcha.site_key.clone(),
    })
}
