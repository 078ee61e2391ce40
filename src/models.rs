use serde::{Deserialize, Serialize};

use crate::error::AdmissionError;
use crate::rate_limit::Tier;

// Body of /check and /record
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct LimitRequest {
    pub identifier: String,
    pub tier: Tier,
}

// Body of /reset
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ResetRequest {
    pub identifier: String,
}

// Body of /verify-captcha
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCaptchaRequest {
    pub identifier: String,
    pub token: String,
    #[serde(default)]
    pub remote_ip: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

// What the browser needs to render the Turnstile widget
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptchaConfigResponse {
    pub enabled: bool,
    pub site_key: Option<String>,
}

// Boundary check, so blank identifiers never reach the coordinator
pub fn validate_identifier(identifier: &str) -> Result<&str, AdmissionError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        Err(AdmissionError::EmptyIdentifier)
    } else {
        Ok(trimmed)
    }
}
