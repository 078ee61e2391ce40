//! CAPTCHA gate: the sticky "verification required" flag on a record, and
//! the Turnstile client that proves a human solved the challenge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::CaptchaConfig;
use crate::error::CaptchaError;
use crate::rate_limit::IdentifierRecord;

/// Raises the CAPTCHA requirement once the window count reaches the
/// high-frequency threshold. Call after the count was incremented.
/// Returns true only on the transition into the required state.
pub fn note_request(record: &mut IdentifierRecord, config: &CaptchaConfig) -> bool {
    if !config.enabled || record.captcha_required {
        return false;
    }
    if record.count >= config.high_frequency_threshold {
        record.captcha_required = true;
        return true;
    }
    false
}

/// Lifts the requirement after a successful verification.
pub fn clear(record: &mut IdentifierRecord, now: DateTime<Utc>) {
    record.captcha_required = false;
    record.captcha_verified_at = Some(now);
}

/// Result of `verify_captcha` as handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerifyOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(reason: &CaptchaError) -> Self {
        Self {
            success: false,
            error: Some(reason.to_string()),
        }
    }
}

/// Something that can check a CAPTCHA token against a provider.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(
        &self,
        secret: &str,
        token: &str,
        remote_ip: Option<&str>,
    ) -> Result<(), CaptchaError>;
}

// siteverify request body
#[derive(Serialize)]
struct SiteverifyRequest<'a> {
    secret: &'a str,
    response: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remoteip: Option<&'a str>,
}

// siteverify response body, only the fields we act on
#[derive(Deserialize)]
struct SiteverifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Cloudflare Turnstile `siteverify` client.
pub struct TurnstileVerifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl TurnstileVerifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    pub fn from_config(client: reqwest::Client, config: &CaptchaConfig) -> Self {
        Self::new(client, config.verify_url.clone(), config.timeout)
    }
}

fn transport_error(err: reqwest::Error) -> CaptchaError {
    if err.is_timeout() {
        CaptchaError::Timeout
    } else {
        CaptchaError::Transport(err.to_string())
    }
}

#[async_trait]
impl CaptchaVerifier for TurnstileVerifier {
    async fn verify(
        &self,
        secret: &str,
        token: &str,
        remote_ip: Option<&str>,
    ) -> Result<(), CaptchaError> {
        let body = SiteverifyRequest {
            secret,
            response: token,
            remoteip: remote_ip,
        };

        let res = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !res.status().is_success() {
            return Err(CaptchaError::Status(res.status().as_u16()));
        }

        let verdict = res.json::<SiteverifyResponse>().await.map_err(|e| {
            if e.is_timeout() {
                CaptchaError::Timeout
            } else {
                CaptchaError::Malformed(e.to_string())
            }
        })?;

        if verdict.success {
            Ok(())
        } else {
            Err(CaptchaError::Rejected(verdict.error_codes))
        }
    }
}
