use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AdmissionConfig;
use crate::suspicion;

/// Caller classification that picks the base limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Authenticated,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Authenticated => "authenticated",
        }
    }
}

/// Admission state kept for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierRecord {
    pub count: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub window_start: DateTime<Utc>,
    pub suspicion_score: u8,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_request_time: Option<DateTime<Utc>>,
    pub captcha_required: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub captcha_verified_at: Option<DateTime<Utc>>,
}

impl IdentifierRecord {
    // State of an identifier seen for the first time
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
            suspicion_score: 0,
            last_request_time: None,
            captcha_required: false,
            captcha_verified_at: None,
        }
    }

    pub fn reset_at(&self, config: &AdmissionConfig) -> DateTime<Utc> {
        self.window_start + config.window
    }

    /// Starts a fresh window once the current one has run its course.
    /// Returns true when the record changed and must be persisted.
    ///
    /// The CAPTCHA requirement is cleared only by explicit verification,
    /// never by time, so `captcha_required` is left alone here.
    pub fn roll_window(&mut self, now: DateTime<Utc>, config: &AdmissionConfig) -> bool {
        if now - self.window_start < config.window {
            return false;
        }
        self.count = 0;
        self.window_start = now;
        self.suspicion_score = self
            .suspicion_score
            .saturating_sub(config.suspicion.window_decay);
        true
    }

    /// Base limit for the tier, cut down while the caller looks suspicious.
    pub fn effective_limit(&self, tier: Tier, config: &AdmissionConfig) -> u32 {
        let base = config.tier_limit(tier);
        if suspicion::is_suspicious(self, &config.suspicion) {
            (f64::from(base) * config.suspicion.penalty_factor).floor() as u32
        } else {
            base
        }
    }

    /// Admission decision for the current window. Does not touch the record.
    pub fn evaluate(&self, tier: Tier, config: &AdmissionConfig) -> RateLimitResult {
        let reset_at = self.reset_at(config);
        let limit = self.effective_limit(tier, config);

        // CAPTCHA gating wins over the counting math
        if config.captcha.enabled && self.captcha_required {
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_at,
                captcha_required: true,
                limit,
            };
        }

        RateLimitResult {
            allowed: self.count < limit,
            remaining: limit.saturating_sub(self.count),
            reset_at,
            captcha_required: false,
            limit,
        }
    }
}

/// Answer to "may this identifier proceed right now".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub reset_at: DateTime<Utc>,
    pub captcha_required: bool,
    /// Effective limit for this window after any penalty.
    pub limit: u32,
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    CaptchaRequired,
    RateLimited { reset_at: DateTime<Utc> },
}

impl RateLimitResult {
    pub fn denial(&self) -> Option<Denial> {
        if self.captcha_required {
            Some(Denial::CaptchaRequired)
        } else if !self.allowed {
            Some(Denial::RateLimited {
                reset_at: self.reset_at,
            })
        } else {
            None
        }
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}
