use chrono::TimeDelta;
use clap::{ArgAction, Parser, ValueEnum};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::rate_limit::Tier;

pub const TURNSTILE_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

// Which record store backs the coordinator
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite,
}

// CLI argument structure, every knob can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "verse-gate")]
#[command(about = "Admission control for verse image generation")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Requests per window for anonymous callers
    #[arg(long, env = "RATE_LIMIT_ANONYMOUS", default_value_t = 5)]
    pub rate_limit_anonymous: u32,

    // Requests per window for signed-in callers
    #[arg(long, env = "RATE_LIMIT_AUTHENTICATED", default_value_t = 20)]
    pub rate_limit_authenticated: u32,

    // Window length in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 3600)]
    pub rate_window: u64,

    // Suspicion score at which the limit gets cut
    #[arg(long, default_value_t = 50)]
    pub suspicious_threshold: u8,

    // Multiplier applied to the limit of a suspicious caller
    #[arg(long, default_value_t = 0.5)]
    pub penalty_factor: f64,

    // Requests closer together than this count as rapid-fire
    #[arg(long, default_value_t = 1000)]
    pub min_request_interval_ms: u64,

    #[arg(long, env = "TURNSTILE_ENABLED", action = ArgAction::Set, default_value_t = false)]
    pub turnstile_enabled: bool,

    // Requests per window after which a CAPTCHA is demanded
    #[arg(long, env = "TURNSTILE_HIGH_FREQUENCY_THRESHOLD", default_value_t = 10)]
    pub turnstile_high_frequency_threshold: u32,

    #[arg(long, env = "TURNSTILE_SITE_KEY")]
    pub turnstile_site_key: Option<String>,

    #[arg(long, env = "TURNSTILE_SECRET_KEY", hide_env_values = true)]
    pub turnstile_secret_key: Option<String>,

    #[arg(long, default_value = TURNSTILE_VERIFY_URL)]
    pub turnstile_verify_url: String,

    // Upper bound on one verification round trip
    #[arg(long, default_value_t = 5)]
    pub turnstile_timeout_secs: u64,

    #[arg(long, value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    // SQLite file, only used with --store sqlite
    #[arg(long, default_value = "verse-gate.db")]
    pub db_path: PathBuf,

    // Idle time after which a per-identifier actor retires
    #[arg(long, default_value_t = 300)]
    pub actor_idle_secs: u64,

    // How often retired actors are swept from the registry
    #[arg(long, default_value_t = 60)]
    pub janitor_interval_secs: u64,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Args {
    pub fn admission_config(&self) -> Result<AdmissionConfig, ConfigError> {
        let window = TimeDelta::try_seconds(to_i64(self.rate_window, "rate window")?)
            .ok_or_else(|| ConfigError::Invalid("rate window out of range".into()))?;
        let min_request_interval =
            TimeDelta::try_milliseconds(to_i64(self.min_request_interval_ms, "request interval")?)
                .ok_or_else(|| ConfigError::Invalid("request interval out of range".into()))?;

        let config = AdmissionConfig {
            window,
            anonymous_limit: self.rate_limit_anonymous,
            authenticated_limit: self.rate_limit_authenticated,
            suspicion: SuspicionPolicy {
                threshold: self.suspicious_threshold,
                penalty_factor: self.penalty_factor,
                min_request_interval,
                ..SuspicionPolicy::default()
            },
            captcha: CaptchaConfig {
                enabled: self.turnstile_enabled,
                high_frequency_threshold: self.turnstile_high_frequency_threshold,
                site_key: non_blank(self.turnstile_site_key.as_deref()),
                secret_key: non_blank(self.turnstile_secret_key.as_deref()),
                verify_url: self.turnstile_verify_url.clone(),
                timeout: Duration::from_secs(self.turnstile_timeout_secs),
            },
            actor_idle_timeout: Duration::from_secs(self.actor_idle_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64, ConfigError> {
    i64::try_from(value).map_err(|_| ConfigError::Invalid(format!("{what} out of range")))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Knobs of the burst heuristic.
#[derive(Debug, Clone, PartialEq)]
pub struct SuspicionPolicy {
    /// Score at or above which the penalty applies.
    pub threshold: u8,
    /// Fraction of the base limit left to a suspicious caller.
    pub penalty_factor: f64,
    /// Inter-arrival gap below which a request counts as rapid-fire.
    pub min_request_interval: TimeDelta,
    pub rapid_increment: u8,
    pub steady_decrement: u8,
    /// Amount taken off the score whenever a window rolls over.
    pub window_decay: u8,
}

impl Default for SuspicionPolicy {
    fn default() -> Self {
        Self {
            threshold: 50,
            penalty_factor: 0.5,
            min_request_interval: TimeDelta::seconds(1),
            rapid_increment: 10,
            steady_decrement: 1,
            window_decay: 10,
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct CaptchaConfig {
    pub enabled: bool,
    pub high_frequency_threshold: u32,
    /// Public key handed to the browser widget.
    pub site_key: Option<String>,
    /// Server-side verification secret. Never serialized or logged.
    pub secret_key: Option<String>,
    pub verify_url: String,
    pub timeout: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            high_frequency_threshold: 10,
            site_key: None,
            secret_key: None,
            verify_url: TURNSTILE_VERIFY_URL.to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for CaptchaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptchaConfig")
            .field("enabled", &self.enabled)
            .field("high_frequency_threshold", &self.high_frequency_threshold)
            .field("site_key", &self.site_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("verify_url", &self.verify_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Immutable admission settings, built once at startup and handed to the
/// coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    pub window: TimeDelta,
    pub anonymous_limit: u32,
    pub authenticated_limit: u32,
    pub suspicion: SuspicionPolicy,
    pub captcha: CaptchaConfig,
    pub actor_idle_timeout: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window: TimeDelta::hours(1),
            anonymous_limit: 5,
            authenticated_limit: 20,
            suspicion: SuspicionPolicy::default(),
            captcha: CaptchaConfig::default(),
            actor_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl AdmissionConfig {
    pub fn tier_limit(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Anonymous => self.anonymous_limit,
            Tier::Authenticated => self.authenticated_limit,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window <= TimeDelta::zero() {
            return Err(ConfigError::Invalid("window must be positive".into()));
        }
        if self.anonymous_limit == 0 || self.authenticated_limit == 0 {
            return Err(ConfigError::Invalid("tier limits must be positive".into()));
        }
        let factor = self.suspicion.penalty_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "penalty factor {factor} must be in (0, 1]"
            )));
        }
        if self.suspicion.threshold > 100 {
            return Err(ConfigError::Invalid(
                "suspicious threshold must be within 0..=100".into(),
            ));
        }
        if self.suspicion.min_request_interval < TimeDelta::zero() {
            return Err(ConfigError::Invalid("request interval must not be negative".into()));
        }
        if self.captcha.high_frequency_threshold == 0 {
            return Err(ConfigError::Invalid(
                "high frequency threshold must be positive".into(),
            ));
        }
        if self.captcha.timeout.is_zero() {
            return Err(ConfigError::Invalid("verification timeout must be positive".into()));
        }
        if self.actor_idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("actor idle timeout must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::parse_from(["verse-gate"]);
        let config = args.admission_config().expect("defaults are valid");

        assert_eq!(config, AdmissionConfig::default());
        assert_eq!(config.tier_limit(Tier::Anonymous), 5);
        assert_eq!(config.tier_limit(Tier::Authenticated), 20);
        assert_eq!(config.window, TimeDelta::hours(1));
        assert!(!config.captcha.enabled);
        assert_eq!(args.store, StoreKind::Memory);
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "verse-gate",
            "--rate-limit-anonymous",
            "3",
            "--turnstile-enabled",
            "true",
            "--turnstile-secret-key",
            "  shh  ",
            "--turnstile-site-key",
            "   ",
            "--store",
            "sqlite",
        ]);
        let config = args.admission_config().expect("valid");

        assert_eq!(config.anonymous_limit, 3);
        assert!(config.captcha.enabled);
        assert_eq!(config.captcha.secret_key.as_deref(), Some("shh"));
        assert_eq!(config.captcha.site_key, None);
        assert_eq!(args.store, StoreKind::Sqlite);
    }

    #[test]
    fn rejects_nonsense() {
        let mut config = AdmissionConfig::default();
        config.suspicion.penalty_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = AdmissionConfig::default();
        config.anonymous_limit = 0;
        assert!(config.validate().is_err());

        let mut config = AdmissionConfig::default();
        config.window = TimeDelta::zero();
        assert!(config.validate().is_err());

        let mut config = AdmissionConfig::default();
        config.captcha.high_frequency_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_output_hides_secret() {
        let captcha = CaptchaConfig {
            secret_key: Some("top-secret".into()),
            ..CaptchaConfig::default()
        };
        let rendered = format!("{captcha:?}");
        assert!(!rendered.contains("top-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
