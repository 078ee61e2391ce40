use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::actor::{ActorContext, ActorRegistry, Command};
use crate::captcha::{CaptchaVerifier, TurnstileVerifier, VerifyOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, CaptchaError};
use crate::logging::fingerprint;
use crate::metrics::{
    ADMISSION_CHECKS, CAPTCHA_BLOCKED, CAPTCHA_FAILED, CAPTCHA_LATENCY, CAPTCHA_VERIFIED,
    LIMIT_RESETS, RATE_LIMITED, REQUESTS_RECORDED, REQUESTS_REFUNDED,
};
use crate::rate_limit::{Denial, IdentifierRecord, RateLimitResult, Tier};
use crate::store::{MemoryStore, RecordStore};

/// Admission control for a set of identifiers.
///
/// Cheap to clone; clones share the same actors and store.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    registry: ActorRegistry,
    verifier: Arc<dyn CaptchaVerifier>,
}

pub struct CoordinatorBuilder {
    config: AdmissionConfig,
    store: Option<Arc<dyn RecordStore>>,
    clock: Option<Arc<dyn Clock>>,
    verifier: Option<Arc<dyn CaptchaVerifier>>,
}

impl CoordinatorBuilder {
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn CaptchaVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    // Defaults: in-memory store, wall clock, Turnstile client from the config
    pub fn build(self) -> Coordinator {
        let verifier = self.verifier.unwrap_or_else(|| {
            Arc::new(TurnstileVerifier::from_config(
                reqwest::Client::new(),
                &self.config.captcha,
            ))
        });
        let ctx = ActorContext {
            config: Arc::new(self.config),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };
        Coordinator {
            inner: Arc::new(CoordinatorInner {
                registry: ActorRegistry::new(ctx),
                verifier,
            }),
        }
    }
}

// Surrounding whitespace is not part of an identifier
fn require_identifier(identifier: &str) -> Result<&str, AdmissionError> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(AdmissionError::EmptyIdentifier);
    }
    Ok(identifier)
}

fn count_decision(result: &RateLimitResult) {
    ADMISSION_CHECKS.inc();
    match result.denial() {
        Some(Denial::CaptchaRequired) => CAPTCHA_BLOCKED.inc(),
        Some(Denial::RateLimited { .. }) => RATE_LIMITED.inc(),
        None => {}
    }
}

impl Coordinator {
    pub fn builder(config: AdmissionConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            store: None,
            clock: None,
            verifier: None,
        }
    }

    pub fn new(config: AdmissionConfig, store: Arc<dyn RecordStore>) -> Self {
        Self::builder(config).store(store).build()
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.registry.context().config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.registry.context().clock.now()
    }

    /// May this identifier proceed right now. Never changes the count; the
    /// only write is window-rollover bookkeeping.
    pub async fn check_limit(
        &self,
        identifier: &str,
        tier: Tier,
    ) -> Result<RateLimitResult, AdmissionError> {
        let identifier = require_identifier(identifier)?;
        let result = self
            .inner
            .registry
            .request(identifier, |reply| Command::Check { tier, reply })
            .await?;

        count_decision(&result);
        Ok(result)
    }

    /// Check and record as one step: when the identifier may proceed, the
    /// request is counted before this returns. The decision is the one taken
    /// before counting, so `remaining` still includes this request.
    ///
    /// A store that cannot persist the count makes this an error, never an
    /// admission.
    pub async fn admit(&self, identifier: &str, tier: Tier) -> Result<RateLimitResult, AdmissionError> {
        let identifier = require_identifier(identifier)?;
        let result = self
            .inner
            .registry
            .request(identifier, |reply| Command::Admit { tier, reply })
            .await?;

        count_decision(&result);
        if result.denial().is_none() {
            REQUESTS_RECORDED.inc();
        }
        Ok(result)
    }

    /// Gives back a request counted by [`Coordinator::admit`]. Does nothing
    /// once the window that admission came from has rolled over. Returns
    /// whether anything was given back.
    pub async fn refund(
        &self,
        identifier: &str,
        admitted: &RateLimitResult,
    ) -> Result<bool, AdmissionError> {
        let identifier = require_identifier(identifier)?;
        let reset_at = admitted.reset_at;
        let refunded = self
            .inner
            .registry
            .request(identifier, |reply| Command::Refund { reset_at, reply })
            .await?;
        if refunded {
            REQUESTS_REFUNDED.inc();
        }
        Ok(refunded)
    }

    /// Accounts for one admitted request. Call once per request that was
    /// let through.
    pub async fn record_request(&self, identifier: &str, tier: Tier) -> Result<(), AdmissionError> {
        let identifier = require_identifier(identifier)?;
        self.inner
            .registry
            .request(identifier, |reply| Command::Record { tier, reply })
            .await?;
        REQUESTS_RECORDED.inc();
        Ok(())
    }

    /// Forgets everything about the identifier. Idempotent.
    pub async fn reset_limit(&self, identifier: &str) -> Result<(), AdmissionError> {
        let identifier = require_identifier(identifier)?;
        let existed = self
            .inner
            .registry
            .request(identifier, |reply| Command::Reset { reply })
            .await?;
        LIMIT_RESETS.inc();
        info!(id = %fingerprint(identifier), existed, "admission record reset");
        Ok(())
    }

    /// Stored record for the identifier, if it has ever been seen.
    pub async fn snapshot(&self, identifier: &str) -> Result<Option<IdentifierRecord>, AdmissionError> {
        let identifier = require_identifier(identifier)?;
        self.inner
            .registry
            .request(identifier, |reply| Command::Snapshot { reply })
            .await
    }

    pub async fn verify_captcha(
        &self,
        identifier: &str,
        token: &str,
    ) -> Result<VerifyOutcome, AdmissionError> {
        self.verify_captcha_from(identifier, token, None).await
    }

    /// Checks a CAPTCHA token and, when the provider accepts it, lifts the
    /// identifier's CAPTCHA requirement. Provider failures come back as an
    /// unsuccessful outcome and leave the record untouched; only storage
    /// failures are errors.
    pub async fn verify_captcha_from(
        &self,
        identifier: &str,
        token: &str,
        remote_ip: Option<&str>,
    ) -> Result<VerifyOutcome, AdmissionError> {
        let identifier = require_identifier(identifier)?;
        let captcha = &self.config().captcha;
        if !captcha.enabled {
            return Ok(VerifyOutcome::success());
        }
        let Some(secret) = captcha.secret_key.as_deref() else {
            warn!("CAPTCHA enabled but no secret key configured");
            return Ok(VerifyOutcome::failure(&CaptchaError::NotConfigured));
        };
        if token.trim().is_empty() {
            return Ok(VerifyOutcome::failure(&CaptchaError::MissingToken));
        }

        let id = fingerprint(identifier);
        // runs outside the actor so a slow provider never stalls admission
        let timer = CAPTCHA_LATENCY.start_timer();
        let verdict = tokio::time::timeout(
            captcha.timeout,
            self.inner.verifier.verify(secret, token, remote_ip),
        )
        .await
        .unwrap_or(Err(CaptchaError::Timeout));
        timer.observe_duration();

        match verdict {
            Ok(()) => {
                self.inner
                    .registry
                    .request(identifier, |reply| Command::ClearCaptcha { reply })
                    .await?;
                CAPTCHA_VERIFIED.inc();
                info!(id = %id, "CAPTCHA verified, requirement cleared");
                Ok(VerifyOutcome::success())
            }
            Err(reason) => {
                CAPTCHA_FAILED.inc();
                warn!(id = %id, error = %reason, "CAPTCHA verification failed");
                Ok(VerifyOutcome::failure(&reason))
            }
        }
    }

    /// Sweeps retired actors out of the registry.
    pub fn prune_idle(&self) -> usize {
        self.inner.registry.prune()
    }

    /// Number of actor handles currently registered.
    pub fn actor_count(&self) -> usize {
        self.inner.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_identifier_is_rejected() {
        let coordinator = Coordinator::builder(AdmissionConfig::default()).build();
        assert!(matches!(
            coordinator.check_limit("", Tier::Anonymous).await,
            Err(AdmissionError::EmptyIdentifier)
        ));
        assert!(matches!(
            coordinator.record_request("   ", Tier::Anonymous).await,
            Err(AdmissionError::EmptyIdentifier)
        ));
        assert_eq!(coordinator.actor_count(), 0);
    }

    #[tokio::test]
    async fn check_persists_new_record_without_counting() {
        let coordinator = Coordinator::builder(AdmissionConfig::default()).build();
        coordinator.check_limit("ip-9", Tier::Anonymous).await.unwrap();
        coordinator.check_limit("ip-9", Tier::Anonymous).await.unwrap();

        let record = coordinator.snapshot("ip-9").await.unwrap().expect("created lazily");
        assert_eq!(record.count, 0);
        assert_eq!(record.suspicion_score, 0);
        assert!(!record.captcha_required);
    }

    #[tokio::test]
    async fn disabled_captcha_verifies_as_noop() {
        let coordinator = Coordinator::builder(AdmissionConfig::default()).build();
        let outcome = coordinator.verify_captcha("ip-1", "anything").await.unwrap();
        assert_eq!(outcome, VerifyOutcome::success());
        assert!(coordinator.snapshot("ip-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_secret_reports_not_configured() {
        let mut config = AdmissionConfig::default();
        config.captcha.enabled = true;
        let coordinator = Coordinator::builder(config).build();

        let outcome = coordinator.verify_captcha("ip-1", "tok").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("not configured"));
    }

    #[tokio::test]
    async fn padded_identifier_is_the_same_caller() {
        let coordinator = Coordinator::builder(AdmissionConfig::default()).build();
        for _ in 0..5 {
            coordinator.record_request("ip-1 ", Tier::Anonymous).await.unwrap();
        }

        let result = coordinator.check_limit("ip-1", Tier::Anonymous).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(coordinator.actor_count(), 1);

        coordinator.reset_limit("\tip-1").await.unwrap();
        let result = coordinator.check_limit(" ip-1", Tier::Anonymous).await.unwrap();
        assert_eq!(result.remaining, 5);
    }
}
