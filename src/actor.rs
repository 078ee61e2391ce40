//! One actor task per identifier.
//!
//! Every operation on an identifier's record is a message to that
//! identifier's actor, which handles messages one at a time. That is what
//! makes concurrent `record` calls add up exactly: there is never more than
//! one read-modify-write in flight per identifier, and unrelated identifiers
//! never wait on each other.
//!
//! Actors retire after sitting idle. A retiring actor closes its mailbox,
//! finishes whatever was already queued and exits. The next message for that
//! identifier spawns a successor, which first waits for the retiring actor's
//! task to finish so the two never overlap.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::captcha;
use crate::clock::Clock;
use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, StoreError};
use crate::logging::fingerprint;
use crate::metrics::{ACTIVE_ACTORS, CAPTCHA_CHALLENGES};
use crate::rate_limit::{IdentifierRecord, RateLimitResult, Tier};
use crate::store::RecordStore;
use crate::suspicion;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

pub(crate) enum Command {
    Check { tier: Tier, reply: Reply<RateLimitResult> },
    Record { tier: Tier, reply: Reply<()> },
    Admit { tier: Tier, reply: Reply<RateLimitResult> },
    Refund { reset_at: DateTime<Utc>, reply: Reply<bool> },
    Reset { reply: Reply<bool> },
    ClearCaptcha { reply: Reply<()> },
    Snapshot { reply: Reply<Option<IdentifierRecord>> },
}

// Everything an actor needs besides its own identifier
pub(crate) struct ActorContext {
    pub config: Arc<AdmissionConfig>,
    pub store: Arc<dyn RecordStore>,
    pub clock: Arc<dyn Clock>,
}

struct IdentifierActor {
    identifier: String,
    fingerprint: String,
    ctx: Arc<ActorContext>,
}

impl IdentifierActor {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        predecessor: Option<JoinHandle<()>>,
    ) {
        if let Some(previous) = predecessor {
            // panics in the old task are already logged by the runtime
            let _ = previous.await;
        }
        ACTIVE_ACTORS.inc();
        debug!(id = %self.fingerprint, "admission actor started");

        let idle = self.ctx.config.actor_idle_timeout;
        loop {
            match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(cmd)) => self.handle(cmd).await,
                Ok(None) => break,
                Err(_) => {
                    rx.close();
                    while let Some(cmd) = rx.recv().await {
                        self.handle(cmd).await;
                    }
                    debug!(id = %self.fingerprint, "admission actor retired after idling");
                    break;
                }
            }
        }

        ACTIVE_ACTORS.dec();
    }

    async fn handle(&self, cmd: Command) {
        // a dropped reply means the caller went away, nothing to do
        match cmd {
            Command::Check { tier, reply } => {
                let _ = reply.send(self.check(tier).await);
            }
            Command::Record { tier, reply } => {
                let _ = reply.send(self.record(tier).await);
            }
            Command::Admit { tier, reply } => {
                let _ = reply.send(self.admit(tier).await);
            }
            Command::Refund { reset_at, reply } => {
                let _ = reply.send(self.refund(reset_at).await);
            }
            Command::Reset { reply } => {
                let _ = reply.send(self.ctx.store.delete(&self.identifier).await);
            }
            Command::ClearCaptcha { reply } => {
                let _ = reply.send(self.clear_captcha().await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.ctx.store.load(&self.identifier).await);
            }
        }
    }

    async fn load_or_create(&self) -> Result<(IdentifierRecord, bool), StoreError> {
        let now = self.ctx.clock.now();
        match self.ctx.store.load(&self.identifier).await {
            Ok(Some(record)) => Ok((record, false)),
            Ok(None) => Ok((IdentifierRecord::new(now), true)),
            Err(e) => {
                error!(id = %self.fingerprint, error = %e, "failed to load admission record");
                Err(e)
            }
        }
    }

    async fn save(&self, record: &IdentifierRecord) -> Result<(), StoreError> {
        self.ctx
            .store
            .save(&self.identifier, record)
            .await
            .inspect_err(|e| {
                error!(id = %self.fingerprint, error = %e, "failed to persist admission record");
            })
    }

    async fn check(&self, tier: Tier) -> Result<RateLimitResult, StoreError> {
        let config = &self.ctx.config;
        let (mut record, created) = self.load_or_create().await?;

        let rolled = record.roll_window(self.ctx.clock.now(), config);
        if rolled {
            debug!(id = %self.fingerprint, score = record.suspicion_score, "window rolled over");
        }
        if created || rolled {
            self.save(&record).await?;
        }

        Ok(record.evaluate(tier, config))
    }

    // Counts one request against the current window. Returns true when the
    // CAPTCHA gate tripped on it.
    fn count_request(&self, record: &mut IdentifierRecord, now: DateTime<Utc>) -> bool {
        let config = &self.ctx.config;
        record.count = record.count.saturating_add(1);
        suspicion::score_request(record, now, &config.suspicion);
        captcha::note_request(record, &config.captcha)
    }

    fn log_recorded(&self, tier: Tier, record: &IdentifierRecord, challenged: bool) {
        debug!(
            id = %self.fingerprint,
            tier = tier.as_str(),
            count = record.count,
            score = record.suspicion_score,
            "request recorded"
        );
        if challenged {
            CAPTCHA_CHALLENGES.inc();
            info!(id = %self.fingerprint, count = record.count, "CAPTCHA now required");
        }
    }

    async fn record(&self, tier: Tier) -> Result<(), StoreError> {
        let now = self.ctx.clock.now();
        let (mut record, _) = self.load_or_create().await?;

        record.roll_window(now, &self.ctx.config);
        let challenged = self.count_request(&mut record, now);
        self.save(&record).await?;

        self.log_recorded(tier, &record, challenged);
        Ok(())
    }

    // Check and record in one turn of the mailbox. The returned decision is
    // the one taken before this request was counted.
    async fn admit(&self, tier: Tier) -> Result<RateLimitResult, StoreError> {
        let config = &self.ctx.config;
        let now = self.ctx.clock.now();
        let (mut record, created) = self.load_or_create().await?;

        let rolled = record.roll_window(now, config);
        let decision = record.evaluate(tier, config);
        if decision.denial().is_some() {
            if created || rolled {
                self.save(&record).await?;
            }
            return Ok(decision);
        }

        let challenged = self.count_request(&mut record, now);
        self.save(&record).await?;

        self.log_recorded(tier, &record, challenged);
        Ok(decision)
    }

    // Gives back one admission, but only within the window it was taken from.
    // Suspicion and CAPTCHA state still reflect the attempt.
    async fn refund(&self, reset_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let loaded = self.ctx.store.load(&self.identifier).await.inspect_err(|e| {
            error!(id = %self.fingerprint, error = %e, "failed to load admission record");
        })?;
        let Some(mut record) = loaded else {
            return Ok(false);
        };
        if record.count == 0 || record.reset_at(&self.ctx.config) != reset_at {
            return Ok(false);
        }

        record.count -= 1;
        self.save(&record).await?;
        debug!(id = %self.fingerprint, count = record.count, "admission refunded");
        Ok(true)
    }

    async fn clear_captcha(&self) -> Result<(), StoreError> {
        let (mut record, _) = self.load_or_create().await?;
        captcha::clear(&mut record, self.ctx.clock.now());
        self.save(&record).await
    }
}

struct ActorHandle {
    tx: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl ActorHandle {
    fn spawn(
        identifier: &str,
        ctx: Arc<ActorContext>,
        predecessor: Option<JoinHandle<()>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = IdentifierActor {
            identifier: identifier.to_string(),
            fingerprint: fingerprint(identifier),
            ctx,
        };
        let task = tokio::spawn(actor.run(rx, predecessor));
        Self {
            tx,
            task: Some(task),
        }
    }

    fn is_retired(&self) -> bool {
        self.tx.is_closed() && self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Routes commands to the actor owning each identifier, spawning it on
/// first use.
pub(crate) struct ActorRegistry {
    actors: DashMap<String, ActorHandle>,
    ctx: Arc<ActorContext>,
}

impl ActorRegistry {
    pub fn new(ctx: ActorContext) -> Self {
        Self {
            actors: DashMap::new(),
            ctx: Arc::new(ctx),
        }
    }

    pub fn context(&self) -> &ActorContext {
        &self.ctx
    }

    // Enqueue under the shard lock; sending on an unbounded channel never waits
    fn dispatch(&self, identifier: &str, cmd: Command) -> Result<(), AdmissionError> {
        let mut slot = self
            .actors
            .entry(identifier.to_string())
            .or_insert_with(|| ActorHandle::spawn(identifier, self.ctx.clone(), None));

        let cmd = match slot.tx.send(cmd) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::SendError(cmd)) => cmd,
        };

        // mailbox closed: the actor is retiring, hand over to a successor
        let predecessor = slot.task.take();
        *slot = ActorHandle::spawn(identifier, self.ctx.clone(), predecessor);
        slot.tx
            .send(cmd)
            .map_err(|_| AdmissionError::ActorGone(fingerprint(identifier)))
    }

    /// Sends a command built around a fresh reply channel and waits for
    /// the actor's answer.
    pub async fn request<T>(
        &self,
        identifier: &str,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, AdmissionError> {
        let (reply, answer) = oneshot::channel();
        self.dispatch(identifier, build(reply))?;
        let result = answer
            .await
            .map_err(|_| AdmissionError::ActorGone(fingerprint(identifier)))?;
        Ok(result?)
    }

    /// Drops handles of actors that have retired and exited. Returns how
    /// many were removed.
    pub fn prune(&self) -> usize {
        let before = self.actors.len();
        self.actors.retain(|_, handle| !handle.is_retired());
        before.saturating_sub(self.actors.len())
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }
}
