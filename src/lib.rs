//! Admission control for the verse image service: fixed-window rate limits
//! per caller, a burst-suspicion penalty and a sticky Turnstile CAPTCHA
//! gate, with every identifier's state owned by a single actor.

mod actor;
pub mod captcha;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod server;
pub mod sqlite_store;
pub mod state;
pub mod store;
pub mod suspicion;

pub use captcha::{CaptchaVerifier, TurnstileVerifier, VerifyOutcome};
pub use clock::{Clock, SystemClock};
#[doc(hidden)]
pub use clock::ManualClock;
pub use config::{AdmissionConfig, Args, CaptchaConfig, StoreKind, SuspicionPolicy};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{AdmissionError, CaptchaError, ConfigError, StoreError};
pub use rate_limit::{Denial, IdentifierRecord, RateLimitResult, Tier};
pub use state::AppState;
pub use store::{MemoryStore, RecordStore};
pub use sqlite_store::SqliteStore;
