use sha2::{Digest, Sha256};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);
    // try_init so a second call (tests) is harmless
    let _ = if json {
        registry
            .with(fmt::layer().json().with_ansi(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
}

/// Short stable digest of an identifier, so IPs and user ids stay out of logs.
pub fn fingerprint(identifier: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(identifier.as_bytes()));
    digest[..12].to_string()
}
