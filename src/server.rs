use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::handlers::{
    captcha_config_handler, check_handler, health_handler, metrics_handler, record_handler,
    reset_handler, verify_captcha_handler,
};
use crate::state::AppState;

// Admission RPC surface plus health and metrics
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/check", post(check_handler))
        .route("/record", post(record_handler))
        .route("/reset", post(reset_handler))
        .route("/verify-captcha", post(verify_captcha_handler))
        .route("/captcha/config", get(captcha_config_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// Janitor - sweeps retired actors out of the registry on a fixed cadence
pub async fn actor_janitor(coordinator: Coordinator, sweep_interval: Duration) {
    let mut interval = interval(sweep_interval);

    info!("Actor janitor started (interval: {:?})", sweep_interval);

    loop {
        interval.tick().await;

        let removed = coordinator.prune_idle();
        if removed > 0 {
            debug!(removed, remaining = coordinator.actor_count(), "pruned retired actors");
        }
    }
}
