use anyhow::Context;
use clap::Parser; // for cli
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use verse_gate::logging::init_tracing;
use verse_gate::server::{actor_janitor, router};
use verse_gate::{AppState, Args, Coordinator, MemoryStore, RecordStore, SqliteStore, StoreKind};

// this is main async function with tokio
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // parse cli arguments
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    let config = args
        .admission_config()
        .context("invalid admission configuration")?;
    info!(?config, "admission configuration loaded");
    if config.captcha.enabled && config.captcha.secret_key.is_none() {
        tracing::warn!("Turnstile is enabled without a secret key; verifications will fail");
    }

    let store: Arc<dyn RecordStore> = match args.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Sqlite => Arc::new(
            SqliteStore::open(&args.db_path)
                .with_context(|| format!("opening {}", args.db_path.display()))?,
        ),
    };

    let coordinator = Coordinator::new(config, store);

    // spawn the background janitor
    tokio::spawn(actor_janitor(
        coordinator.clone(),
        Duration::from_secs(args.janitor_interval_secs.max(1)),
    ));

    let app = router(Arc::new(AppState::new(coordinator)));

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("Admission gate running on http://localhost:{}", args.port);
    info!(
        "Rate limit: {} anonymous / {} authenticated requests per {} seconds",
        args.rate_limit_anonymous, args.rate_limit_authenticated, args.rate_window
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;
    Ok(())
}
