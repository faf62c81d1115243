use anyhow::{Context, Result};
use mms::api::create_app;
use mms::config::{load_or_default, new_relay_policy};
use mms::relay::BroadcastRelay;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mms=info".into()),
        )
        .init();

    info!("MMS relay starting...");

    let config_path = std::env::var("MMS_CONFIG").unwrap_or_else(|_| "mms.toml".to_string());
    let config = load_or_default(&config_path)?.with_env_overrides();
    let policy = config.relay.policy().with_env_overrides();

    info!(
        config_path = %config_path,
        bind_addr = %config.server.bind_addr,
        self_delivery = policy.self_delivery,
        max_pending = policy.max_pending,
        max_pending_age_secs = policy.max_pending_age_secs,
        backpressure_policy = ?policy.backpressure_policy,
        session_grace_secs = config.relay.session_grace_secs,
        admin_token = config.server.admin_token.is_some(),
        "Configuration loaded"
    );

    let relay = Arc::new(BroadcastRelay::new(
        new_relay_policy(policy),
        Duration::from_secs(config.relay.session_grace_secs),
    ));

    let sweeper = tokio::spawn(
        Arc::clone(&relay).run_sweeper(Duration::from_secs(config.relay.sweep_interval_secs.max(1))),
    );

    let app = create_app(Arc::clone(&relay), config.server.admin_token.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "Relay listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Relay server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    sweeper.abort();
    info!(sessions = relay.session_count(), "MMS relay stopped");

    Ok(())
}
