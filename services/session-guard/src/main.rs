use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use common::{Clock, RedisConfig, RedisPool, SystemClock};
use session_guard::{
    GuardConfig, SessionService,
    audit::TracingAuditSink,
    jwt::{JwtConfig, JwtService},
    routes,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let builder = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Starting session guard");

    let config = GuardConfig::load()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Without the store there is no revocation, so failing here is fatal
    let redis_config = RedisConfig::from_env()?;
    let store = RedisPool::new(&redis_config).await?;

    let jwt = JwtService::new(JwtConfig::from_env()?, clock.clone())?;

    let service = SessionService::new(
        config.clone(),
        Arc::new(store),
        Arc::new(jwt.clone()),
        Arc::new(jwt),
        Arc::new(TracingAuditSink),
        clock,
    );
    service.initialize().await?;

    info!("Session guard initialized successfully");

    let app = routes::create_router(service.clone());

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Session guard listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    service.close().await?;
    info!("Session guard stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}
