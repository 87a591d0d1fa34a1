//! Credits service binary entry point.

use credits_proto::credits::v1::credit_ledger_service_server::CreditLedgerServiceServer;
use credits_service::{
    CreditAllowances, CreditLedger, CreditsServiceConfig, CreditsServiceImpl, SessionHub,
    SqlCreditStore,
};
use sqlx::any::AnyPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credits_service=info,sqlx=warn,tonic=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting credits-service");

    // Load configuration
    let config = CreditsServiceConfig::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", *e);
        CreditsServiceConfig::default()
    });

    // Install the SQLx Any driver
    sqlx::any::install_default_drivers();

    let pool = AnyPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
        .connect(&config.database.url)
        .await?;

    tracing::info!("Database connection pool established");

    let store = SqlCreditStore::new(pool);
    if config.database.run_migrations {
        store.migrate().await?;
        tracing::info!("Credit table ready");
    }

    let ledger = Arc::new(CreditLedger::new(
        Arc::new(store),
        CreditAllowances::from(&config.credits),
    ));
    let sessions = Arc::new(SessionHub::new(config.channel.capacity));
    let _session_cleanup = sessions.spawn_cleanup_task(
        Duration::from_secs(config.channel.cleanup_interval_seconds.max(1)),
        Duration::from_secs(config.channel.idle_timeout_seconds),
    );
    let credits_service = CreditsServiceImpl::new(ledger, sessions);

    // Build server address
    let addr: SocketAddr = format!("{}:{}", config.service.host, config.service.port).parse()?;

    tracing::info!(
        anonymous_default = config.credits.anonymous_default,
        authenticated_default = config.credits.authenticated_default,
        sign_in_policy = ?config.credits.sign_in_policy,
        "Listening on {addr}"
    );

    // Start gRPC server
    Server::builder()
        .add_service(CreditLedgerServiceServer::new(credits_service))
        .serve(addr)
        .await?;

    Ok(())
}
