use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orchestrator::auth::AuthGate;
use orchestrator::cache::Cache;
use orchestrator::config::Config;
use orchestrator::container::ContainerManager;
use orchestrator::db::{self, Db};
use orchestrator::ports::PortAllocator;
use orchestrator::quota::QuotaManager;
use orchestrator::reaper::Reaper;
use orchestrator::rpc::RpcHub;
use orchestrator::sandbox::SandboxManager;
use orchestrator::{api, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestrator=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);
    info!(port = config.port, "orchestrator starting");

    // Stores and runtime — constructed once here, passed by reference.
    let pool = db::connect(&config.database_url).await?;
    let db = Db::new(pool);
    info!("database connected");

    let cache = Cache::connect(&config.redis_url).await?;
    info!("ephemeral store connected");

    let containers = ContainerManager::connect(config.container_startup_timeout).await?;
    info!("container runtime connected");

    let auth = AuthGate::new(db.clone(), config.jwt_secret.clone());
    let quota = QuotaManager::new(db.clone(), &config);
    let ports = PortAllocator::new(cache.clone(), config.port_range_start, config.port_range_end);
    let hub = RpcHub::new();

    let sandboxes = SandboxManager::new(
        db.clone(),
        cache.clone(),
        containers.clone(),
        ports.clone(),
        Arc::clone(&hub),
        auth.clone(),
        quota.clone(),
        Arc::clone(&config),
    );

    // Background sweeps: expired sandboxes, orphan containers, stale ports.
    let reaper = Reaper::new(
        db.clone(),
        cache.clone(),
        containers.clone(),
        ports.clone(),
        Arc::clone(&hub),
        config.cleanup_interval,
    );
    tokio::spawn(reaper.run());

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        db,
        cache,
        containers,
        auth,
        quota,
        hub: Arc::clone(&hub),
        sandboxes,
    });

    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    info!("orchestrator stopped");
    Ok(())
}

async fn shutdown_signal(hub: Arc<RpcHub>) {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, closing sessions");
    hub.shutdown().await;
}
