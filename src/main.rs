//! IronBridge 主入口

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use ironbridge::{
    api,
    app_state::{AppState, Backends},
    config::Config,
    infrastructure::{db, logging},
    service::ChainAdapterRegistry,
    utils::{Clock, SystemClock},
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量与配置
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;
    config.validate().context("Invalid configuration")?;

    // 2. 日志
    logging::init_logging(&config.logging)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        storage = ?config.storage.backend,
        lease = ?config.lease.backend,
        "Starting IronBridge"
    );

    // 3. 存储、租约、事件总线
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backends = Backends::from_config(&config, clock.clone()).await?;

    if let Some(pool) = &backends.pool {
        if std::env::var("SKIP_MIGRATIONS").is_err() {
            db::run_migrations(pool).await?;
        } else {
            tracing::info!("Database migrations skipped (SKIP_MIGRATIONS set)");
        }
    }

    // 4. 链适配器与应用状态
    let registry = ironbridge::service::NetworkRegistry::from_configs(&config.networks)
        .context("Invalid network configuration")?;
    let adapters = ChainAdapterRegistry::json_rpc(
        &registry.list_enabled(),
        Duration::from_secs(config.bridge.adapter_timeout_secs),
    )
    .context("Failed to build chain adapters")?;
    tracing::info!(networks = ?adapters.networks(), "Chain adapters ready");

    let poll_interval = Duration::from_secs(config.bridge.poll_interval_secs.max(1));
    let reconcile_interval = Duration::from_secs(config.bridge.reconcile_interval_secs.max(1));
    let bind_addr = config.server.bind_addr.clone();

    let state = Arc::new(AppState::build(config, backends, adapters, clock).await?);

    // 5. 后台任务
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(state.engine.clone().run(poll_interval, shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(state.scheduler.clone().run(reconcile_interval, shutdown_rx));

    // 6. HTTP 服务
    let app = api::routes(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // 7. 停止后台任务
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(engine_task, scheduler_task);
    tracing::info!("IronBridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
