use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// the binary only wires things together; handlers live in the library crate
use av_server::app as lib_app;
use av_server::config::AppConfig;
use av_server::db;
use av_server::notifications::scheduler;
use av_server::state::{AppState, Integrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info,av_server=debug"));
    tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();

    let config = AppConfig::from_env().context("configuration error")?;
    let database = db::connect(&config.database)
        .await
        .context("could not create MongoDB client")?;
    if db::ping(&database).await {
        info!(database = %config.database.name, "connected to MongoDB");
    } else {
        warn!(database = %config.database.name, "MongoDB not reachable yet; requests will retry");
    }
    if let Err(e) = db::ensure_indexes(&database).await {
        warn!(error = %e, "could not ensure indexes");
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let schedule = config.schedule.clone();
    let integrations = Integrations::from_config(&config);
    let state = AppState::new(database, config, integrations);

    if schedule.enabled {
        scheduler::spawn(state.notifier.clone(), schedule);
    } else {
        info!("notification scheduler disabled");
    }

    let listener = TcpListener::bind(&addr).await.with_context(|| format!("could not bind {addr}"))?;
    info!("listening on {}", addr);
    axum::serve(listener, lib_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
}
