//! Store incoming calls announced by the call monitor, for later matching.
use std::future::ready;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use callmatch_common::metrics::{serve, setup_metrics_routes};
use callmatch_common::ringqueue::RingQueue;
use callmatch_monitor::config::Config;
use callmatch_monitor::reader::{CallMonitorReader, ReaderSettings};
use callmatch_monitor::sweeper::RetentionSweeper;
use health::HealthRegistry;

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
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

    info!("shutting down");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let queue = RingQueue::new(
        &config.database_url,
        config.max_pg_connections,
        config.monitor.duplicate_window_secs,
    )
    .await
    .expect("failed to initialize ring queue");

    if config.run_migrations {
        queue
            .run_migrations()
            .await
            .expect("failed to run migrations");
    }

    let settings = ReaderSettings::new(&config.monitor, config.retry_policy.provide());
    let sweep_interval = Duration::from_secs(config.sweeper.sweep_interval_secs);

    let liveness = HealthRegistry::new("liveness");
    let reader_liveness = liveness.register("reader".to_string(), settings.liveness_deadline());
    let sweeper_liveness = liveness.register(
        "sweeper".to_string(),
        sweep_interval
            .saturating_mul(2)
            .saturating_add(settings.liveness_deadline()),
    );

    let sweeper = RetentionSweeper::new(
        queue.clone(),
        config.sweeper.retention_horizon_secs,
        sweep_interval,
        sweeper_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router).expect("failed to install metrics recorder");
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let shutdown = CancellationToken::new();
    tokio::task::spawn(shutdown_signal(shutdown.clone()));

    let endpoint = settings.endpoint.clone();
    let mut reader = CallMonitorReader::new(settings, queue, Box::new(sweeper), reader_liveness);

    if let Err(e) = reader.run(shutdown).await {
        error!("{}", e);
        error!(
            "check that the call monitor is enabled (dial #96*5* on the router) and that {} is \
             reachable from this host, including any firewall in between",
            endpoint
        );
        return Err(e.into());
    }

    Ok(())
}

pub async fn index() -> &'static str {
    "callmatch monitor"
}
