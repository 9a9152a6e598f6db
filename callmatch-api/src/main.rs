//! Serve ring event submission and webhook correlation over HTTP.
use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use callmatch_common::metrics::setup_metrics_routes;
use callmatch_common::ringqueue::RingQueue;
use config::Config;
use handlers::ApiState;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let queue = RingQueue::new(
        &config.database_url,
        config.max_pg_connections,
        config.duplicate_window_secs,
    )
    .await
    .expect("failed to initialize ring queue");

    if config.run_migrations {
        queue
            .run_migrations()
            .await
            .expect("failed to run migrations");
    }

    let state = ApiState {
        queue,
        match_window_secs: config.match_window_secs,
    };
    let app = handlers::add_routes(Router::new(), state);
    let app = setup_metrics_routes(app).expect("failed to install metrics recorder");

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start callmatch-api http server, {}", e),
    }
}
