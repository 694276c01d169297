//! docflow server: hosts the worker pools and the completion sweeper, and
//! serves the job status API.

mod error;
mod routes;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use docflow::telemetry::{self, LogFormat};
use docflow::{load_config_with_env, open_store, Capabilities, MemoryBroker, Pipeline};
use tokio::sync::Notify;

use crate::state::AppState;

fn main() -> ExitCode {
    let level = std::env::var("DOCFLOW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let format = LogFormat::parse(&std::env::var("DOCFLOW_LOG_FORMAT").unwrap_or_default());
    if let Err(e) = telemetry::init(&level, format) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("DOCFLOW_CONFIG").map(PathBuf::from));
    match &config_path {
        Some(path) => log::info!("Loading config from {}", path.display()),
        None => log::info!("No config file given, using defaults"),
    }
    let config = load_config_with_env(config_path.as_deref())?;

    // The blocking HTTP client and the worker threads must be created
    // outside the async runtime.
    let capabilities = Capabilities::from_config(&config)?;
    let store = open_store(&config)?;
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = Pipeline::start(&config, store, broker, capabilities)?;

    let health = pipeline.health();
    if !health.is_healthy() {
        log::warn!("Starting degraded: {:?}", health);
    }

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        signal.notify_one();
    })?;

    let app = routes::router(AppState::from_pipeline(&pipeline));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("docflow-http")
        .build()?;

    let served = runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(config.server.http_addr.as_str()).await?;
        log::info!("Listening on http://{}", config.server.http_addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await
    });

    pipeline.shutdown();
    served?;
    Ok(())
}
