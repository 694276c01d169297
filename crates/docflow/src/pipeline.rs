//! Wires the store, broker, capabilities, worker pools and sweeper into a
//! running pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;

use crate::broker::{Broker, Topic};
use crate::capability::{
    HttpModelClient, HttpModelConfig, ModelCatalog, ModelInvoker, PageAnalyzer,
};
use crate::config::Config;
use crate::db::{default_database_path, Database};
use crate::detector::{CompletionDetector, SweepScheduler};
use crate::error::{ConfigError, Result};
use crate::status::StatusService;
use crate::store::JobStore;
use crate::submit::Submitter;
use crate::worker::{AggregationPolicies, AggregationWorker, PageWorker, WorkerPool};

/// The two external capabilities the workers call.
#[derive(Clone)]
pub struct Capabilities {
    pub analyzer: Arc<dyn PageAnalyzer>,
    pub invoker: Arc<dyn ModelInvoker>,
}

impl Capabilities {
    pub fn new(analyzer: Arc<dyn PageAnalyzer>, invoker: Arc<dyn ModelInvoker>) -> Self {
        Self { analyzer, invoker }
    }

    /// Picks capabilities from the config: the HTTP model endpoint when one
    /// is configured, otherwise local OCR with template summaries.
    pub fn from_config(config: &Config) -> Result<Self> {
        if let Some(endpoint) = &config.model_endpoint {
            let api_key = match &endpoint.api_key_env {
                Some(name) => match std::env::var(name) {
                    Ok(key) if !key.is_empty() => Some(SecretString::from(key)),
                    _ => {
                        log::warn!("API key variable {} is not set; sending no credentials", name);
                        None
                    }
                },
                None => None,
            };
            let client = Arc::new(HttpModelClient::new(
                HttpModelConfig {
                    base_url: endpoint.base_url.clone(),
                    timeout: Duration::from_secs(endpoint.timeout_secs),
                    api_key,
                },
                config.models.clone(),
            )?);
            log::info!("Using model endpoint at {}", endpoint.base_url);
            return Ok(Self::new(client.clone(), client));
        }

        Self::local(config)
    }

    #[cfg(feature = "ocr")]
    fn local(config: &Config) -> Result<Self> {
        use crate::capability::{OcrPageAnalyzer, TemplateSummarizer};

        log::info!("Using local OCR ({})", config.ocr.languages.join("+"));
        Ok(Self::new(
            Arc::new(OcrPageAnalyzer::new(&config.ocr.languages)),
            Arc::new(TemplateSummarizer),
        ))
    }

    #[cfg(not(feature = "ocr"))]
    fn local(_config: &Config) -> Result<Self> {
        Err(ConfigError::Validation {
            message: "no page analyzer available: set model_endpoint or build with the 'ocr' feature"
                .to_string(),
        }
        .into())
    }
}

/// Store and broker reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub store: bool,
    pub broker: bool,
}

impl HealthReport {
    pub fn check(store: &JobStore, broker: &dyn Broker) -> Self {
        Self {
            store: store.ping().is_ok(),
            broker: broker.is_healthy(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.store && self.broker
    }
}

/// Opens the configured database, retrying per the startup policy.
pub fn open_store(config: &Config) -> Result<JobStore> {
    let path: PathBuf = match &config.database.path {
        Some(path) => path.clone(),
        None => default_database_path().ok_or_else(|| ConfigError::Validation {
            message: "database.path is not set and no home directory was found".to_string(),
        })?,
    };
    let db = Database::open_with_retry(&path, &config.retry.startup)?;
    db.set_busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))?;
    Ok(JobStore::new(db))
}

/// A running pipeline: page and aggregation pools plus the sweeper.
pub struct Pipeline {
    store: JobStore,
    broker: Arc<dyn Broker>,
    submitter: Arc<Submitter>,
    status: StatusService,
    page_pool: WorkerPool,
    aggregation_pool: WorkerPool,
    scheduler: SweepScheduler,
    sweeper: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start(
        config: &Config,
        store: JobStore,
        broker: Arc<dyn Broker>,
        capabilities: Capabilities,
    ) -> Result<Self> {
        config
            .retry
            .broker
            .run("ensure topics", |_| broker.ensure_topics(&Topic::ALL))?;

        let receive_timeout = Duration::from_millis(config.workers.receive_timeout_ms);

        let page_worker = Arc::new(PageWorker::new(
            store.clone(),
            capabilities.analyzer,
            config.retry.capability.clone(),
        ));
        let page_pool = WorkerPool::start(
            "page",
            Arc::clone(&broker),
            page_worker,
            config.workers.page_workers,
            receive_timeout,
            config.retry.redelivery.clone(),
        )?;

        let aggregation_worker = Arc::new(AggregationWorker::new(
            store.clone(),
            capabilities.invoker,
            AggregationPolicies {
                page_read: config.retry.page_read.clone(),
                model: config.retry.capability.clone(),
                store: config.retry.store.clone(),
            },
        ));
        let aggregation_pool = match WorkerPool::start(
            "aggregation",
            Arc::clone(&broker),
            aggregation_worker,
            config.workers.aggregation_workers,
            receive_timeout,
            config.retry.redelivery.clone(),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                page_pool.wait();
                return Err(e.into());
            }
        };

        let detector = Arc::new(CompletionDetector::new(
            store.clone(),
            Arc::clone(&broker),
            config.retry.broker.clone(),
        ));
        let scheduler =
            SweepScheduler::new(detector, Duration::from_millis(config.sweeper.interval_ms));
        let sweeper = match scheduler.start() {
            Ok(handle) => handle,
            Err(e) => {
                page_pool.wait();
                aggregation_pool.wait();
                return Err(crate::error::WorkerError::SpawnFailed(format!("sweeper: {}", e)).into());
            }
        };

        let submitter = Arc::new(Submitter::new(
            store.clone(),
            Arc::clone(&broker),
            config.models.clone(),
            config.retry.broker.clone(),
        ));

        log::info!(
            "Pipeline started: {} page workers, {} aggregation workers, sweep every {} ms",
            config.workers.page_workers,
            config.workers.aggregation_workers,
            config.sweeper.interval_ms
        );

        Ok(Self {
            status: StatusService::new(store.clone()),
            store,
            broker,
            submitter,
            page_pool,
            aggregation_pool,
            scheduler,
            sweeper: Some(sweeper),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn submitter(&self) -> Arc<Submitter> {
        Arc::clone(&self.submitter)
    }

    pub fn status(&self) -> StatusService {
        self.status.clone()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        self.submitter.catalog()
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::check(&self.store, self.broker.as_ref())
    }

    /// Runs a completion sweep without waiting for the next tick.
    pub fn trigger_sweep(&self) {
        self.scheduler.trigger();
    }

    /// Stops the sweeper, then drains both worker pools.
    pub fn shutdown(mut self) {
        log::info!("Stopping pipeline...");
        self.scheduler.stop();
        if let Some(handle) = self.sweeper.take() {
            if handle.join().is_err() {
                log::error!("Sweeper thread panicked");
            }
        }
        self.page_pool.shutdown();
        self.aggregation_pool.shutdown();
        self.page_pool.wait();
        self.aggregation_pool.wait();
        log::info!("Pipeline stopped");
    }
}
