//! Shared state handed to every route.

use std::sync::Arc;

use docflow::{Broker, HealthReport, JobStore, Pipeline, StatusService, Submitter};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: JobStore,
    broker: Arc<dyn Broker>,
    submitter: Arc<Submitter>,
    status: StatusService,
}

impl AppState {
    pub fn new(store: JobStore, broker: Arc<dyn Broker>, submitter: Arc<Submitter>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                status: StatusService::new(store.clone()),
                store,
                broker,
                submitter,
            }),
        }
    }

    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(
            pipeline.store().clone(),
            pipeline.broker(),
            pipeline.submitter(),
        )
    }

    pub fn submitter(&self) -> Arc<Submitter> {
        Arc::clone(&self.inner.submitter)
    }

    pub fn status(&self) -> StatusService {
        self.inner.status.clone()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::check(&self.inner.store, self.inner.broker.as_ref())
    }
}
