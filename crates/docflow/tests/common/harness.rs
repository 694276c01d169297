//! Test harness stepping the pipeline stages by hand.
//!
//! Nothing runs in the background: tests pull deliveries off the in-memory
//! broker and hand them to the workers in whatever order the scenario
//! needs, then run sweeps explicitly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use docflow::broker::{Delivery, PageWorkMessage};
use docflow::submit::Submission;
use docflow::worker::{
    AggregationPolicies, AggregationWorker, DeliveryHandler, Disposition, PageWorker,
};
use docflow::{
    Broker, CompletionDetector, JobStore, MemoryBroker, ModelCatalog, RetryPolicy, SweepReport,
    Submitter, Topic,
};

use super::capabilities::{page, RecordingInvoker, ScriptedAnalyzer};

pub const MODEL: &str = "gemini-2.5-flash";

pub struct TestHarness {
    pub store: JobStore,
    pub broker: Arc<MemoryBroker>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub invoker: Arc<RecordingInvoker>,
    pub submitter: Submitter,
    pub page_worker: PageWorker,
    pub aggregation_worker: AggregationWorker,
    pub detector: CompletionDetector,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_invoker(RecordingInvoker::default())
    }

    pub fn with_invoker(invoker: RecordingInvoker) -> Self {
        Self::with_store(JobStore::in_memory().expect("Failed to open in-memory store"), invoker)
    }

    pub fn with_store(store: JobStore, invoker: RecordingInvoker) -> Self {
        let broker = Arc::new(MemoryBroker::with_default_topics());
        let analyzer = Arc::new(ScriptedAnalyzer::default());
        let invoker = Arc::new(invoker);
        let retry = RetryPolicy::immediate(3);

        Self {
            submitter: Submitter::new(
                store.clone(),
                broker.clone(),
                ModelCatalog::default(),
                retry.clone(),
            ),
            page_worker: PageWorker::new(store.clone(), analyzer.clone(), retry.clone()),
            aggregation_worker: AggregationWorker::new(
                store.clone(),
                invoker.clone(),
                AggregationPolicies {
                    page_read: RetryPolicy::immediate(2),
                    model: retry.clone(),
                    store: retry.clone(),
                },
            ),
            detector: CompletionDetector::new(store.clone(), broker.clone(), retry),
            store,
            broker,
            analyzer,
            invoker,
        }
    }

    /// Submits a PDF whose pages carry the given texts.
    pub fn submit(&self, texts: &[&str]) -> String {
        self.submitter
            .submit(Submission {
                file_name: "document.pdf".to_string(),
                file_type: None,
                model_id: MODEL.to_string(),
                pages: texts.iter().map(|t| page(t)).collect(),
            })
            .expect("Failed to submit job")
    }

    /// Drains every waiting delivery from a topic without settling it.
    pub fn take(&self, topic: Topic) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while let Some(d) = self
            .broker
            .receive(topic, Duration::from_millis(5))
            .expect("Failed to receive")
        {
            deliveries.push(d);
        }
        deliveries
    }

    /// Takes the page deliveries and orders them by page number.
    pub fn take_pages(&self) -> Vec<Delivery> {
        let mut pages = self.take(Topic::PageWork);
        pages.sort_by_key(|d| {
            PageWorkMessage::decode(&d.payload)
                .map(|w| w.page_number)
                .unwrap_or(u32::MAX)
        });
        pages
    }

    /// Runs a delivery through the handler for its topic and settles it the
    /// way a worker pool would.
    pub fn deliver(&self, delivery: &Delivery) -> Disposition {
        let disposition = match delivery.topic {
            Topic::PageWork => self.page_worker.handle(delivery),
            Topic::AggregationTrigger => self.aggregation_worker.handle(delivery),
            Topic::DeadLetter => panic!("dead letters are not delivered to workers"),
        };
        match &disposition {
            Disposition::Ack => self.broker.ack(delivery),
            Disposition::Nack => self.broker.nack(delivery),
            Disposition::DeadLetter(reason) => self.broker.dead_letter(delivery, reason),
        }
        .expect("Failed to settle delivery");
        disposition
    }

    pub fn sweep(&self) -> SweepReport {
        self.detector.sweep_once().expect("Sweep failed")
    }

    /// Delivers every waiting aggregation trigger.
    pub fn aggregate(&self) -> usize {
        let triggers = self.take(Topic::AggregationTrigger);
        for trigger in &triggers {
            self.deliver(trigger);
        }
        triggers.len()
    }

    /// Processes all pages in order, sweeps, and aggregates.
    pub fn run_to_completion(&self) {
        for delivery in self.take_pages() {
            self.deliver(&delivery);
        }
        self.sweep();
        self.aggregate();
    }
}
