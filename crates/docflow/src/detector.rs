//! Completion detector.
//!
//! A periodic sweep over `processing` jobs. When a job's counter reaches
//! its page count the sweeper tries to move it to `aggregating`; only the
//! compare-and-swap winner publishes the aggregation trigger, so any number
//! of sweepers can run side by side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::Notify;

use crate::broker::{publish_json, AggregationTrigger, Broker, Topic};
use crate::retry::RetryPolicy;
use crate::store::{Job, JobStatus, JobStore, StoreError, Transition};

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// `processing` jobs examined.
    pub scanned: usize,
    /// Jobs this sweep moved to `aggregating` and published a trigger for.
    pub triggered: usize,
    /// Jobs another sweeper claimed first.
    pub conflicts: usize,
    /// Jobs moved to `error` because the trigger could not be published.
    pub failed: usize,
}

pub struct CompletionDetector {
    store: JobStore,
    broker: Arc<dyn Broker>,
    publish_retry: RetryPolicy,
}

impl CompletionDetector {
    pub fn new(store: JobStore, broker: Arc<dyn Broker>, publish_retry: RetryPolicy) -> Self {
        Self {
            store,
            broker,
            publish_retry,
        }
    }

    pub fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let _span = tracing::info_span!("sweep").entered();
        let mut report = SweepReport::default();

        for job in self.store.jobs_with_status(JobStatus::Processing)? {
            report.scanned += 1;
            if !job.all_pages_processed() {
                continue;
            }

            match self
                .store
                .transition_status(&job.job_id, JobStatus::Processing, JobStatus::Aggregating)
            {
                Ok(Transition::Applied) => {
                    if self.publish_trigger(&job)? {
                        report.triggered += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Ok(Transition::Conflict { actual }) => {
                    log::debug!("Job {} already claimed ({})", job.job_id, actual);
                    report.conflicts += 1;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    log::warn!("Could not claim job {} for aggregation: {}", job.job_id, e);
                }
            }
        }

        if report.triggered > 0 || report.failed > 0 {
            log::info!(
                "Sweep: {} scanned, {} triggered, {} failed",
                report.scanned,
                report.triggered,
                report.failed
            );
        }
        Ok(report)
    }

    /// Publishes the trigger for a job this sweeper just claimed. If every
    /// attempt fails the job is moved to `error` so it cannot sit in
    /// `aggregating` with nothing in flight. Returns whether it published.
    fn publish_trigger(&self, job: &Job) -> Result<bool, StoreError> {
        let trigger = AggregationTrigger {
            job_id: job.job_id.clone(),
            model_id: job.model_id.clone(),
            total_pages: job.total_pages,
        };

        let published = self.publish_retry.run("publish aggregation trigger", |_| {
            publish_json(self.broker.as_ref(), Topic::AggregationTrigger, &trigger)
        });

        match published {
            Ok(()) => {
                log::info!("Job {} ready for aggregation", job.job_id);
                Ok(true)
            }
            Err(e) => {
                let message = format!("Failed to publish aggregation trigger: {}", e);
                log::error!("Job {}: {}", job.job_id, message);
                match self
                    .store
                    .fail_job(&job.job_id, JobStatus::Aggregating, &message)
                {
                    Ok(_) | Err(StoreError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// Runs [`CompletionDetector::sweep_once`] on a fixed interval in a
/// background thread.
pub struct SweepScheduler {
    detector: Arc<CompletionDetector>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl SweepScheduler {
    pub fn new(detector: Arc<CompletionDetector>, interval: Duration) -> Self {
        Self {
            detector,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Starts the sweep loop in a background thread.
    pub fn start(&self) -> std::io::Result<JoinHandle<()>> {
        let detector = Arc::clone(&self.detector);
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let interval = self.interval;

        std::thread::Builder::new()
            .name("sweeper".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Sweeper could not start its runtime: {}", e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut interval_timer = tokio::time::interval(interval);
                    interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    interval_timer.tick().await; // skip immediate first tick

                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            _ = interval_timer.tick() => {},
                            _ = wake.notified() => {
                                log::debug!("Sweeper woken");
                            },
                        }

                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        if let Err(e) = detector.sweep_once() {
                            log::error!("Sweep failed: {}", e);
                        }
                    }
                });
                log::debug!("Sweeper stopped");
            })
    }

    /// Runs a sweep now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Signals the scheduler to stop and wakes it.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}
