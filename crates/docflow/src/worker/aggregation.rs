//! Aggregation worker: page results in, final result out.

use std::sync::Arc;
use std::thread;

use crate::broker::{AggregationTrigger, Delivery, Topic};
use crate::capability::{DocumentText, ModelInvoker};
use crate::retry::RetryPolicy;
use crate::store::{
    JobStatus, JobStore, NewFinalResult, PageResult, ResultStatus, StoreError, Transition,
};

use super::pool::{DeliveryHandler, Disposition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationOutcome {
    Completed,
    /// The job was moved to `error` with this message.
    Failed(String),
    JobMissing,
    /// Duplicate trigger: the job is not waiting for aggregation.
    NotAggregating(JobStatus),
}

/// Retry budgets used by the aggregation worker.
#[derive(Debug, Clone, Default)]
pub struct AggregationPolicies {
    /// Re-reads while page results are not all visible yet.
    pub page_read: RetryPolicy,
    pub model: RetryPolicy,
    /// Final-result writes; exhausting it raises an operator alert.
    pub store: RetryPolicy,
}

pub struct AggregationWorker {
    store: JobStore,
    invoker: Arc<dyn ModelInvoker>,
    policies: AggregationPolicies,
}

impl AggregationWorker {
    pub fn new(
        store: JobStore,
        invoker: Arc<dyn ModelInvoker>,
        policies: AggregationPolicies,
    ) -> Self {
        Self {
            store,
            invoker,
            policies,
        }
    }

    pub fn process(&self, trigger: &AggregationTrigger) -> Result<AggregationOutcome, StoreError> {
        let _span = tracing::info_span!("aggregation", job_id = %trigger.job_id).entered();

        let job = match self.store.get_job(&trigger.job_id) {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(AggregationOutcome::JobMissing),
            Err(e) => return Err(e),
        };
        if job.status != JobStatus::Aggregating {
            log::debug!(
                "Ignoring trigger for job {} in state {}",
                job.job_id,
                job.status
            );
            return Ok(AggregationOutcome::NotAggregating(job.status));
        }
        if trigger.total_pages != job.total_pages {
            log::warn!(
                "Trigger for job {} says {} pages, job has {}",
                job.job_id,
                trigger.total_pages,
                job.total_pages
            );
        }

        // A previous delivery stored the result but did not finish the job.
        if self.store.get_final_result(&job.job_id)?.is_some() {
            log::info!("Final result for job {} already stored", job.job_id);
            return self.finish(&job.job_id, job.total_pages);
        }

        let pages = match self.read_pages(&job.job_id, job.total_pages)? {
            Ok(pages) => pages,
            Err(found) => {
                let message = format!(
                    "Only {} of {} page results available for aggregation",
                    found, job.total_pages
                );
                return self.fail(&job.job_id, message);
            }
        };

        let document = DocumentText::from_pages(&pages);
        let synthesis = match self.policies.model.run("document synthesis", |_| {
            self.invoker.synthesize(&document, &job.model_id)
        }) {
            Ok(synthesis) => synthesis,
            Err(e) => return self.fail(&job.job_id, format!("Aggregation failed: {}", e)),
        };

        let final_result = NewFinalResult {
            document_overview: synthesis.document_overview,
            markdown_content: synthesis.markdown_content,
            status: ResultStatus::Completed,
            model_id: job.model_id.clone(),
        };
        let written = self.policies.store.run("write final result", |_| {
            self.store.write_final_result(&job.job_id, &final_result)
        });
        match written {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => return Ok(AggregationOutcome::JobMissing),
            Err(e) => {
                log::error!(
                    "ALERT: final result for job {} could not be stored after {} attempts: {}",
                    job.job_id,
                    self.policies.store.max_attempts,
                    e
                );
                return Err(e);
            }
        }

        self.finish(&job.job_id, job.total_pages)
    }

    fn finish(&self, job_id: &str, total_pages: u32) -> Result<AggregationOutcome, StoreError> {
        match self
            .store
            .transition_status(job_id, JobStatus::Aggregating, JobStatus::Completed)
        {
            Ok(Transition::Applied) => {
                log::info!("Job {} completed ({} pages)", job_id, total_pages);
                Ok(AggregationOutcome::Completed)
            }
            Ok(Transition::Conflict { actual }) => {
                log::debug!("Job {} finalized concurrently as {}", job_id, actual);
                Ok(AggregationOutcome::NotAggregating(actual))
            }
            Err(StoreError::NotFound(_)) => Ok(AggregationOutcome::JobMissing),
            Err(e) => Err(e),
        }
    }

    /// Reads page results until all `total` are visible or the read budget
    /// is spent. The inner `Err` carries how many were found.
    fn read_pages(
        &self,
        job_id: &str,
        total: u32,
    ) -> Result<Result<Vec<PageResult>, usize>, StoreError> {
        let policy = &self.policies.page_read;
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let visible = self.store.page_result_count(job_id)?;
            if visible >= u64::from(total) {
                return Ok(Ok(self.store.page_results(job_id)?));
            }
            if attempt >= attempts {
                return Ok(Err(visible as usize));
            }
            let delay = policy.backoff_for(attempt);
            log::debug!(
                "Job {} has {}/{} page results visible, re-reading in {:?}",
                job_id,
                visible,
                total,
                delay
            );
            thread::sleep(delay);
            attempt += 1;
        }
    }

    fn fail(&self, job_id: &str, message: String) -> Result<AggregationOutcome, StoreError> {
        log::error!("Job {} failed: {}", job_id, message);
        match self.store.fail_job(job_id, JobStatus::Aggregating, &message) {
            Ok(Transition::Applied) => Ok(AggregationOutcome::Failed(message)),
            Ok(Transition::Conflict { actual }) => Ok(AggregationOutcome::NotAggregating(actual)),
            Err(StoreError::NotFound(_)) => Ok(AggregationOutcome::JobMissing),
            Err(e) => Err(e),
        }
    }
}

impl DeliveryHandler for AggregationWorker {
    fn topic(&self) -> Topic {
        Topic::AggregationTrigger
    }

    fn handle(&self, delivery: &Delivery) -> Disposition {
        let trigger = match AggregationTrigger::decode(&delivery.payload) {
            Ok(trigger) => trigger,
            Err(e) => return Disposition::DeadLetter(e.to_string()),
        };

        match self.process(&trigger) {
            Ok(_) => Disposition::Ack,
            Err(e) => {
                log::error!(
                    "Aggregation of job {} interrupted, will be redelivered: {}",
                    trigger.job_id,
                    e
                );
                Disposition::Nack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Synthesis, TemplateSummarizer};
    use crate::db::Database;
    use crate::error::CapabilityError;
    use crate::store::{FileType, NewJob, NewPageResult};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Records the document it was given; fails if `error` is set.
    struct Capturing {
        seen: Mutex<Option<DocumentText>>,
        calls: AtomicU32,
        error: Option<CapabilityError>,
    }

    impl ModelInvoker for Capturing {
        fn synthesize(
            &self,
            document: &DocumentText,
            model_id: &str,
        ) -> Result<Synthesis, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen.lock().unwrap() = Some(document.clone());
            match &self.error {
                Some(e) => Err(e.clone()),
                None => TemplateSummarizer.synthesize(document, model_id),
            }
        }
    }

    fn capturing(error: Option<CapabilityError>) -> Arc<Capturing> {
        Arc::new(Capturing {
            seen: Mutex::new(None),
            calls: AtomicU32::new(0),
            error,
        })
    }

    fn policies() -> AggregationPolicies {
        AggregationPolicies {
            page_read: RetryPolicy::immediate(2),
            model: RetryPolicy::immediate(2),
            store: RetryPolicy::immediate(2),
        }
    }

    /// A job in `aggregating` with the given pages recorded.
    fn aggregating_job(store: &JobStore, total: u32, recorded: &[u32]) -> String {
        let id = store
            .create_job(&NewJob {
                file_name: "doc.pdf".to_string(),
                file_type: FileType::Pdf,
                total_pages: total,
                model_id: "m".to_string(),
            })
            .unwrap();
        for n in recorded {
            store
                .record_page_result(&id, *n, &NewPageResult::completed(format!("p{}", n), 0.9, "m"))
                .unwrap();
        }
        store
            .transition_status(&id, JobStatus::Processing, JobStatus::Aggregating)
            .unwrap();
        id
    }

    fn fixed_backoff(max_attempts: u32, backoff_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: backoff_ms,
            max_backoff_ms: backoff_ms,
            multiplier: 1.0,
        }
    }

    /// File-backed store whose writes give up quickly on a locked database.
    fn file_store(dir: &tempfile::TempDir) -> (JobStore, PathBuf) {
        let path = dir.path().join("jobs.db");
        let db = Database::open(&path).unwrap();
        db.set_busy_timeout(Duration::from_millis(10)).unwrap();
        (JobStore::new(db), path)
    }

    /// Takes the write lock from a second connection. Reads still work (WAL).
    fn lock_writes(path: &Path) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        conn
    }

    fn trigger(job_id: &str, total_pages: u32) -> AggregationTrigger {
        AggregationTrigger {
            job_id: job_id.to_string(),
            model_id: "m".to_string(),
            total_pages,
        }
    }

    #[test]
    fn test_aggregates_in_page_order() {
        let store = JobStore::in_memory().unwrap();
        let id = aggregating_job(&store, 3, &[3, 1, 2]);
        let invoker = capturing(None);
        let worker = AggregationWorker::new(store.clone(), invoker.clone(), policies());

        assert_eq!(
            worker.process(&trigger(&id, 3)).unwrap(),
            AggregationOutcome::Completed
        );

        let seen = invoker.seen.lock().unwrap().clone().unwrap();
        let order: Vec<u32> = seen.sections().iter().map(|s| s.page_number).collect();
        assert_eq!(order, [1, 2, 3]);

        let job = store.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.duration_seconds.is_some());
        let result = store.get_final_result(&id).unwrap().unwrap();
        assert!(result.markdown_content.contains("### Page 1\np1"));
    }

    #[test]
    fn test_duplicate_trigger_is_ignored() {
        let store = JobStore::in_memory().unwrap();
        let id = aggregating_job(&store, 1, &[1]);
        let invoker = capturing(None);
        let worker = AggregationWorker::new(store.clone(), invoker, policies());

        worker.process(&trigger(&id, 1)).unwrap();
        assert_eq!(
            worker.process(&trigger(&id, 1)).unwrap(),
            AggregationOutcome::NotAggregating(JobStatus::Completed)
        );
    }

    #[test]
    fn test_missing_pages_fail_the_job() {
        let store = JobStore::in_memory().unwrap();
        let id = store
            .create_job(&NewJob {
                file_name: "doc.pdf".to_string(),
                file_type: FileType::Pdf,
                total_pages: 2,
                model_id: "m".to_string(),
            })
            .unwrap();
        store
            .record_page_result(&id, 1, &NewPageResult::completed("p1", 0.9, "m"))
            .unwrap();
        // Counter forced full without the second page result.
        store.increment_processed_pages(&id).unwrap();
        store
            .transition_status(&id, JobStatus::Processing, JobStatus::Aggregating)
            .unwrap();

        let worker = AggregationWorker::new(store.clone(), capturing(None), policies());
        let outcome = worker.process(&trigger(&id, 2)).unwrap();
        assert!(matches!(outcome, AggregationOutcome::Failed(ref m) if m.contains("1 of 2")));
        assert_eq!(store.get_job(&id).unwrap().status, JobStatus::Error);
    }

    #[test]
    fn test_model_failure_fails_the_job() {
        let store = JobStore::in_memory().unwrap();
        let id = aggregating_job(&store, 1, &[1]);
        let worker = AggregationWorker::new(
            store.clone(),
            capturing(Some(CapabilityError::transient("overloaded"))),
            policies(),
        );

        let outcome = worker.process(&trigger(&id, 1)).unwrap();
        assert!(matches!(outcome, AggregationOutcome::Failed(_)));

        let job = store.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error_message.unwrap().contains("overloaded"));
        assert!(store.get_final_result(&id).unwrap().is_none());
    }

    #[test]
    fn test_deleted_job_is_dropped() {
        let store = JobStore::in_memory().unwrap();
        let worker = AggregationWorker::new(store, capturing(None), policies());
        assert_eq!(
            worker.process(&trigger("gone", 1)).unwrap(),
            AggregationOutcome::JobMissing
        );
    }

    #[test]
    fn test_malformed_trigger_is_dead_lettered() {
        let store = JobStore::in_memory().unwrap();
        let worker = AggregationWorker::new(store, capturing(None), policies());
        let delivery = Delivery {
            id: 7,
            topic: Topic::AggregationTrigger,
            payload: br#"{"job_id": 12}"#.to_vec(),
            attempt: 1,
        };
        assert!(matches!(worker.handle(&delivery), Disposition::DeadLetter(_)));
    }

    #[test]
    fn test_final_write_outage_nacks_and_keeps_job_aggregating() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = file_store(&dir);
        let id = aggregating_job(&store, 2, &[1, 2]);
        let invoker = capturing(None);
        let worker = AggregationWorker::new(
            store.clone(),
            invoker.clone(),
            AggregationPolicies {
                store: fixed_backoff(3, 5),
                ..policies()
            },
        );
        let delivery = Delivery {
            id: 1,
            topic: Topic::AggregationTrigger,
            payload: serde_json::to_vec(&trigger(&id, 2)).unwrap(),
            attempt: 1,
        };

        let locker = lock_writes(&path);
        assert_eq!(worker.handle(&delivery), Disposition::Nack);
        let job = store.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Aggregating);
        assert!(job.error_message.is_none());
        assert!(store.get_final_result(&id).unwrap().is_none());

        locker.execute_batch("ROLLBACK").unwrap();
        assert_eq!(worker.handle(&delivery), Disposition::Ack);
        assert_eq!(store.get_job(&id).unwrap().status, JobStatus::Completed);
        assert!(store.get_final_result(&id).unwrap().is_some());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_final_write_succeeds_once_the_lock_clears() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = file_store(&dir);
        let id = aggregating_job(&store, 1, &[1]);
        let worker = AggregationWorker::new(
            store.clone(),
            capturing(None),
            AggregationPolicies {
                store: fixed_backoff(100, 20),
                ..policies()
            },
        );

        let locker = lock_writes(&path);
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            locker.execute_batch("ROLLBACK").unwrap();
        });

        let started = Instant::now();
        assert_eq!(
            worker.process(&trigger(&id, 1)).unwrap(),
            AggregationOutcome::Completed
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
        release.join().unwrap();

        assert_eq!(store.get_job(&id).unwrap().status, JobStatus::Completed);
        assert!(store.get_final_result(&id).unwrap().is_some());
    }

    #[test]
    fn test_page_arriving_between_reads_is_aggregated() {
        let store = JobStore::in_memory().unwrap();
        let id = store
            .create_job(&NewJob {
                file_name: "doc.pdf".to_string(),
                file_type: FileType::Pdf,
                total_pages: 2,
                model_id: "m".to_string(),
            })
            .unwrap();
        store
            .record_page_result(&id, 1, &NewPageResult::completed("p1", 0.9, "m"))
            .unwrap();
        store.increment_processed_pages(&id).unwrap();
        store
            .transition_status(&id, JobStatus::Processing, JobStatus::Aggregating)
            .unwrap();

        let invoker = capturing(None);
        let worker = AggregationWorker::new(
            store.clone(),
            invoker.clone(),
            AggregationPolicies {
                page_read: fixed_backoff(100, 10),
                ..policies()
            },
        );

        let late = store.clone();
        let late_id = id.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            late.upsert_page_result(&late_id, 2, &NewPageResult::completed("p2", 0.9, "m"))
                .unwrap();
        });

        assert_eq!(
            worker.process(&trigger(&id, 2)).unwrap(),
            AggregationOutcome::Completed
        );
        writer.join().unwrap();

        let seen = invoker.seen.lock().unwrap().clone().unwrap();
        let order: Vec<u32> = seen.sections().iter().map(|s| s.page_number).collect();
        assert_eq!(order, [1, 2]);
    }

    #[test]
    fn test_stored_result_is_not_synthesized_again() {
        let store = JobStore::in_memory().unwrap();
        let id = aggregating_job(&store, 1, &[1]);
        store
            .write_final_result(
                &id,
                &NewFinalResult {
                    document_overview: "earlier run".to_string(),
                    markdown_content: "## Summary\nearlier run".to_string(),
                    status: ResultStatus::Completed,
                    model_id: "m".to_string(),
                },
            )
            .unwrap();

        let invoker = capturing(None);
        let worker = AggregationWorker::new(store.clone(), invoker.clone(), policies());
        assert_eq!(
            worker.process(&trigger(&id, 1)).unwrap(),
            AggregationOutcome::Completed
        );

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get_job(&id).unwrap().status, JobStatus::Completed);
        let result = store.get_final_result(&id).unwrap().unwrap();
        assert_eq!(result.document_overview, "earlier run");
    }
}
