//! Page worker: one page-work message in, one page result out.

use std::sync::Arc;

use crate::broker::{Delivery, PageWork, PageWorkMessage, Topic};
use crate::capability::PageAnalyzer;
use crate::error::ValidationError;
use crate::retry::RetryPolicy;
use crate::store::{JobStore, NewPageResult, PageWrite, ResultStatus, StoreError};

use super::pool::{DeliveryHandler, Disposition};

/// What happened to a page work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Recorded {
        status: ResultStatus,
        processed_pages: u32,
    },
    /// A result for this page already existed.
    Duplicate,
    /// The job was deleted.
    JobMissing,
    /// The job already reached a terminal state.
    JobFinished,
}

pub struct PageWorker {
    store: JobStore,
    analyzer: Arc<dyn PageAnalyzer>,
    retry: RetryPolicy,
}

impl PageWorker {
    pub fn new(store: JobStore, analyzer: Arc<dyn PageAnalyzer>, retry: RetryPolicy) -> Self {
        Self {
            store,
            analyzer,
            retry,
        }
    }

    /// Analyzes the page and records the result.
    ///
    /// Analyzer failures never surface as errors: they become an `error`
    /// page result so the job still completes. Only store failures do.
    pub fn process(&self, work: &PageWork) -> Result<PageOutcome, StoreError> {
        let _span = tracing::info_span!(
            "page_worker",
            job_id = %work.job_id,
            page = work.page_number
        )
        .entered();

        let job = match self.store.get_job(&work.job_id) {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                log::debug!("Dropping page {} of deleted job {}", work.page_number, work.job_id);
                return Ok(PageOutcome::JobMissing);
            }
            Err(e) => return Err(e),
        };

        if job.status.is_terminal() {
            log::debug!(
                "Dropping page {} of job {} in terminal state {}",
                work.page_number,
                work.job_id,
                job.status
            );
            return Ok(PageOutcome::JobFinished);
        }

        if work.page_number > job.total_pages {
            return Err(ValidationError::new(
                "page_number",
                format!("{} is outside 1..={}", work.page_number, job.total_pages),
            )
            .into());
        }

        if self.store.page_result_exists(&work.job_id, work.page_number)? {
            log::debug!("Page {} of job {} already recorded", work.page_number, work.job_id);
            return Ok(PageOutcome::Duplicate);
        }

        let analysis = self.retry.run("page analysis", |_| {
            self.analyzer.analyze(&work.image, &work.model_id)
        });

        let result = match analysis {
            Ok(analysis) => NewPageResult::completed(
                analysis.text,
                confidence_score(analysis.confidence),
                &work.model_id,
            ),
            Err(e) => {
                log::warn!(
                    "Page {} of job {} failed: {}",
                    work.page_number,
                    work.job_id,
                    e
                );
                NewPageResult::failed(e.to_string(), &work.model_id)
            }
        };
        let status = result.status;

        match self
            .store
            .record_page_result(&work.job_id, work.page_number, &result)
        {
            Ok(PageWrite::Recorded { processed_pages }) => {
                log::info!(
                    "Recorded page {} of job {} ({}/{})",
                    work.page_number,
                    work.job_id,
                    processed_pages,
                    job.total_pages
                );
                Ok(PageOutcome::Recorded {
                    status,
                    processed_pages,
                })
            }
            Ok(PageWrite::Duplicate) => Ok(PageOutcome::Duplicate),
            // Deleted while the page was being analyzed.
            Err(StoreError::NotFound(_)) => Ok(PageOutcome::JobMissing),
            Err(e) => Err(e),
        }
    }
}

/// Analyzers may report anything; NaN and infinities count as no confidence.
fn confidence_score(reported: f64) -> f64 {
    if reported.is_finite() {
        reported.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl DeliveryHandler for PageWorker {
    fn topic(&self) -> Topic {
        Topic::PageWork
    }

    fn handle(&self, delivery: &Delivery) -> Disposition {
        let work = match PageWorkMessage::decode(&delivery.payload) {
            Ok(work) => work,
            Err(e) => return Disposition::DeadLetter(e.to_string()),
        };

        match self.process(&work) {
            Ok(_) => Disposition::Ack,
            Err(StoreError::Validation(e)) => Disposition::DeadLetter(e.to_string()),
            Err(e) => {
                log::error!(
                    "Failed to store page {} of job {}, will be redelivered: {}",
                    work.page_number,
                    work.job_id,
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
    use crate::capability::PageAnalysis;
    use crate::error::CapabilityError;
    use crate::store::{FileType, JobStatus, NewJob};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyAnalyzer {
        failures_before_success: u32,
        calls: AtomicU32,
        permanent: bool,
    }

    impl PageAnalyzer for FlakyAnalyzer {
        fn analyze(&self, image: &[u8], _model_id: &str) -> Result<PageAnalysis, CapabilityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.permanent {
                return Err(CapabilityError::permanent("unreadable page"));
            }
            if call <= self.failures_before_success {
                return Err(CapabilityError::transient("timeout"));
            }
            Ok(PageAnalysis {
                text: String::from_utf8_lossy(image).into_owned(),
                confidence: 0.8,
            })
        }
    }

    /// Succeeds with a fixed confidence value.
    struct FixedConfidence(f64);

    impl PageAnalyzer for FixedConfidence {
        fn analyze(&self, _image: &[u8], _model_id: &str) -> Result<PageAnalysis, CapabilityError> {
            Ok(PageAnalysis {
                text: "scanned".to_string(),
                confidence: self.0,
            })
        }
    }

    fn analyzer(failures: u32, permanent: bool) -> Arc<FlakyAnalyzer> {
        Arc::new(FlakyAnalyzer {
            failures_before_success: failures,
            calls: AtomicU32::new(0),
            permanent,
        })
    }

    fn setup(pages: u32) -> (JobStore, String) {
        let store = JobStore::in_memory().unwrap();
        let id = store
            .create_job(&NewJob {
                file_name: "doc.pdf".to_string(),
                file_type: FileType::Pdf,
                total_pages: pages,
                model_id: "m".to_string(),
            })
            .unwrap();
        (store, id)
    }

    fn work(job_id: &str, page: u32) -> PageWork {
        PageWork {
            job_id: job_id.to_string(),
            page_number: page,
            image: format!("text of page {}", page).into_bytes(),
            model_id: "m".to_string(),
        }
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let (store, id) = setup(1);
        let analyzer = analyzer(2, false);
        let worker = PageWorker::new(store.clone(), analyzer.clone(), RetryPolicy::immediate(3));

        let outcome = worker.process(&work(&id, 1)).unwrap();
        assert_eq!(
            outcome,
            PageOutcome::Recorded {
                status: ResultStatus::Completed,
                processed_pages: 1
            }
        );
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.page_results(&id).unwrap()[0].extracted_text, "text of page 1");
    }

    #[test]
    fn test_permanent_failure_records_error_page_and_counts() {
        let (store, id) = setup(2);
        let worker = PageWorker::new(store.clone(), analyzer(0, true), RetryPolicy::immediate(3));

        let outcome = worker.process(&work(&id, 2)).unwrap();
        assert_eq!(
            outcome,
            PageOutcome::Recorded {
                status: ResultStatus::Error,
                processed_pages: 1
            }
        );
        let page = &store.page_results(&id).unwrap()[0];
        assert_eq!(page.status, ResultStatus::Error);
        assert_eq!(page.extracted_text, "");
        assert_eq!(page.confidence_score, 0.0);
        assert!(page.error_message.as_deref().unwrap().contains("unreadable page"));
    }

    #[test]
    fn test_redelivery_is_a_no_op() {
        let (store, id) = setup(2);
        let analyzer = analyzer(0, false);
        let worker = PageWorker::new(store.clone(), analyzer.clone(), RetryPolicy::immediate(1));

        worker.process(&work(&id, 1)).unwrap();
        assert_eq!(worker.process(&work(&id, 1)).unwrap(), PageOutcome::Duplicate);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_job(&id).unwrap().processed_pages, 1);
    }

    #[test]
    fn test_deleted_and_finished_jobs_are_dropped() {
        let (store, id) = setup(1);
        let worker = PageWorker::new(store.clone(), analyzer(0, false), RetryPolicy::immediate(1));

        assert_eq!(
            worker.process(&work("missing", 1)).unwrap(),
            PageOutcome::JobMissing
        );

        store.fail_job(&id, JobStatus::Processing, "fan-out failed").unwrap();
        assert_eq!(worker.process(&work(&id, 1)).unwrap(), PageOutcome::JobFinished);
        assert!(store.page_results(&id).unwrap().is_empty());
    }

    #[test]
    fn test_handle_dead_letters_bad_payloads() {
        let (store, id) = setup(1);
        let worker = PageWorker::new(store, analyzer(0, false), RetryPolicy::immediate(1));

        let garbage = Delivery {
            id: 1,
            topic: Topic::PageWork,
            payload: b"{}".to_vec(),
            attempt: 1,
        };
        assert!(matches!(worker.handle(&garbage), Disposition::DeadLetter(_)));

        let out_of_range = Delivery {
            payload: serde_json::to_vec(&PageWorkMessage::new(&id, 5, b"x", "m")).unwrap(),
            ..garbage
        };
        assert!(matches!(
            worker.handle(&out_of_range),
            Disposition::DeadLetter(_)
        ));
    }

    #[test]
    fn test_non_finite_confidence_still_records_the_page() {
        for reported in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 7.5, -1.0] {
            let (store, id) = setup(1);
            let worker = PageWorker::new(
                store.clone(),
                Arc::new(FixedConfidence(reported)),
                RetryPolicy::immediate(1),
            );
            let delivery = Delivery {
                id: 1,
                topic: Topic::PageWork,
                payload: serde_json::to_vec(&PageWorkMessage::new(&id, 1, b"x", "m")).unwrap(),
                attempt: 1,
            };

            assert_eq!(worker.handle(&delivery), Disposition::Ack);
            assert_eq!(store.get_job(&id).unwrap().processed_pages, 1);
            let page = &store.page_results(&id).unwrap()[0];
            assert_eq!(page.status, ResultStatus::Completed);
            assert!((0.0..=1.0).contains(&page.confidence_score));
        }
    }

    #[test]
    fn test_out_of_range_page_is_rejected_before_analysis() {
        let (store, id) = setup(2);
        let analyzer = analyzer(0, false);
        let worker = PageWorker::new(store, analyzer.clone(), RetryPolicy::immediate(1));

        assert!(matches!(
            worker.process(&work(&id, 3)),
            Err(StoreError::Validation(_))
        ));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }
}
