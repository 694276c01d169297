//! Read and administrative surface over the job store.

use serde::Serialize;

use crate::store::{
    FinalResult, Job, JobListQuery, JobStatus, JobStore, JobSummary, StoreError,
};

/// A job as returned to a polling client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: Job,
    /// Present only once the job has completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<FinalResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHistory {
    pub jobs: Vec<JobSummary>,
    /// Matching jobs before `limit`/`offset` were applied.
    pub total: u64,
}

#[derive(Clone)]
pub struct StatusService {
    store: JobStore,
}

impl StatusService {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub fn get_status(&self, job_id: &str) -> Result<JobStatusView, StoreError> {
        let job = self.store.get_job(job_id)?;
        let results = if job.status == JobStatus::Completed {
            self.store.get_final_result(job_id)?
        } else {
            None
        };
        Ok(JobStatusView { job, results })
    }

    pub fn history(&self, query: &JobListQuery) -> Result<JobHistory, StoreError> {
        let (jobs, total) = self.store.list_jobs(query)?;
        Ok(JobHistory { jobs, total })
    }

    /// Deletes one job with its page and final results.
    pub fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        if self.store.delete_job(job_id)? {
            log::info!("Deleted job {}", job_id);
            Ok(())
        } else {
            Err(StoreError::NotFound(job_id.to_string()))
        }
    }

    /// Returns how many jobs were removed.
    pub fn delete_all(&self) -> Result<u64, StoreError> {
        let deleted = self.store.delete_all_jobs()?;
        log::warn!("Deleted all jobs ({})", deleted);
        Ok(deleted)
    }
}
