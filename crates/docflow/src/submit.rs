//! Job submission: validate, create the job, fan out one message per page.

use std::sync::Arc;

use crate::broker::{publish_json, Broker, PageWorkMessage, Topic};
use crate::capability::ModelCatalog;
use crate::error::{DocflowError, ValidationError};
use crate::retry::RetryPolicy;
use crate::store::{FileType, JobStatus, JobStore, NewJob};

/// A document as handed in by a client: one image per page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub file_name: String,
    /// Inferred from the file name extension when absent.
    pub file_type: Option<FileType>,
    pub model_id: String,
    pub pages: Vec<Vec<u8>>,
}

pub struct Submitter {
    store: JobStore,
    broker: Arc<dyn Broker>,
    catalog: ModelCatalog,
    publish_retry: RetryPolicy,
}

impl Submitter {
    pub fn new(
        store: JobStore,
        broker: Arc<dyn Broker>,
        catalog: ModelCatalog,
        publish_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            broker,
            catalog,
            publish_retry,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Creates the job and publishes its pages. Returns the job id.
    ///
    /// If publishing fails part-way the job is moved to `error`; pages
    /// already published are dropped by the page workers.
    pub fn submit(&self, submission: Submission) -> Result<String, DocflowError> {
        let file_type = self.validate(&submission)?;

        let total_pages = u32::try_from(submission.pages.len())
            .map_err(|_| ValidationError::new("pages", "too many pages"))?;
        let job_id = self.store.create_job(&NewJob {
            file_name: submission.file_name.clone(),
            file_type,
            total_pages,
            model_id: submission.model_id.clone(),
        })?;

        log::info!(
            "Submitted job {} ({}, {} pages, model {})",
            job_id,
            submission.file_name,
            total_pages,
            submission.model_id
        );

        for (index, page) in submission.pages.iter().enumerate() {
            let page_number = index as u32 + 1;
            let message = PageWorkMessage::new(&job_id, page_number, page, &submission.model_id);
            let published = self.publish_retry.run("publish page work", |_| {
                publish_json(self.broker.as_ref(), Topic::PageWork, &message)
            });

            if let Err(e) = published {
                let reason = format!("Failed to publish page {}: {}", page_number, e);
                log::error!("Job {}: {}", job_id, reason);
                if let Err(store_err) = self.store.fail_job(&job_id, JobStatus::Processing, &reason)
                {
                    log::error!("Could not mark job {} as failed: {}", job_id, store_err);
                }
                return Err(e.into());
            }
        }

        Ok(job_id)
    }

    fn validate(&self, submission: &Submission) -> Result<FileType, ValidationError> {
        if submission.file_name.trim().is_empty() {
            return Err(ValidationError::new("file_name", "must not be empty"));
        }
        let file_type = match submission.file_type {
            Some(file_type) => file_type,
            None => FileType::from_file_name(&submission.file_name).ok_or_else(|| {
                ValidationError::new(
                    "file_type",
                    format!("cannot infer from '{}'", submission.file_name),
                )
            })?,
        };

        self.catalog.validate(&submission.model_id)?;

        if submission.pages.is_empty() {
            return Err(ValidationError::new("pages", "at least one page is required"));
        }
        if file_type == FileType::Image && submission.pages.len() != 1 {
            return Err(ValidationError::new(
                "pages",
                format!(
                    "an image submission has exactly one page, got {}",
                    submission.pages.len()
                ),
            ));
        }
        for (index, page) in submission.pages.iter().enumerate() {
            if image::guess_format(page).is_err() {
                return Err(ValidationError::new(
                    format!("pages[{}]", index),
                    "not a recognized image",
                ));
            }
        }

        Ok(file_type)
    }
}
