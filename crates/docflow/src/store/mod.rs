//! Job store: the single source of truth for job, page and final-result state.
//!
//! Wraps the row-level repositories with domain types and the two
//! primitives the pipeline relies on for mutual exclusion: the guarded
//! page-result/counter pairing and compare-and-swap status transitions.

mod error;
pub mod model;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::db::job_repo::{self, JobFilter, JobRow, SortColumn, StatusUpdate};
use crate::db::page_repo::{self, PageRow};
use crate::db::result_repo::{self, FinalRow};
use crate::db::Database;
use crate::error::ValidationError;

pub use error::StoreError;
pub use model::{
    FileType, FinalResult, Job, JobListQuery, JobStatus, JobSummary, NewFinalResult, NewJob,
    NewPageResult, PageResult, PageWrite, ResultStatus, SortField, SortOrder, Transition,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Fixed-width UTC timestamps so lexicographic order equals time order.
fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

fn corrupt(job_id: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        job_id: job_id.to_string(),
        reason: reason.into(),
    }
}

fn to_u32(value: i64, field: &str, job_id: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| corrupt(job_id, format!("{} out of range: {}", field, value)))
}

fn job_from_row(row: JobRow) -> Result<Job, StoreError> {
    let status = JobStatus::parse(&row.status)
        .ok_or_else(|| corrupt(&row.id, format!("unknown status '{}'", row.status)))?;
    let file_type = FileType::parse(&row.file_type)
        .ok_or_else(|| corrupt(&row.id, format!("unknown file type '{}'", row.file_type)))?;

    Ok(Job {
        total_pages: to_u32(row.total_pages, "total_pages", &row.id)?,
        processed_pages: to_u32(row.processed_pages, "processed_pages", &row.id)?,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
        completed_at: row.completed_at.as_deref().map(parse_timestamp),
        duration_seconds: row.duration_seconds,
        status,
        file_type,
        job_id: row.id,
        file_name: row.file_name,
        model_id: row.model_id,
        error_message: row.error_message,
    })
}

fn page_from_row(row: PageRow) -> Result<PageResult, StoreError> {
    let status = ResultStatus::parse(&row.status)
        .ok_or_else(|| corrupt(&row.job_id, format!("unknown page status '{}'", row.status)))?;
    Ok(PageResult {
        page_number: to_u32(row.page_number, "page_number", &row.job_id)?,
        created_at: parse_timestamp(&row.created_at),
        status,
        job_id: row.job_id,
        extracted_text: row.extracted_text,
        confidence_score: row.confidence_score,
        error_message: row.error_message,
        model_id: row.model_id,
    })
}

fn final_from_row(row: FinalRow) -> Result<FinalResult, StoreError> {
    let status = ResultStatus::parse(&row.status)
        .ok_or_else(|| corrupt(&row.job_id, format!("unknown result status '{}'", row.status)))?;
    Ok(FinalResult {
        created_at: parse_timestamp(&row.created_at),
        status,
        job_id: row.job_id,
        document_overview: row.document_overview,
        markdown_content: row.markdown_content,
        model_id: row.model_id,
    })
}

fn validate_new_job(new: &NewJob) -> Result<(), ValidationError> {
    if new.file_name.trim().is_empty() {
        return Err(ValidationError::new("file_name", "must not be empty"));
    }
    if new.model_id.trim().is_empty() {
        return Err(ValidationError::new("model_id", "must not be empty"));
    }
    if new.total_pages < 1 {
        return Err(ValidationError::new("total_pages", "must be at least 1"));
    }
    if new.file_type == FileType::Image && new.total_pages != 1 {
        return Err(ValidationError::new(
            "total_pages",
            format!("an image job has exactly one page, got {}", new.total_pages),
        ));
    }
    Ok(())
}

fn validate_page_result(result: &NewPageResult) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&result.confidence_score) {
        return Err(ValidationError::new(
            "confidence_score",
            format!("must be within 0.0..=1.0, got {}", result.confidence_score),
        ));
    }
    Ok(())
}

/// Loads the job and checks the page number against its page count.
fn load_for_page(conn: &Connection, job_id: &str, page_number: u32) -> Result<JobRow, StoreError> {
    let job = job_repo::find_by_id(conn, job_id)?
        .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
    if page_number < 1 || i64::from(page_number) > job.total_pages {
        return Err(ValidationError::new(
            "page_number",
            format!("{} is outside 1..={}", page_number, job.total_pages),
        )
        .into());
    }
    Ok(job)
}

fn page_row(job_id: &str, page_number: u32, result: &NewPageResult, now: &str) -> PageRow {
    PageRow {
        job_id: job_id.to_string(),
        page_number: i64::from(page_number),
        extracted_text: result.extracted_text.clone(),
        confidence_score: result.confidence_score,
        status: result.status.as_str().to_string(),
        error_message: result.error_message.clone(),
        model_id: result.model_id.clone(),
        created_at: now.to_string(),
    }
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Persistent job store backed by SQLite. Cloning shares the connection.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// A store over a fresh in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        Ok(self.db.ping()?)
    }

    /// Creates a job in `processing` with no processed pages.
    pub fn create_job(&self, new: &NewJob) -> Result<String, StoreError> {
        validate_new_job(new)?;

        let now = format_timestamp(Utc::now());
        let row = JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            file_name: new.file_name.clone(),
            file_type: new.file_type.as_str().to_string(),
            total_pages: i64::from(new.total_pages),
            processed_pages: 0,
            model_id: new.model_id.clone(),
            status: JobStatus::Processing.as_str().to_string(),
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            duration_seconds: None,
        };

        self.db.with_conn(|conn| job_repo::insert(conn, &row))?;
        log::debug!(
            "Created job {} ({}, {} pages)",
            row.id,
            row.file_name,
            row.total_pages
        );
        Ok(row.id)
    }

    /// Atomically increments the processed-page counter, saturating at
    /// `total_pages`. Returns the value after the increment.
    pub fn increment_processed_pages(&self, job_id: &str) -> Result<u32, StoreError> {
        let now = format_timestamp(Utc::now());
        let count = self
            .db
            .with_conn(|conn| job_repo::increment_processed(conn, job_id, &now))?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        to_u32(count, "processed_pages", job_id)
    }

    /// Write-once insert of a page result without touching the counter.
    ///
    /// `Recorded` carries the job's current counter, unchanged by this call.
    pub fn upsert_page_result(
        &self,
        job_id: &str,
        page_number: u32,
        result: &NewPageResult,
    ) -> Result<PageWrite, StoreError> {
        validate_page_result(result)?;
        let now = format_timestamp(Utc::now());

        self.db.with_transaction(|tx| {
            let job = load_for_page(tx, job_id, page_number)?;
            if !page_repo::insert_if_absent(tx, &page_row(job_id, page_number, result, &now))? {
                return Ok(PageWrite::Duplicate);
            }
            Ok(PageWrite::Recorded {
                processed_pages: to_u32(job.processed_pages, "processed_pages", job_id)?,
            })
        })
    }

    /// Inserts a page result and, only if the insert was new, increments
    /// the job's counter. Both happen in one transaction, so a redelivered
    /// page can never count twice.
    pub fn record_page_result(
        &self,
        job_id: &str,
        page_number: u32,
        result: &NewPageResult,
    ) -> Result<PageWrite, StoreError> {
        validate_page_result(result)?;
        let now = format_timestamp(Utc::now());

        self.db.with_transaction(|tx| {
            load_for_page(tx, job_id, page_number)?;
            if !page_repo::insert_if_absent(tx, &page_row(job_id, page_number, result, &now))? {
                return Ok(PageWrite::Duplicate);
            }
            let count = job_repo::increment_processed(tx, job_id, &now)?
                .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
            Ok(PageWrite::Recorded {
                processed_pages: to_u32(count, "processed_pages", job_id)?,
            })
        })
    }

    pub fn page_result_exists(&self, job_id: &str, page_number: u32) -> Result<bool, StoreError> {
        Ok(self
            .db
            .with_conn(|conn| page_repo::exists(conn, job_id, i64::from(page_number)))?)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        let row = self
            .db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id))?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        job_from_row(row)
    }

    /// Lists jobs for the history view. Returns the page and the total
    /// number of jobs matching the filter.
    pub fn list_jobs(&self, query: &JobListQuery) -> Result<(Vec<JobSummary>, u64), StoreError> {
        let filter = JobFilter {
            status: query.status.map(|s| s.as_str().to_string()),
            sort: match query.sort_by {
                SortField::CreatedAt => SortColumn::CreatedAt,
                SortField::Status => SortColumn::Status,
                SortField::FileName => SortColumn::FileName,
            },
            descending: query.order == SortOrder::Desc,
            limit: query.limit,
            offset: query.offset,
        };

        let (rows, total) = self.db.with_conn(|conn| job_repo::query(conn, &filter))?;
        let jobs = rows
            .into_iter()
            .map(|row| job_from_row(row).map(JobSummary::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    /// All jobs currently in `status`, oldest first.
    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let rows = self
            .db
            .with_conn(|conn| job_repo::find_by_status(conn, status.as_str()))?;
        rows.into_iter().map(job_from_row).collect()
    }

    /// Compare-and-swap status transition.
    ///
    /// Edges outside the state machine are rejected with
    /// `InvalidTransition` before touching the row. Terminal transitions
    /// stamp `completed_at` and `duration_seconds`.
    pub fn transition_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<Transition, StoreError> {
        self.compare_and_set(job_id, expected, new, None)
    }

    /// Moves a job to `error`, recording why.
    pub fn fail_job(
        &self,
        job_id: &str,
        expected: JobStatus,
        message: &str,
    ) -> Result<Transition, StoreError> {
        self.compare_and_set(job_id, expected, JobStatus::Error, Some(message))
    }

    fn compare_and_set(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
        error_message: Option<&str>,
    ) -> Result<Transition, StoreError> {
        if !expected.can_transition_to(new) {
            return Err(StoreError::InvalidTransition {
                from: expected,
                to: new,
            });
        }

        self.db.with_transaction(|tx| {
            let job = job_repo::find_by_id(tx, job_id)?
                .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

            let now = Utc::now();
            let now_str = format_timestamp(now);
            let (completed_at, duration_seconds) = if new.is_terminal() {
                let started = parse_timestamp(&job.created_at);
                let millis = (now - started).num_milliseconds().max(0);
                (Some(now_str.clone()), Some(millis as f64 / 1000.0))
            } else {
                (None, None)
            };

            let applied = job_repo::compare_and_set_status(
                tx,
                job_id,
                &StatusUpdate {
                    expected: expected.as_str(),
                    new_status: new.as_str(),
                    updated_at: &now_str,
                    completed_at: completed_at.as_deref(),
                    duration_seconds,
                    error_message,
                },
            )?;

            if applied {
                return Ok(Transition::Applied);
            }
            let actual = JobStatus::parse(&job.status)
                .ok_or_else(|| corrupt(job_id, format!("unknown status '{}'", job.status)))?;
            Ok(Transition::Conflict { actual })
        })
    }

    /// Page results ordered by page number.
    pub fn page_results(&self, job_id: &str) -> Result<Vec<PageResult>, StoreError> {
        let rows = self.db.with_conn(|conn| page_repo::find_by_job(conn, job_id))?;
        rows.into_iter().map(page_from_row).collect()
    }

    /// Number of page results currently visible for the job.
    pub fn page_result_count(&self, job_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .db
            .with_conn(|conn| page_repo::count_by_job(conn, job_id))?)
    }

    /// Writes the final result once. Returns false if one already existed.
    pub fn write_final_result(
        &self,
        job_id: &str,
        result: &NewFinalResult,
    ) -> Result<bool, StoreError> {
        let row = FinalRow {
            job_id: job_id.to_string(),
            document_overview: result.document_overview.clone(),
            markdown_content: result.markdown_content.clone(),
            status: result.status.as_str().to_string(),
            model_id: result.model_id.clone(),
            created_at: format_timestamp(Utc::now()),
        };

        self.db.with_transaction(|tx| {
            if job_repo::find_by_id(tx, job_id)?.is_none() {
                return Err(StoreError::NotFound(job_id.to_string()));
            }
            Ok(result_repo::insert_if_absent(tx, &row)?)
        })
    }

    pub fn get_final_result(&self, job_id: &str) -> Result<Option<FinalResult>, StoreError> {
        self.db
            .with_conn(|conn| result_repo::find_by_job(conn, job_id))?
            .map(final_from_row)
            .transpose()
    }

    /// Deletes a job with its page and final results.
    pub fn delete_job(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.db.with_conn(|conn| job_repo::delete(conn, job_id))?)
    }

    pub fn delete_all_jobs(&self) -> Result<u64, StoreError> {
        Ok(self.db.with_conn(job_repo::delete_all)?)
    }
}
