//! Domain types held by the job store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a job.
///
/// `processing → aggregating → {completed, error}` and `processing → error`.
/// Terminal states have no outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Aggregating,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Aggregating => "aggregating",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(JobStatus::Processing),
            "aggregating" => Some(JobStatus::Aggregating),
            "completed" => Some(JobStatus::Completed),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Processing, JobStatus::Aggregating)
                | (JobStatus::Processing, JobStatus::Error)
                | (JobStatus::Aggregating, JobStatus::Completed)
                | (JobStatus::Aggregating, JobStatus::Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Image,
    Pdf,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Pdf => "pdf",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(FileType::Image),
            "pdf" => Some(FileType::Pdf),
            _ => None,
        }
    }

    /// Infers the file type from a file name extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let mime = mime_guess::from_path(name).first()?;
        if mime.type_() == mime_guess::mime::IMAGE {
            Some(FileType::Image)
        } else if mime.essence_str() == "application/pdf" {
            Some(FileType::Pdf)
        } else {
            None
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded for a page or a final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Error,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
            ResultStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(ResultStatus::Completed),
            "error" => Some(ResultStatus::Error),
            _ => None,
        }
    }
}

/// One submitted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub file_name: String,
    pub file_type: FileType,
    pub total_pages: u32,
    pub processed_pages: u32,
    pub model_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl Job {
    pub fn all_pages_processed(&self) -> bool {
        self.processed_pages >= self.total_pages
    }
}

/// Parameters for [`crate::store::JobStore::create_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub file_name: String,
    pub file_type: FileType,
    pub total_pages: u32,
    pub model_id: String,
}

/// A row in the job history listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub file_name: String,
    pub file_type: FileType,
    pub status: JobStatus,
    pub processed_pages: u32,
    pub total_pages: u32,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            file_name: job.file_name,
            file_type: job.file_type,
            status: job.status,
            processed_pages: job.processed_pages,
            total_pages: job.total_pages,
            model_id: job.model_id,
            created_at: job.created_at,
            completed_at: job.completed_at,
            duration_seconds: job.duration_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub job_id: String,
    pub page_number: u32,
    pub extracted_text: String,
    pub confidence_score: f64,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

/// Page result payload as produced by a page worker.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPageResult {
    pub extracted_text: String,
    pub confidence_score: f64,
    pub status: ResultStatus,
    pub error_message: Option<String>,
    pub model_id: String,
}

impl NewPageResult {
    pub fn completed(text: impl Into<String>, confidence: f64, model_id: &str) -> Self {
        Self {
            extracted_text: text.into(),
            confidence_score: confidence,
            status: ResultStatus::Completed,
            error_message: None,
            model_id: model_id.to_string(),
        }
    }

    /// A failed page: empty text, zero confidence.
    pub fn failed(message: impl Into<String>, model_id: &str) -> Self {
        Self {
            extracted_text: String::new(),
            confidence_score: 0.0,
            status: ResultStatus::Error,
            error_message: Some(message.into()),
            model_id: model_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub job_id: String,
    pub document_overview: String,
    pub markdown_content: String,
    pub status: ResultStatus,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFinalResult {
    pub document_overview: String,
    pub markdown_content: String,
    pub status: ResultStatus,
    pub model_id: String,
}

/// Column used to order the job history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    Status,
    FileName,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Job history query. The default lists every job in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobListQuery {
    pub sort_by: SortField,
    pub order: SortOrder,
    pub status: Option<JobStatus>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Result of writing a page result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageWrite {
    /// First write for this page. Carries the job's counter after the write.
    Recorded { processed_pages: u32 },
    /// A result for this page already existed; nothing changed.
    Duplicate,
}

/// Result of a compare-and-swap status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The job was not in the expected state.
    Conflict { actual: JobStatus },
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Transition::Applied)
    }
}
