//! Final result repository. At most one row per job.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

#[derive(Debug, Clone, PartialEq)]
pub struct FinalRow {
    pub job_id: String,
    pub document_overview: String,
    pub markdown_content: String,
    pub status: String,
    pub model_id: String,
    pub created_at: String,
}

impl FinalRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            document_overview: row.get("document_overview")?,
            markdown_content: row.get("markdown_content")?,
            status: row.get("status")?,
            model_id: row.get("model_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts the final result. Returns false if one was already stored;
/// the existing row is left untouched.
pub fn insert_if_absent(conn: &Connection, row: &FinalRow) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO final_results (job_id, document_overview, markdown_content,
         status, model_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            row.job_id,
            row.document_overview,
            row.markdown_content,
            row.status,
            row.model_id,
            row.created_at,
        ],
    )?;
    Ok(changed == 1)
}

pub fn find_by_job(conn: &Connection, job_id: &str) -> Result<Option<FinalRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM final_results WHERE job_id = ?1",
            params![job_id],
            FinalRow::from_row,
        )
        .optional()?;
    Ok(row)
}
