//! Page result repository.

use rusqlite::{params, Connection, Row};

use super::DatabaseError;

/// A raw page result row.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRow {
    pub job_id: String,
    pub page_number: i64,
    pub extracted_text: String,
    pub confidence_score: f64,
    pub status: String,
    pub error_message: Option<String>,
    pub model_id: String,
    pub created_at: String,
}

impl PageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            page_number: row.get("page_number")?,
            extracted_text: row.get("extracted_text")?,
            confidence_score: row.get("confidence_score")?,
            status: row.get("status")?,
            error_message: row.get("error_message")?,
            model_id: row.get("model_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a page result unless one already exists for `(job_id, page_number)`.
///
/// Returns true if a new row was written.
pub fn insert_if_absent(conn: &Connection, page: &PageRow) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO page_results (job_id, page_number, extracted_text,
         confidence_score, status, error_message, model_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            page.job_id,
            page.page_number,
            page.extracted_text,
            page.confidence_score,
            page.status,
            page.error_message,
            page.model_id,
            page.created_at,
        ],
    )?;
    Ok(changed == 1)
}

/// Whether a result already exists for the page.
pub fn exists(conn: &Connection, job_id: &str, page_number: i64) -> Result<bool, DatabaseError> {
    let found: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM page_results WHERE job_id = ?1 AND page_number = ?2)",
        params![job_id, page_number],
        |r| r.get(0),
    )?;
    Ok(found == 1)
}

/// All page results for a job ordered by page number.
pub fn find_by_job(conn: &Connection, job_id: &str) -> Result<Vec<PageRow>, DatabaseError> {
    let mut stmt = conn
        .prepare("SELECT * FROM page_results WHERE job_id = ?1 ORDER BY page_number ASC")?;
    let rows = stmt
        .query_map(params![job_id], PageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_by_job(conn: &Connection, job_id: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM page_results WHERE job_id = ?1",
        params![job_id],
        |r| r.get(0),
    )?;
    Ok(count)
}
