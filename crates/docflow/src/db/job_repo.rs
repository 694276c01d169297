//! Job repository: row-level operations on the `jobs` table.
//!
//! Functions take a `&Connection` rather than the `Database` handle so the
//! job store can compose several of them inside one transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub file_name: String,
    pub file_type: String,
    pub total_pages: i64,
    pub processed_pages: i64,
    pub model_id: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            file_name: row.get("file_name")?,
            file_type: row.get("file_type")?,
            total_pages: row.get("total_pages")?,
            processed_pages: row.get("processed_pages")?,
            model_id: row.get("model_id")?,
            status: row.get("status")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
            duration_seconds: row.get("duration_seconds")?,
        })
    }
}

/// Column a job listing is ordered by. Only these names ever reach SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortColumn {
    #[default]
    CreatedAt,
    Status,
    FileName,
}

impl SortColumn {
    fn as_sql(self) -> &'static str {
        match self {
            SortColumn::CreatedAt => "created_at",
            SortColumn::Status => "status",
            SortColumn::FileName => "file_name",
        }
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub sort: SortColumn,
    pub descending: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, file_name, file_type, total_pages, processed_pages, model_id,
         status, error_message, created_at, updated_at, completed_at, duration_seconds)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            job.id,
            job.file_name,
            job.file_type,
            job.total_pages,
            job.processed_pages,
            job.model_id,
            job.status,
            job.error_message,
            job.created_at,
            job.updated_at,
            job.completed_at,
            job.duration_seconds,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?;
    Ok(row)
}

/// Returns every job with the given status, oldest first.
pub fn find_by_status(conn: &Connection, status: &str) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC")?;
    let rows = stmt
        .query_map(params![status], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));

    // rowid breaks ties so equal sort keys keep insertion order.
    let direction = if filter.descending { "DESC" } else { "ASC" };
    let query_sql = format!(
        "SELECT * FROM jobs {} ORDER BY {} {}, rowid {} LIMIT ?{} OFFSET ?{}",
        where_clause,
        filter.sort.as_sql(),
        direction,
        direction,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<JobRow> = stmt
        .query_map(params_ref.as_slice(), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

/// Increments `processed_pages` unless it already equals `total_pages`.
///
/// Returns the counter value after the statement, or `None` if the job
/// does not exist.
pub fn increment_processed(
    conn: &Connection,
    id: &str,
    updated_at: &str,
) -> Result<Option<i64>, DatabaseError> {
    conn.execute(
        "UPDATE jobs SET processed_pages = processed_pages + 1, updated_at = ?2
         WHERE id = ?1 AND processed_pages < total_pages",
        params![id, updated_at],
    )?;
    let count = conn
        .query_row(
            "SELECT processed_pages FROM jobs WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(count)
}

/// Fields written by a status transition.
#[derive(Debug, Clone)]
pub struct StatusUpdate<'a> {
    pub expected: &'a str,
    pub new_status: &'a str,
    pub updated_at: &'a str,
    pub completed_at: Option<&'a str>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<&'a str>,
}

/// Compare-and-swap on `status`. Returns true if this call changed the row.
pub fn compare_and_set_status(
    conn: &Connection,
    id: &str,
    update: &StatusUpdate<'_>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = ?3, updated_at = ?4, completed_at = ?5,
         duration_seconds = ?6, error_message = COALESCE(?7, error_message)
         WHERE id = ?1 AND status = ?2",
        params![
            id,
            update.expected,
            update.new_status,
            update.updated_at,
            update.completed_at,
            update.duration_seconds,
            update.error_message,
        ],
    )?;
    Ok(changed == 1)
}

/// Deletes a job. Page and final results go with it via `ON DELETE CASCADE`.
pub fn delete(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(changed == 1)
}

/// Deletes every job, returning how many were removed.
pub fn delete_all(conn: &Connection) -> Result<u64, DatabaseError> {
    let changed = conn.execute("DELETE FROM jobs", [])?;
    Ok(changed as u64)
}
