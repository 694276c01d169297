//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order, each inside its own transaction.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: include_str!("sql/001_create_jobs.sql"),
    },
    Migration {
        version: 2,
        description: "create_page_results_table",
        sql: include_str!("sql/002_create_page_results.sql"),
    },
    Migration {
        version: 3,
        description: "create_final_results_table",
        sql: include_str!("sql/003_create_final_results.sql"),
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = fresh();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = fresh();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_page_results_reject_duplicate_key() {
        let conn = fresh();
        conn.execute(
            "INSERT INTO jobs (id, file_name, file_type, total_pages, model_id, created_at, updated_at)
             VALUES ('j1', 'a.pdf', 'pdf', 2, 'm', 'now', 'now')",
            [],
        )
        .unwrap();

        let insert = "INSERT INTO page_results (job_id, page_number, status, model_id, created_at)
                      VALUES ('j1', 1, 'completed', 'm', 'now')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_processed_pages_cannot_exceed_total() {
        let conn = fresh();
        conn.execute(
            "INSERT INTO jobs (id, file_name, file_type, total_pages, model_id, created_at, updated_at)
             VALUES ('j1', 'a.png', 'image', 1, 'm', 'now', 'now')",
            [],
        )
        .unwrap();

        conn.execute("UPDATE jobs SET processed_pages = 1 WHERE id = 'j1'", [])
            .unwrap();
        assert!(conn
            .execute("UPDATE jobs SET processed_pages = 2 WHERE id = 'j1'", [])
            .is_err());
    }

    #[test]
    fn test_deleting_job_cascades() {
        let conn = fresh();
        conn.execute_batch(
            "INSERT INTO jobs (id, file_name, file_type, total_pages, model_id, created_at, updated_at)
                 VALUES ('j1', 'a.pdf', 'pdf', 1, 'm', 'now', 'now');
             INSERT INTO page_results (job_id, page_number, status, model_id, created_at)
                 VALUES ('j1', 1, 'completed', 'm', 'now');
             INSERT INTO final_results (job_id, document_overview, markdown_content, status, model_id, created_at)
                 VALUES ('j1', 'o', 'md', 'completed', 'm', 'now');
             DELETE FROM jobs WHERE id = 'j1';",
        )
        .unwrap();

        let pages: u32 = conn
            .query_row("SELECT COUNT(*) FROM page_results", [], |r| r.get(0))
            .unwrap();
        let finals: u32 = conn
            .query_row("SELECT COUNT(*) FROM final_results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pages, 0);
        assert_eq!(finals, 0);
    }
}
