//! Lightweight migration runner for rusqlite.
//!
//! Numbered SQL files from `migrations/` are compiled into the binary,
//! applied versions are tracked in `schema_versions`, and pending ones
//! run in order at startup.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::{info, warn};

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "001_documents",
    sql: include_str!("../migrations/001_documents.sql"),
}];

/// Set the pragmas every connection to the document database uses.
pub fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
}

/// Run all pending migrations against the given connection.
///
/// Call this at startup before any other database operations.
pub fn run_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    configure(conn)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut pending = 0;
    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }

        let tx = conn.transaction()?;
        if let Err(e) = tx.execute_batch(migration.sql) {
            warn!(
                component = "migrations",
                event = "migration.failed",
                version = migration.version,
                name = %migration.name,
                error = %e,
                "Migration failed"
            );
            return Err(e.into());
        }
        tx.execute(
            "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = migration.version,
            name = %migration.name,
            "Applied migration"
        );
        pending += 1;
    }

    let total = MIGRATIONS.len();
    info!(
        component = "migrations",
        event = "migrations.complete",
        total = total,
        applied = pending,
        skipped = total - pending,
        "Migration check complete"
    );

    Ok(())
}

/// Highest applied schema version, if any.
pub fn current_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT MAX(version) FROM schema_versions", [], |row| {
        row.get(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_once_and_records_version() {
        let tmp = tempfile::tempdir().unwrap();
        let mut conn = Connection::open(tmp.path().join("t.db")).unwrap();

        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        assert_eq!(current_version(&conn).unwrap(), Some(1));
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        conn.execute(
            "INSERT INTO documents (collection, id, body) VALUES ('c', '1', '{}')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn versions_are_ordered_and_unique() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(versions, sorted);
        for m in MIGRATIONS {
            assert!(m.name.starts_with(&format!("{:03}_", m.version)));
        }
    }
}
