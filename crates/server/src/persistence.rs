//! SQLite-backed document store.
//!
//! Every operation opens its own connection, so the store can be shared across
//! threads and used from `spawn_blocking`. Cursors hold a dedicated connection
//! and page through a collection by rowid, which keeps iteration stable while
//! the same run replaces documents.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, Transaction};
use tracing::{debug, warn};
use unembed_engine::store::take_id;
use unembed_engine::{
    DocumentCursor, DocumentStore, DocumentValue, Filter, Map, StoreError, StoredDocument,
};

use crate::migration_runner;

const CURSOR_BATCH: i64 = 64;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open the database at `db_path`, creating it and applying pending
    /// migrations as needed.
    pub fn open(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        let mut conn = Connection::open(&db_path)?;
        migration_runner::run_migrations(&mut conn)?;
        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path).map_err(backend)?;
        migration_runner::configure(&conn).map_err(backend)?;
        Ok(conn)
    }
}

/// Document count per collection, by name.
pub fn collection_counts(conn: &Connection) -> rusqlite::Result<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT collection, COUNT(*) FROM documents GROUP BY collection ORDER BY collection",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut counts = Vec::new();
    for row in rows {
        let (name, n) = row?;
        counts.push((name, n as u64));
    }
    Ok(counts)
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Insert inside the caller's transaction; nothing lands unless it commits.
fn insert_rows(tx: &Transaction<'_>, collection: &str, docs: Vec<Map>) -> Result<Vec<String>, StoreError> {
    let mut stmt = tx
        .prepare("INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)")
        .map_err(backend)?;
    let mut ids = Vec::with_capacity(docs.len());
    for mut body in docs {
        let id = take_id(&mut body);
        let raw = encode_body(&id, &body)?;
        stmt.execute(params![collection, id, raw]).map_err(backend)?;
        ids.push(id);
    }
    Ok(ids)
}

fn encode_body(id: &str, body: &Map) -> Result<String, StoreError> {
    serde_json::to_string(body).map_err(|e| StoreError::Decode {
        id: id.to_string(),
        message: e.to_string(),
    })
}

fn decode_body(id: &str, raw: &str) -> Result<Map, StoreError> {
    let decode_err = |message: String| StoreError::Decode {
        id: id.to_string(),
        message,
    };
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| decode_err(e.to_string()))?;
    match DocumentValue::from(value) {
        DocumentValue::Map(map) => Ok(map),
        other => Err(decode_err(format!("body is a {}, expected an object", other.kind()))),
    }
}

impl DocumentStore for SqliteStore {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Box<dyn DocumentCursor>, StoreError> {
        let conn = self.connect()?;
        Ok(Box::new(SqliteCursor {
            conn: Some(conn),
            collection: collection.to_string(),
            filter: filter.clone(),
            last_rowid: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn insert_many(&self, collection: &str, docs: Vec<Map>) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(backend)?;
        let ids = insert_rows(&tx, collection, docs)?;
        tx.commit().map_err(backend)?;

        debug!(
            component = "persistence",
            event = "persistence.inserted",
            collection = %collection,
            count = ids.len(),
            "Inserted documents"
        );
        Ok(ids)
    }

    fn replace_collection(
        &self,
        collection: &str,
        docs: Vec<Map>,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(backend)?;
        let removed = tx
            .execute("DELETE FROM documents WHERE collection = ?1", params![collection])
            .map_err(backend)?;
        let ids = insert_rows(&tx, collection, docs)?;
        tx.commit().map_err(backend)?;

        debug!(
            component = "persistence",
            event = "persistence.collection_replaced",
            collection = %collection,
            removed,
            inserted = ids.len(),
            "Replaced collection"
        );
        Ok((removed as u64, ids))
    }

    fn replace_one(&self, collection: &str, id: &str, body: &Map) -> Result<(), StoreError> {
        let raw = encode_body(id, body)?;
        let conn = self.connect()?;
        let changed = conn
            .execute(
                "UPDATE documents
                 SET body = ?3, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE collection = ?1 AND id = ?2",
                params![collection, id, raw],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn drop_collection(&self, collection: &str) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let removed = conn
            .execute("DELETE FROM documents WHERE collection = ?1", params![collection])
            .map_err(backend)?;
        Ok(removed as u64)
    }

    fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(n as u64)
    }
}

struct SqliteCursor {
    conn: Option<Connection>,
    collection: String,
    filter: Filter,
    last_rowid: i64,
    buffer: VecDeque<(String, String)>,
    exhausted: bool,
}

impl SqliteCursor {
    fn fill(&mut self) -> Result<(), StoreError> {
        let conn = self.conn.as_ref().ok_or(StoreError::CursorClosed)?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT rowid, id, body FROM documents
                 WHERE collection = ?1 AND rowid > ?2
                 ORDER BY rowid LIMIT ?3",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![self.collection, self.last_rowid, CURSOR_BATCH], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(backend)?;

        let mut fetched = 0;
        for row in rows {
            let (rowid, id, body) = row.map_err(backend)?;
            self.last_rowid = rowid;
            self.buffer.push_back((id, body));
            fetched += 1;
        }
        if fetched < CURSOR_BATCH {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl DocumentCursor for SqliteCursor {
    fn next_document(&mut self) -> Option<Result<StoredDocument, StoreError>> {
        loop {
            if self.conn.is_none() {
                return Some(Err(StoreError::CursorClosed));
            }
            if self.buffer.is_empty() {
                if self.exhausted {
                    return None;
                }
                if let Err(e) = self.fill() {
                    self.exhausted = true;
                    return Some(Err(e));
                }
                continue;
            }

            let (id, raw) = self.buffer.pop_front()?;
            let body = match decode_body(&id, &raw) {
                Ok(body) => body,
                Err(e) => return Some(Err(e)),
            };
            if self.filter.matches(&body) {
                return Some(Ok(StoredDocument { id, body }));
            }
        }
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                warn!(
                    component = "persistence",
                    event = "persistence.cursor_close_failed",
                    collection = %self.collection,
                    error = %e,
                    "Failed to close cursor connection"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use unembed_engine::CursorGuard;

    use super::*;

    fn map(v: serde_json::Value) -> Map {
        match DocumentValue::from(v) {
            DocumentValue::Map(m) => m,
            other => panic!("expected map, got {}", other.kind()),
        }
    }

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(tmp.path().join("unembed.db")).unwrap();
        (tmp, store)
    }

    fn ids(store: &SqliteStore, collection: &str, filter: &Filter) -> Vec<String> {
        let mut cursor = CursorGuard::new(store.find(collection, filter).unwrap());
        std::iter::from_fn(|| cursor.next_document())
            .map(|r| r.unwrap().id)
            .collect()
    }

    #[test]
    fn insert_find_replace_round_trip() {
        let (_tmp, store) = store();
        let inserted = store
            .insert_many(
                "metadata",
                vec![
                    map(json!({"_id": "a", "type": "retail", "at": {"$date": "2024-01-01T00:00:00.000Z"}})),
                    map(json!({"type": "wholesale"})),
                ],
            )
            .unwrap();
        assert_eq!(inserted[0], "a");
        assert_eq!(store.count("metadata").unwrap(), 2);

        let retail = Filter::all().eq("type", "retail");
        assert_eq!(ids(&store, "metadata", &retail), vec!["a"]);

        let mut cursor = store.find("metadata", &retail).unwrap();
        let doc = cursor.next_document().unwrap().unwrap();
        cursor.close();
        assert!(!doc.body.contains_key("_id"));
        assert_eq!(doc.body["at"].kind(), "timestamp");

        let mut body = doc.body;
        body.insert("migrated".to_string(), "yes".into());
        store.replace_one("metadata", "a", &body).unwrap();

        let mut cursor = store.find("metadata", &retail).unwrap();
        let doc = cursor.next_document().unwrap().unwrap();
        assert_eq!(doc.body["migrated"], DocumentValue::from("yes"));
    }

    #[test]
    fn replace_missing_document_is_not_found() {
        let (_tmp, store) = store();
        let err = store.replace_one("metadata", "nope", &Map::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(err.is_item_local());
    }

    #[test]
    fn cursor_pages_past_one_batch_while_replacing() {
        let (_tmp, store) = store();
        let docs: Vec<Map> = (0..150)
            .map(|i| map(json!({"_id": format!("d{i:03}"), "n": i})))
            .collect();
        store.insert_many("bulk", docs).unwrap();

        let mut cursor = CursorGuard::new(store.find("bulk", &Filter::all()).unwrap());
        let mut seen = Vec::new();
        while let Some(doc) = cursor.next_document() {
            let doc = doc.unwrap();
            store.replace_one("bulk", &doc.id, &doc.body).unwrap();
            seen.push(doc.id);
        }

        assert_eq!(seen.len(), 150);
        assert_eq!(seen.first().map(String::as_str), Some("d000"));
        assert_eq!(seen.last().map(String::as_str), Some("d149"));
    }

    #[test]
    fn corrupt_body_is_item_local() {
        let (_tmp, store) = store();
        store
            .insert_many("c", vec![map(json!({"_id": "good"}))])
            .unwrap();
        let conn = Connection::open(store.db_path()).unwrap();
        conn.execute(
            "INSERT INTO documents (collection, id, body) VALUES ('c', 'bad', '{oops')",
            [],
        )
        .unwrap();

        let mut cursor = CursorGuard::new(store.find("c", &Filter::all()).unwrap());
        assert!(cursor.next_document().unwrap().is_ok());
        let err = cursor.next_document().unwrap().unwrap_err();
        assert!(err.is_item_local(), "{err}");
        assert!(cursor.next_document().is_none());
    }

    #[test]
    fn closed_cursor_reports_closed() {
        let (_tmp, store) = store();
        let mut cursor = store.find("c", &Filter::all()).unwrap();
        cursor.close();
        cursor.close();
        assert!(matches!(cursor.next_document(), Some(Err(StoreError::CursorClosed))));
    }

    #[test]
    fn drop_collection_and_counts() {
        let (_tmp, store) = store();
        store
            .insert_many("a", vec![Map::new(), Map::new()])
            .unwrap();
        store.insert_many("b", vec![Map::new()]).unwrap();

        assert_eq!(
            collection_counts(&store.connect().unwrap()).unwrap(),
            vec![("a".to_string(), 2), ("b".to_string(), 1)]
        );
        assert_eq!(store.drop_collection("a").unwrap(), 2);
        assert_eq!(store.count("a").unwrap(), 0);
    }

    #[test]
    fn duplicate_id_fails_the_whole_insert() {
        let (_tmp, store) = store();
        let err = store
            .insert_many("c", vec![map(json!({"_id": "x"})), map(json!({"_id": "x"}))])
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.count("c").unwrap(), 0);
    }

    #[test]
    fn replace_collection_swaps_contents() {
        let (_tmp, store) = store();
        store
            .insert_many("p", vec![map(json!({"_id": "old1"})), map(json!({"_id": "old2"}))])
            .unwrap();
        store.insert_many("q", vec![Map::new()]).unwrap();

        let (removed, inserted) = store
            .replace_collection("p", vec![map(json!({"_id": "new", "n": 1}))])
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(inserted, vec!["new".to_string()]);
        assert_eq!(ids(&store, "p", &Filter::all()), vec!["new".to_string()]);
        assert_eq!(store.count("q").unwrap(), 1);
    }

    #[test]
    fn failed_replace_collection_keeps_previous_documents() {
        let (_tmp, store) = store();
        store
            .insert_many("p", vec![map(json!({"_id": "a"})), map(json!({"_id": "b"}))])
            .unwrap();

        let err = store
            .replace_collection("p", vec![map(json!({"_id": "x"})), map(json!({"_id": "x"}))])
            .unwrap_err();

        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(
            ids(&store, "p", &Filter::all()),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
