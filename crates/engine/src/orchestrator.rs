//! Migration orchestrator: one pass over a collection, extracting embedded
//! media from every document and writing back the ones that changed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use unembed_protocol::MigrationStats;

use crate::blob::BlobSink;
use crate::clock::{Clock, SystemClock};
use crate::extract::transform_document;
use crate::normalize::UPDATED_AT_FIELD;
use crate::rules::RuleSet;
use crate::store::{CursorGuard, DocumentStore, Filter, StoreError, StoredDocument};

// ---------------------------------------------------------------------------
// Run phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Fetching,
    Transforming,
    Persisting,
    Done,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Fetching => "fetching",
            RunPhase::Transforming => "transforming",
            RunPhase::Persisting => "persisting",
            RunPhase::Done => "done",
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared flag checked between documents.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// A guard that cancels the run when dropped, e.g. together with the
    /// request future that started it.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop(self.clone())
    }
}

pub struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("collection {collection} is unavailable: {source}")]
    Unavailable {
        collection: String,
        #[source]
        source: StoreError,
    },
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<'a> {
    store: &'a dyn DocumentStore,
    sink: &'a dyn BlobSink,
    rules: &'a RuleSet,
    clock: Arc<dyn Clock>,
    cancel: CancelFlag,
    touch_updated_at: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a dyn DocumentStore, sink: &'a dyn BlobSink, rules: &'a RuleSet) -> Self {
        Self {
            store,
            sink,
            rules,
            clock: Arc::new(SystemClock),
            cancel: CancelFlag::new(),
            touch_updated_at: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether a rewritten document gets a fresh `updatedAt`. On by default.
    pub fn touch_updated_at(mut self, touch: bool) -> Self {
        self.touch_updated_at = touch;
        self
    }

    /// Migrate every document in `collection` matching `filter`.
    ///
    /// Item failures end up in `errors` and never stop the run. Only a cursor
    /// that cannot be opened is an `Err`; a cursor failing halfway sets
    /// `aborted` and returns what was done so far.
    pub fn run(&self, collection: &str, filter: &Filter) -> Result<MigrationStats, MigrationError> {
        let mut stats = MigrationStats::default();
        let mut phase = RunPhase::Idle;

        info!(
            component = "migration",
            event = "migration.started",
            collection = %collection,
            rules = self.rules.len(),
            "Starting embedded media migration"
        );

        let cursor = self
            .store
            .find(collection, filter)
            .map_err(|source| {
                error!(
                    component = "migration",
                    event = "migration.unavailable",
                    collection = %collection,
                    error = %source,
                    "Could not open cursor"
                );
                MigrationError::Unavailable {
                    collection: collection.to_string(),
                    source,
                }
            })?;
        let mut cursor = CursorGuard::new(cursor);

        loop {
            if self.cancel.is_cancelled() {
                stats.cancelled = true;
                warn!(
                    component = "migration",
                    event = "migration.cancelled",
                    collection = %collection,
                    processed = stats.processed,
                    "Migration cancelled"
                );
                break;
            }

            enter(&mut phase, RunPhase::Fetching);
            let doc = match cursor.next_document() {
                None => break,
                Some(Ok(doc)) => doc,
                Some(Err(e)) if e.is_item_local() => {
                    stats.processed += 1;
                    warn!(
                        component = "migration",
                        event = "migration.document_unreadable",
                        collection = %collection,
                        error = %e,
                        "Skipping unreadable document"
                    );
                    stats.errors.push(e.to_string());
                    continue;
                }
                Some(Err(e)) => {
                    error!(
                        component = "migration",
                        event = "migration.aborted",
                        collection = %collection,
                        processed = stats.processed,
                        error = %e,
                        "Cursor failed, ending run"
                    );
                    stats.aborted = Some(e.to_string());
                    break;
                }
            };

            stats.processed += 1;
            enter(&mut phase, RunPhase::Transforming);
            self.migrate_document(collection, doc, &mut phase, &mut stats);
        }

        enter(&mut phase, RunPhase::Done);
        drop(cursor);

        info!(
            component = "migration",
            event = "migration.completed",
            collection = %collection,
            processed = stats.processed,
            migrated = stats.migrated,
            extracted = stats.extracted,
            errors = stats.errors.len(),
            complete = stats.is_complete(),
            "Migration finished"
        );

        Ok(stats)
    }

    fn migrate_document(
        &self,
        collection: &str,
        doc: StoredDocument,
        phase: &mut RunPhase,
        stats: &mut MigrationStats,
    ) {
        let StoredDocument { id, mut body } = doc;

        let outcome = transform_document(&mut body, self.rules, self.sink);
        stats.extracted += outcome.extracted.len() as u64;
        for e in &outcome.errors {
            stats.errors.push(format!("document {id}: {e}"));
        }

        if !outcome.changed {
            debug!(
                component = "migration",
                event = "migration.document_unchanged",
                collection = %collection,
                document_id = %id,
                "Nothing to extract"
            );
            return;
        }

        if self.touch_updated_at {
            body.insert(UPDATED_AT_FIELD.to_string(), self.clock.now().into());
        }

        enter(phase, RunPhase::Persisting);
        match self.store.replace_one(collection, &id, &body) {
            Ok(()) => {
                stats.migrated += 1;
                debug!(
                    component = "migration",
                    event = "migration.document_migrated",
                    collection = %collection,
                    document_id = %id,
                    extracted = outcome.extracted.len(),
                    "Document rewritten"
                );
            }
            Err(e) => {
                warn!(
                    component = "migration",
                    event = "migration.document_failed",
                    collection = %collection,
                    document_id = %id,
                    error = %e,
                    "Failed to write back document"
                );
                stats
                    .errors
                    .push(format!("document {id}: failed to update document: {e}"));
            }
        }
    }
}

fn enter(phase: &mut RunPhase, next: RunPhase) {
    if *phase != next {
        debug!(
            component = "migration",
            event = "migration.phase",
            from = phase.as_str(),
            to = next.as_str(),
            "Phase change"
        );
        *phase = next;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::blob::{BlobError, BlobReference, DirectoryBlobSink};
    use crate::clock::FixedClock;
    use crate::data_uri::encode;
    use crate::document::{DocumentValue, Map};
    use crate::store::{DocumentCursor, MemoryStore};

    fn map(v: serde_json::Value) -> Map {
        match DocumentValue::from(v) {
            DocumentValue::Map(m) => m,
            other => panic!("expected map, got {}", other.kind()),
        }
    }

    fn site(id: &str, logo: &str) -> Map {
        map(json!({"_id": id, "type": "retail", "content": {"images": {"logo": logo}}}))
    }

    fn png() -> String {
        encode(b"\x89PNG", "image/png")
    }

    #[test]
    fn migrates_changed_documents_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store
            .insert_many(
                "metadata",
                vec![site("a", &png()), site("b", "/uploads/done.png"), site("c", &png())],
            )
            .unwrap();
        let sink = DirectoryBlobSink::new(tmp.path());
        let rules = RuleSet::site_content();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        let stats = Orchestrator::new(&store, &sink, &rules)
            .with_clock(Arc::new(FixedClock(now)))
            .run("metadata", &Filter::all())
            .unwrap();

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.migrated, 2);
        assert_eq!(stats.extracted, 2);
        assert!(stats.errors.is_empty());
        assert!(stats.is_complete());
        assert_eq!(store.cursors_closed(), 1);

        let a = store.get("metadata", "a").unwrap();
        assert_eq!(a[UPDATED_AT_FIELD].as_timestamp(), Some(now));
        let b = store.get("metadata", "b").unwrap();
        assert!(!b.contains_key(UPDATED_AT_FIELD));
    }

    #[test]
    fn rerun_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.insert_many("metadata", vec![site("a", &png())]).unwrap();
        let sink = DirectoryBlobSink::new(tmp.path());
        let rules = RuleSet::site_content();
        let orchestrator = Orchestrator::new(&store, &sink, &rules);

        let first = orchestrator.run("metadata", &Filter::all()).unwrap();
        let after_first = store.get("metadata", "a").unwrap();
        let second = orchestrator.run("metadata", &Filter::all()).unwrap();

        assert_eq!(first.migrated, 1);
        assert_eq!(second.processed, 1);
        assert_eq!(second.migrated, 0);
        assert!(second.errors.is_empty());
        assert_eq!(store.get("metadata", "a").unwrap(), after_first);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn filter_limits_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let mut other = site("w", &png());
        other.insert("type".into(), "wholesale".into());
        store
            .insert_many("metadata", vec![site("r", &png()), other])
            .unwrap();
        let sink = DirectoryBlobSink::new(tmp.path());
        let rules = RuleSet::site_content();

        let stats = Orchestrator::new(&store, &sink, &rules)
            .run("metadata", &Filter::all().eq("type", "retail"))
            .unwrap();

        assert_eq!(stats.processed, 1);
        assert_eq!(stats.migrated, 1);
        let untouched = store.get("metadata", "w").unwrap();
        assert!(untouched["content"]
            .as_map()
            .and_then(|c| c["images"].as_map())
            .and_then(|i| i["logo"].as_str())
            .unwrap()
            .starts_with("data:image/png"));
    }

    #[test]
    fn persistence_failure_is_item_local() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store
            .insert_many("metadata", vec![site("a", &png()), site("b", &png())])
            .unwrap();
        store.fail_replace_for("a");
        let sink = DirectoryBlobSink::new(tmp.path());
        let rules = RuleSet::site_content();

        let stats = Orchestrator::new(&store, &sink, &rules)
            .run("metadata", &Filter::all())
            .unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.migrated, 1);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.errors[0].starts_with("document a: failed to update document"));
    }

    #[test]
    fn unreadable_document_is_item_local() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store
            .insert_many("metadata", vec![site("a", &png()), site("b", &png())])
            .unwrap();
        store.fail_decode_for("a");
        let sink = DirectoryBlobSink::new(tmp.path());
        let rules = RuleSet::site_content();

        let stats = Orchestrator::new(&store, &sink, &rules)
            .run("metadata", &Filter::all())
            .unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.migrated, 1);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.is_complete());
    }

    #[test]
    fn cursor_failure_aborts_with_partial_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store
            .insert_many(
                "metadata",
                vec![site("a", &png()), site("b", &png()), site("c", &png())],
            )
            .unwrap();
        store.fail_iteration_after(1);
        let sink = DirectoryBlobSink::new(tmp.path());
        let rules = RuleSet::site_content();

        let stats = Orchestrator::new(&store, &sink, &rules)
            .run("metadata", &Filter::all())
            .unwrap();

        assert_eq!(stats.processed, 1);
        assert_eq!(stats.migrated, 1);
        assert!(stats.aborted.is_some());
        assert!(!stats.is_complete());
        assert_eq!(store.cursors_closed(), 1);
    }

    #[test]
    fn unavailable_store_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let sink = DirectoryBlobSink::new(tmp.path());
        let rules = RuleSet::site_content();

        let err = Orchestrator::new(&store, &sink, &rules)
            .run("metadata", &Filter::all())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Unavailable { .. }));
    }

    #[test]
    fn cancellation_is_observed_between_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store
            .insert_many("metadata", vec![site("a", &png()), site("b", &png())])
            .unwrap();
        let sink = DirectoryBlobSink::new(tmp.path());
        let rules = RuleSet::site_content();
        let cancel = CancelFlag::new();
        drop(cancel.cancel_on_drop());

        let stats = Orchestrator::new(&store, &sink, &rules)
            .with_cancel(cancel)
            .run("metadata", &Filter::all())
            .unwrap();

        assert!(stats.cancelled);
        assert_eq!(stats.processed, 0);
        assert_eq!(store.cursors_closed(), 1);
    }

    /// Sink that panics on the first write, to check the cursor is released on unwind.
    struct PanickingSink;

    impl BlobSink for PanickingSink {
        fn store(&self, _: &str, _: &[u8], _: &str) -> Result<BlobReference, BlobError> {
            panic!("sink exploded");
        }

        fn read(&self, name: &str) -> Result<Vec<u8>, BlobError> {
            Err(BlobError::NotFound(name.to_string()))
        }
    }

    #[test]
    fn cursor_released_on_unwind() {
        let store = MemoryStore::new();
        store.insert_many("metadata", vec![site("a", &png())]).unwrap();
        let rules = RuleSet::site_content();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Orchestrator::new(&store, &PanickingSink, &rules).run("metadata", &Filter::all())
        }));

        assert!(result.is_err());
        assert_eq!(store.cursors_closed(), 1);
    }

    /// Cursor whose close is observable without a store.
    struct CountingCursor(Arc<Mutex<usize>>);

    impl DocumentCursor for CountingCursor {
        fn next_document(&mut self) -> Option<Result<StoredDocument, StoreError>> {
            None
        }

        fn close(&mut self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn guard_closes_once_on_drop() {
        let closes = Arc::new(Mutex::new(0));
        {
            let mut guard = CursorGuard::new(Box::new(CountingCursor(closes.clone())));
            assert!(guard.next_document().is_none());
        }
        assert_eq!(*closes.lock().unwrap(), 1);
    }
}
