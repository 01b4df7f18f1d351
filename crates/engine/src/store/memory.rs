//! In-process document store, with switches for simulating backend faults.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{take_id, DocumentCursor, DocumentStore, Filter, StoreError, StoredDocument};
use crate::document::Map;

type Collections = BTreeMap<String, Vec<(String, Map)>>;

#[derive(Default)]
struct Shared {
    collections: Mutex<Collections>,
    fail_replace: Mutex<HashSet<String>>,
    fail_decode: Mutex<HashSet<String>>,
    fail_iteration_after: Mutex<Option<usize>>,
    unavailable: AtomicBool,
    cursors_closed: AtomicUsize,
}

impl Shared {
    fn collections(&self) -> Result<MutexGuard<'_, Collections>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn contains(set: &Mutex<HashSet<String>>, id: &str) -> bool {
        set.lock().map(|s| s.contains(id)).unwrap_or(false)
    }
}

/// Documents kept in memory, in insertion order per collection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `replace_one` fail for this id.
    pub fn fail_replace_for(&self, id: impl Into<String>) {
        if let Ok(mut set) = self.shared.fail_replace.lock() {
            set.insert(id.into());
        }
    }

    /// Make cursors yield a decode error for this id.
    pub fn fail_decode_for(&self, id: impl Into<String>) {
        if let Ok(mut set) = self.shared.fail_decode.lock() {
            set.insert(id.into());
        }
    }

    /// Make cursors fail with a backend error after yielding `n` documents.
    pub fn fail_iteration_after(&self, n: usize) {
        if let Ok(mut slot) = self.shared.fail_iteration_after.lock() {
            *slot = Some(n);
        }
    }

    /// Make `find` fail as if the backend were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many cursors have been closed so far.
    pub fn cursors_closed(&self) -> usize {
        self.shared.cursors_closed.load(Ordering::SeqCst)
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Map> {
        let collections = self.shared.collections().ok()?;
        collections
            .get(collection)?
            .iter()
            .find(|(doc_id, _)| doc_id == id)
            .map(|(_, body)| body.clone())
    }

    pub fn all(&self, collection: &str) -> Vec<StoredDocument> {
        let Ok(collections) = self.shared.collections() else {
            return Vec::new();
        };
        collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, body)| StoredDocument {
                        id: id.clone(),
                        body: body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl DocumentStore for MemoryStore {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Box<dyn DocumentCursor>, StoreError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }

        let ids = self
            .shared
            .collections()?
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, body)| filter.matches(body))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let fail_after = self
            .shared
            .fail_iteration_after
            .lock()
            .map(|slot| *slot)
            .unwrap_or(None);

        Ok(Box::new(MemoryCursor {
            shared: Arc::clone(&self.shared),
            collection: collection.to_string(),
            ids,
            position: 0,
            fail_after,
            closed: false,
        }))
    }

    fn insert_many(&self, collection: &str, docs: Vec<Map>) -> Result<Vec<String>, StoreError> {
        let mut collections = self.shared.collections()?;
        let target = collections.entry(collection.to_string()).or_default();

        let rows = assign_ids(collection, target, docs)?;
        let ids = rows.iter().map(|(id, _)| id.clone()).collect();
        target.extend(rows);
        Ok(ids)
    }

    fn replace_collection(
        &self,
        collection: &str,
        docs: Vec<Map>,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut collections = self.shared.collections()?;

        let rows = assign_ids(collection, &[], docs)?;
        let ids = rows.iter().map(|(id, _)| id.clone()).collect();
        let removed = collections
            .insert(collection.to_string(), rows)
            .map(|old| old.len() as u64)
            .unwrap_or(0);
        Ok((removed, ids))
    }

    fn replace_one(&self, collection: &str, id: &str, body: &Map) -> Result<(), StoreError> {
        if Shared::contains(&self.shared.fail_replace, id) {
            return Err(StoreError::Backend(format!("write rejected for {id}")));
        }

        let mut collections = self.shared.collections()?;
        let slot = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|(doc_id, _)| doc_id == id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        slot.1 = body.clone();
        Ok(())
    }

    fn drop_collection(&self, collection: &str) -> Result<u64, StoreError> {
        let removed = self.shared.collections()?.remove(collection);
        Ok(removed.map(|docs| docs.len() as u64).unwrap_or(0))
    }

    fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let collections = self.shared.collections()?;
        Ok(collections.get(collection).map(|d| d.len() as u64).unwrap_or(0))
    }
}

/// Split ids out of `docs`, rejecting any that clash with `existing` or with
/// each other. Nothing is written here, so a failure leaves the store as it was.
fn assign_ids(
    collection: &str,
    existing: &[(String, Map)],
    docs: Vec<Map>,
) -> Result<Vec<(String, Map)>, StoreError> {
    let mut seen: HashSet<String> = existing.iter().map(|(id, _)| id.clone()).collect();
    let mut rows = Vec::with_capacity(docs.len());
    for mut body in docs {
        let id = take_id(&mut body);
        if !seen.insert(id.clone()) {
            return Err(StoreError::Backend(format!("duplicate id {id} in {collection}")));
        }
        rows.push((id, body));
    }
    Ok(rows)
}

struct MemoryCursor {
    shared: Arc<Shared>,
    collection: String,
    ids: Vec<String>,
    position: usize,
    fail_after: Option<usize>,
    closed: bool,
}

impl DocumentCursor for MemoryCursor {
    fn next_document(&mut self) -> Option<Result<StoredDocument, StoreError>> {
        if self.closed {
            return Some(Err(StoreError::CursorClosed));
        }
        if self.fail_after.is_some_and(|n| self.position >= n) && self.position < self.ids.len() {
            self.position = self.ids.len();
            return Some(Err(StoreError::Backend("cursor iteration failed".to_string())));
        }

        let id = self.ids.get(self.position)?.clone();
        self.position += 1;

        if Shared::contains(&self.shared.fail_decode, &id) {
            return Some(Err(StoreError::Decode {
                id,
                message: "corrupt document body".to_string(),
            }));
        }

        let body = match self.shared.collections() {
            Ok(collections) => collections
                .get(&self.collection)
                .and_then(|docs| docs.iter().find(|(doc_id, _)| *doc_id == id))
                .map(|(_, body)| body.clone()),
            Err(e) => return Some(Err(e)),
        };

        Some(match body {
            Some(body) => Ok(StoredDocument { id, body }),
            None => Err(StoreError::NotFound {
                collection: self.collection.clone(),
                id,
            }),
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.cursors_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
