//! Document store collaborator.
//!
//! The engine only needs a handful of operations: open a cursor over a
//! collection, replace a document by id, and (for imports) drop and bulk
//! insert. Documents are opaque maps; the id lives outside the body.

mod memory;

pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use crate::document::{DocumentValue, Map};

/// Field carrying a document's identity in exported and imported JSON.
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub body: Map,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    #[error("document {id} could not be decoded: {message}")]
    Decode { id: String, message: String },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("cursor already closed")]
    CursorClosed,
}

impl StoreError {
    /// Errors that concern a single document rather than the store itself.
    pub fn is_item_local(&self) -> bool {
        matches!(self, StoreError::NotFound { .. } | StoreError::Decode { .. })
    }
}

/// Conjunction of top-level field equalities. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    fields: BTreeMap<String, DocumentValue>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<DocumentValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &DocumentValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn matches(&self, body: &Map) -> bool {
        self.fields
            .iter()
            .all(|(field, want)| body.get(field) == Some(want))
    }
}

impl From<BTreeMap<String, serde_json::Value>> for Filter {
    fn from(fields: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k, DocumentValue::from(v)))
                .collect(),
        }
    }
}

/// Forward-only iteration over the documents of one `find`.
pub trait DocumentCursor: Send {
    /// `Some(Err)` with an item-local error skips one document; any other
    /// error means iteration cannot continue.
    fn next_document(&mut self) -> Option<Result<StoredDocument, StoreError>>;

    /// Release the cursor. Calling it more than once is harmless.
    fn close(&mut self);
}

/// Closes the wrapped cursor when dropped, including on early return and unwind.
pub struct CursorGuard {
    cursor: Box<dyn DocumentCursor>,
}

impl CursorGuard {
    pub fn new(cursor: Box<dyn DocumentCursor>) -> Self {
        Self { cursor }
    }
}

impl Deref for CursorGuard {
    type Target = dyn DocumentCursor;

    fn deref(&self) -> &Self::Target {
        self.cursor.as_ref()
    }
}

impl DerefMut for CursorGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.cursor.as_mut()
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.cursor.close();
    }
}

pub trait DocumentStore: Send + Sync {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Box<dyn DocumentCursor>, StoreError>;

    /// Insert documents, returning their ids in order. A body `_id` is used
    /// as the id when present, otherwise one is generated.
    fn insert_many(&self, collection: &str, docs: Vec<Map>) -> Result<Vec<String>, StoreError>;

    /// Swap the whole collection for `docs` in one step, returning how many
    /// documents were removed and the new ids. On error the collection keeps
    /// its previous contents.
    fn replace_collection(
        &self,
        collection: &str,
        docs: Vec<Map>,
    ) -> Result<(u64, Vec<String>), StoreError>;

    fn replace_one(&self, collection: &str, id: &str, body: &Map) -> Result<(), StoreError>;

    /// Remove every document in the collection, returning how many went.
    fn drop_collection(&self, collection: &str) -> Result<u64, StoreError>;

    fn count(&self, collection: &str) -> Result<u64, StoreError>;
}

/// Split the id out of a document body, generating one when the body has none.
pub fn take_id(body: &mut Map) -> String {
    match body.remove(ID_FIELD) {
        Some(DocumentValue::String(s)) if !s.is_empty() => s,
        Some(DocumentValue::Number(n)) => n.to_string(),
        Some(other) => {
            // Unusable id shapes go back where they came from.
            body.insert(ID_FIELD.to_string(), other);
            uuid::Uuid::new_v4().to_string()
        }
        None => uuid::Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: serde_json::Value) -> Map {
        match DocumentValue::from(v) {
            DocumentValue::Map(m) => m,
            other => panic!("expected map, got {}", other.kind()),
        }
    }

    #[test]
    fn filter_matches_top_level_equality() {
        let doc = map(json!({"type": "retail", "name": "shop", "nested": {"type": "x"}}));

        assert!(Filter::all().matches(&doc));
        assert!(Filter::all().eq("type", "retail").matches(&doc));
        assert!(!Filter::all().eq("type", "wholesale").matches(&doc));
        assert!(!Filter::all().eq("missing", "x").matches(&doc));
        assert!(!Filter::all().eq("type", "retail").eq("name", "other").matches(&doc));
    }

    #[test]
    fn filter_from_json_fields() {
        let fields: BTreeMap<String, serde_json::Value> =
            serde_json::from_value(json!({"type": "retail", "active": true})).unwrap();
        let filter = Filter::from(fields);
        assert!(filter.matches(&map(json!({"type": "retail", "active": true}))));
        assert!(!filter.matches(&map(json!({"type": "retail", "active": false}))));
    }

    #[test]
    fn take_id_prefers_body_id() {
        let mut body = map(json!({"_id": "abc", "x": 1}));
        assert_eq!(take_id(&mut body), "abc");
        assert!(!body.contains_key(ID_FIELD));

        let mut body = map(json!({"_id": 42}));
        assert_eq!(take_id(&mut body), "42");

        let mut body = map(json!({"x": 1}));
        let id = take_id(&mut body);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn item_local_errors() {
        assert!(StoreError::NotFound {
            collection: "c".into(),
            id: "1".into()
        }
        .is_item_local());
        assert!(StoreError::Decode {
            id: "1".into(),
            message: "bad".into()
        }
        .is_item_local());
        assert!(!StoreError::Backend("down".into()).is_item_local());
        assert!(!StoreError::CursorClosed.is_item_local());
    }
}
