//! Normalization of freshly imported documents.
//!
//! RFC3339 strings become native timestamps (in maps at any depth, and in
//! lists only inside map elements), the exporter's top-level `id` key is
//! dropped, and every visited map gets its missing audit fields filled in.

use std::mem;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::document::{DocPath, DocumentValue, Map, PathSegment};
use crate::walker::{walk_mut, VisitorMut};

pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Surrogate key of the source system, superseded by the store's own id.
pub const SOURCE_ID_FIELD: &str = "id";

pub struct Normalizer {
    now: DateTime<Utc>,
}

impl Normalizer {
    /// Reads the clock once; every document normalized with this instance
    /// gets the same default timestamps.
    pub fn new(clock: &dyn Clock) -> Self {
        Self { now: clock.now() }
    }

    pub fn normalize(&mut self, doc: Map) -> Map {
        let mut root = DocumentValue::Map(doc);
        walk_mut(&mut root, self);
        match root {
            DocumentValue::Map(map) => map,
            _ => Map::new(),
        }
    }
}

impl VisitorMut for Normalizer {
    fn enter(&mut self, path: &DocPath, node: &DocumentValue) -> bool {
        // List elements are only descended into when they are maps.
        !matches!(path.last(), Some(PathSegment::Index(_))) || matches!(node, DocumentValue::Map(_))
    }

    fn visit_leaf(&mut self, _path: &DocPath, leaf: &mut DocumentValue) {
        if let Some(ts) = leaf.as_str().and_then(parse_timestamp) {
            *leaf = DocumentValue::Timestamp(ts);
        }
    }

    fn leave_map(&mut self, path: &DocPath, map: &mut Map) {
        if path.is_root() {
            map.remove(SOURCE_ID_FIELD);
        }
        for field in [CREATED_AT_FIELD, UPDATED_AT_FIELD] {
            map.entry(field.to_string())
                .or_insert(DocumentValue::Timestamp(self.now));
        }
    }
}

/// Normalize one document against `clock`.
pub fn normalize(doc: Map, clock: &dyn Clock) -> Map {
    Normalizer::new(clock).normalize(doc)
}

/// Normalize in place.
pub fn normalize_in_place(doc: &mut Map, clock: &dyn Clock) {
    *doc = normalize(mem::take(doc), clock);
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
