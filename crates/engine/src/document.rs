//! Untyped document values and paths into them.
//!
//! A `DocumentValue` is whatever the document store handed back: nested maps,
//! ordered lists and scalars, with no schema. Native timestamps travel through
//! JSON as extended-JSON `{"$date": "..."}` objects.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key used to carry a timestamp through JSON.
pub const DATE_KEY: &str = "$date";

pub type Map = BTreeMap<String, DocumentValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum DocumentValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Timestamp(DateTime<Utc>),
    List(Vec<DocumentValue>),
    Map(Map),
}

impl DocumentValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DocumentValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            DocumentValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self {
            DocumentValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            DocumentValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Short variant name, for log fields and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentValue::Null => "null",
            DocumentValue::Bool(_) => "bool",
            DocumentValue::Number(_) => "number",
            DocumentValue::String(_) => "string",
            DocumentValue::Timestamp(_) => "timestamp",
            DocumentValue::List(_) => "list",
            DocumentValue::Map(_) => "map",
        }
    }

    /// Follow `path` from this value.
    pub fn get_path(&self, path: &DocPath) -> Option<&DocumentValue> {
        path.segments()
            .iter()
            .try_fold(self, |node, segment| match (segment, node) {
                (PathSegment::Key(k), DocumentValue::Map(m)) => m.get(k),
                (PathSegment::Index(i), DocumentValue::List(items)) => items.get(*i),
                _ => None,
            })
    }

    pub fn get_path_mut(&mut self, path: &DocPath) -> Option<&mut DocumentValue> {
        let mut node = self;
        for segment in path.segments() {
            node = match (segment, node) {
                (PathSegment::Key(k), DocumentValue::Map(m)) => m.get_mut(k)?,
                (PathSegment::Index(i), DocumentValue::List(items)) => items.get_mut(*i)?,
                _ => return None,
            };
        }
        Some(node)
    }
}

impl From<&str> for DocumentValue {
    fn from(s: &str) -> Self {
        DocumentValue::String(s.to_string())
    }
}

impl From<String> for DocumentValue {
    fn from(s: String) -> Self {
        DocumentValue::String(s)
    }
}

impl From<Map> for DocumentValue {
    fn from(m: Map) -> Self {
        DocumentValue::Map(m)
    }
}

impl From<DateTime<Utc>> for DocumentValue {
    fn from(t: DateTime<Utc>) -> Self {
        DocumentValue::Timestamp(t)
    }
}

impl From<Value> for DocumentValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => DocumentValue::Null,
            Value::Bool(b) => DocumentValue::Bool(b),
            Value::Number(n) => DocumentValue::Number(n),
            Value::String(s) => DocumentValue::String(s),
            Value::Array(items) => {
                DocumentValue::List(items.into_iter().map(DocumentValue::from).collect())
            }
            Value::Object(obj) => {
                if let Some(ts) = extended_date(&obj) {
                    return DocumentValue::Timestamp(ts);
                }
                DocumentValue::Map(
                    obj.into_iter()
                        .map(|(k, v)| (k, DocumentValue::from(v)))
                        .collect(),
                )
            }
        }
    }
}

impl From<DocumentValue> for Value {
    fn from(value: DocumentValue) -> Self {
        match value {
            DocumentValue::Null => Value::Null,
            DocumentValue::Bool(b) => Value::Bool(b),
            DocumentValue::Number(n) => Value::Number(n),
            DocumentValue::String(s) => Value::String(s),
            DocumentValue::Timestamp(t) => {
                let mut obj = serde_json::Map::new();
                obj.insert(
                    DATE_KEY.to_string(),
                    Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
                Value::Object(obj)
            }
            DocumentValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            DocumentValue::Map(m) => {
                Value::Object(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

fn extended_date(obj: &serde_json::Map<String, Value>) -> Option<DateTime<Utc>> {
    if obj.len() != 1 {
        return None;
    }
    let raw = obj.get(DATE_KEY)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location of a node inside a document, root first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DocPath(Vec<PathSegment>);

impl DocPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.0.last()
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.0.pop()
    }

    pub fn parent(&self) -> Option<DocPath> {
        if self.0.is_empty() {
            return None;
        }
        Some(DocPath(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn child_key(&self, key: &str) -> DocPath {
        let mut path = self.clone();
        path.push(PathSegment::Key(key.to_string()));
        path
    }

    /// The innermost map key on the path.
    pub fn last_key(&self) -> Option<&str> {
        self.0.iter().rev().find_map(|s| match s {
            PathSegment::Key(k) => Some(k.as_str()),
            PathSegment::Index(_) => None,
        })
    }

    /// The innermost list index on the path.
    pub fn last_index(&self) -> Option<usize> {
        self.0.iter().rev().find_map(|s| match s {
            PathSegment::Index(i) => Some(*i),
            PathSegment::Key(_) => None,
        })
    }
}

impl<S: Into<String>> FromIterator<S> for DocPath {
    /// Build a path of keys only.
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        DocPath(iter.into_iter().map(|k| PathSegment::Key(k.into())).collect())
    }
}

impl From<Vec<PathSegment>> for DocPath {
    fn from(segments: Vec<PathSegment>) -> Self {
        DocPath(segments)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("$");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(k) if i == 0 => write!(f, "{k}")?,
                PathSegment::Key(k) => write!(f, ".{k}")?,
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}
