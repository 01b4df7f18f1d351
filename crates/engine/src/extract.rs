//! Extract embedded media from a document tree.
//!
//! Two passes: a read-only walk plans which leaves to extract (rules are matched
//! by path shape, so naming may look at sibling fields), then each planned leaf
//! is decoded, stored and rewritten on its own. A bad leaf is recorded and left
//! as it was; the rest of the document still migrates.

use std::fmt;
use std::mem;

use tracing::{debug, warn};

use crate::blob::{BlobError, BlobReference, BlobSink};
use crate::data_uri::{self, DecodeError};
use crate::document::{DocPath, DocumentValue, Map};
use crate::rules::{ExtractionRule, RuleContext, RuleSet};
use crate::walker::{walk, Visitor};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("value is not an embedded image data URI")]
    NotEmbedded,
}

/// A leaf that could not be migrated.
#[derive(Debug)]
pub struct LeafError {
    pub path: DocPath,
    pub rule: String,
    pub error: ExtractError,
}

impl fmt::Display for LeafError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.error)
    }
}

/// A leaf that was moved to the blob sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub path: DocPath,
    pub rule: String,
    pub blob: BlobReference,
}

#[derive(Debug, Default)]
pub struct TransformOutcome {
    pub changed: bool,
    pub extracted: Vec<Extraction>,
    pub errors: Vec<LeafError>,
}

/// Extract every embedded image the rules point at, rewriting `root` in place.
///
/// Re-running on an already migrated tree is a no-op: rewritten leaves are
/// plain references and are skipped.
pub fn transform(root: &mut DocumentValue, rules: &RuleSet, sink: &dyn BlobSink) -> TransformOutcome {
    let snapshot: &DocumentValue = root;
    let mut planner = Planner {
        rules,
        root: snapshot,
        planned: Vec::new(),
        errors: Vec::new(),
    };
    walk(snapshot, &mut planner);
    let Planner {
        planned,
        mut errors,
        ..
    } = planner;

    let mut outcome = TransformOutcome::default();
    for leaf in planned {
        let rule = leaf.rule;
        match extract_leaf(root, &leaf.path, &leaf.prefix, rule, sink) {
            Ok(blob) => {
                debug!(
                    component = "extract",
                    event = "extract.leaf_migrated",
                    path = %leaf.path,
                    rule = rule.name(),
                    blob = %blob.name,
                    "Extracted embedded image"
                );
                outcome.changed = true;
                outcome.extracted.push(Extraction {
                    path: leaf.path,
                    rule: rule.name().to_string(),
                    blob,
                });
            }
            Err(error) => errors.push(LeafError {
                path: leaf.path,
                rule: rule.name().to_string(),
                error,
            }),
        }
    }

    for e in &errors {
        warn!(
            component = "extract",
            event = "extract.leaf_failed",
            path = %e.path,
            rule = %e.rule,
            error = %e.error,
            "Leaf left unmigrated"
        );
    }
    outcome.errors = errors;
    outcome
}

/// `transform` for a top-level document body.
pub fn transform_document(body: &mut Map, rules: &RuleSet, sink: &dyn BlobSink) -> TransformOutcome {
    let mut root = DocumentValue::Map(mem::take(body));
    let outcome = transform(&mut root, rules, sink);
    if let DocumentValue::Map(map) = root {
        *body = map;
    }
    outcome
}

fn extract_leaf(
    root: &mut DocumentValue,
    path: &DocPath,
    prefix: &str,
    rule: &ExtractionRule,
    sink: &dyn BlobSink,
) -> Result<BlobReference, ExtractError> {
    let uri = match root.get_path(path).and_then(DocumentValue::as_str) {
        Some(s) => data_uri::decode(s)?,
        None => return Err(ExtractError::NotEmbedded),
    };
    let blob = sink.store(prefix, &uri.payload, uri.extension())?;
    if let Some(slot) = root.get_path_mut(path) {
        *slot = rule.rewrite(&blob);
    }
    Ok(blob)
}

/// How a string found at a rule-matched position is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Extract,
    /// Empty, or already points somewhere.
    Resolved,
    Rejected,
}

fn disposition(rule: &ExtractionRule, value: &str) -> Disposition {
    if rule.should_extract(value) {
        Disposition::Extract
    } else if value.is_empty() || value.starts_with('/') || value.contains("://") {
        Disposition::Resolved
    } else {
        Disposition::Rejected
    }
}

struct PlannedLeaf<'r> {
    path: DocPath,
    prefix: String,
    rule: &'r ExtractionRule,
}

struct Planner<'r, 'd> {
    rules: &'r RuleSet,
    root: &'d DocumentValue,
    planned: Vec<PlannedLeaf<'r>>,
    errors: Vec<LeafError>,
}

impl<'r> Visitor for Planner<'r, '_> {
    fn visit_leaf(&mut self, path: &DocPath, leaf: &DocumentValue) {
        let DocumentValue::String(value) = leaf else {
            return;
        };
        let Some(rule) = self.rules.find(path) else {
            return;
        };

        match disposition(rule, value) {
            Disposition::Extract => {
                let prefix = rule.blob_prefix(&RuleContext {
                    path,
                    root: self.root,
                });
                self.planned.push(PlannedLeaf {
                    path: path.clone(),
                    prefix,
                    rule,
                });
            }
            Disposition::Resolved => {}
            Disposition::Rejected => self.errors.push(LeafError {
                path: path.clone(),
                rule: rule.name().to_string(),
                error: ExtractError::NotEmbedded,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::blob::DirectoryBlobSink;
    use crate::data_uri::encode;
    use serde_json::{json, Value};

    /// Sink that records writes in memory and can be told to fail.
    #[derive(Default)]
    struct RecordingSink {
        stored: Mutex<Vec<(String, Vec<u8>, String)>>,
        fail: bool,
    }

    impl BlobSink for RecordingSink {
        fn store(&self, prefix: &str, bytes: &[u8], ext: &str) -> Result<BlobReference, BlobError> {
            if self.fail {
                return Err(BlobError::Write {
                    name: prefix.to_string(),
                    source: std::io::Error::other("disk full"),
                });
            }
            let mut stored = self.stored.lock().unwrap();
            let name = format!("{prefix}-{:016x}{ext}", stored.len());
            stored.push((prefix.to_string(), bytes.to_vec(), ext.to_string()));
            Ok(BlobReference {
                public_path: format!("/uploads/{name}"),
                name,
            })
        }

        fn read(&self, name: &str) -> Result<Vec<u8>, BlobError> {
            Err(BlobError::NotFound(name.to_string()))
        }
    }

    fn png(bytes: &[u8]) -> String {
        encode(bytes, "image/png")
    }

    #[test]
    fn extracts_images_map_entries() {
        let sink = RecordingSink::default();
        let mut doc = DocumentValue::from(json!({
            "content": {"images": {"logo": png(b"logo"), "hero": null, "old": "/uploads/old.png"}}
        }));

        let outcome = transform(&mut doc, &RuleSet::site_content(), &sink);

        assert!(outcome.changed);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.extracted.len(), 1);
        assert_eq!(outcome.extracted[0].path.to_string(), "content.images.logo");

        let json = Value::from(doc);
        assert_eq!(json["content"]["images"]["logo"], "/uploads/logo-0000000000000000.png");
        assert_eq!(json["content"]["images"]["hero"], Value::Null);
        assert_eq!(json["content"]["images"]["old"], "/uploads/old.png");

        let stored = sink.stored.lock().unwrap();
        assert_eq!(stored[0], ("logo".to_string(), b"logo".to_vec(), ".png".to_string()));
    }

    #[test]
    fn extracts_list_shapes_with_positional_names() {
        let sink = RecordingSink::default();
        let mut doc = DocumentValue::from(json!({
            "content": {
                "pricing": [{"name": "Pro Plan", "image": encode(b"p", "image/jpeg")}],
                "features": [{"title": "no image"}, {"image": encode(b"f", "image/webp")}],
                "products": [{"image": encode(b"x", "image/gif")}],
            }
        }));

        let outcome = transform(&mut doc, &RuleSet::site_content(), &sink);

        assert_eq!(outcome.extracted.len(), 3);
        assert!(outcome.errors.is_empty());
        let prefixes: Vec<(String, String)> = sink
            .stored
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _, ext)| (p.clone(), ext.clone()))
            .collect();
        assert_eq!(
            prefixes,
            vec![
                ("feature_1".to_string(), ".webp".to_string()),
                ("pricing-Pro Plan".to_string(), ".jpg".to_string()),
                ("product_0".to_string(), ".gif".to_string()),
            ]
        );

        let json = Value::from(doc);
        assert_eq!(json["content"]["features"][0], json!({"title": "no image"}));
        assert!(json["content"]["features"][1]["image"]
            .as_str()
            .unwrap()
            .starts_with("/uploads/feature_1-"));
    }

    #[test]
    fn same_prefix_elsewhere_is_not_a_candidate() {
        let sink = RecordingSink::default();
        let mut doc = DocumentValue::from(json!({
            "content": {"hero": {"image": png(b"x")}},
            "image": png(b"y"),
        }));

        let outcome = transform(&mut doc, &RuleSet::site_content(), &sink);

        assert!(!outcome.changed);
        assert!(outcome.errors.is_empty());
        assert!(sink.stored.lock().unwrap().is_empty());
    }

    #[test]
    fn bad_leaf_is_isolated() {
        let sink = RecordingSink::default();
        let mut doc = DocumentValue::from(json!({
            "content": {"images": {
                "a": png(b"a"),
                "b": "data:image/png;base64,!!!",
                "c": png(b"c"),
                "d": png(b"d"),
            }}
        }));

        let outcome = transform(&mut doc, &RuleSet::site_content(), &sink);

        assert!(outcome.changed);
        assert_eq!(outcome.extracted.len(), 3);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path.to_string(), "content.images.b");
        assert!(matches!(
            outcome.errors[0].error,
            ExtractError::Decode(DecodeError::InvalidBase64(_))
        ));
        let json = Value::from(doc);
        assert_eq!(json["content"]["images"]["b"], "data:image/png;base64,!!!");
    }

    #[test]
    fn non_uri_at_image_position_is_reported() {
        let sink = RecordingSink::default();
        let mut doc = DocumentValue::from(json!({
            "content": {"pricing": [{"name": "Pro Plan", "image": "not-a-data-uri"}]}
        }));
        let before = doc.clone();

        let outcome = transform(&mut doc, &RuleSet::site_content(), &sink);

        assert!(!outcome.changed);
        assert_eq!(outcome.errors.len(), 1);
        let message = outcome.errors[0].to_string();
        assert!(message.contains("pricing[0]"), "{message}");
        assert!(matches!(outcome.errors[0].error, ExtractError::NotEmbedded));
        assert_eq!(doc, before);
    }

    #[test]
    fn store_failure_leaves_leaf_untouched() {
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let original = png(b"logo");
        let mut doc = DocumentValue::from(json!({"content": {"images": {"logo": original}}}));

        let outcome = transform(&mut doc, &RuleSet::site_content(), &sink);

        assert!(!outcome.changed);
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(outcome.errors[0].error, ExtractError::Blob(_)));
        assert_eq!(Value::from(doc)["content"]["images"]["logo"], original);
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = DirectoryBlobSink::new(tmp.path());
        let rules = RuleSet::site_content();
        let mut doc = DocumentValue::from(json!({
            "content": {
                "images": {"logo": png(b"1"), "favicon": encode(b"2", "image/x-icon")},
                "pricing": [{"name": "Basic", "image": png(b"3")}, {"name": "Empty", "image": ""}],
            }
        }));

        let first = transform(&mut doc, &rules, &sink);
        assert!(first.changed);
        assert_eq!(first.extracted.len(), 3);
        let migrated = doc.clone();

        let second = transform(&mut doc, &rules, &sink);
        assert!(!second.changed);
        assert!(second.errors.is_empty());
        assert!(second.extracted.is_empty());
        assert_eq!(doc, migrated);
    }

    #[test]
    fn second_pass_is_a_no_op_with_relative_public_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = DirectoryBlobSink::new(tmp.path()).with_public_prefix("uploads");
        let rules = RuleSet::site_content();
        let mut doc = DocumentValue::from(json!({"content": {"images": {"logo": png(b"1")}}}));

        let first = transform(&mut doc, &rules, &sink);
        assert!(first.changed);
        assert!(first.errors.is_empty());
        let logo = Value::from(doc.clone())["content"]["images"]["logo"].clone();
        assert!(logo.as_str().unwrap().starts_with("/uploads/logo-"));

        let second = transform(&mut doc, &rules, &sink);
        assert!(!second.changed);
        assert!(second.errors.is_empty(), "{:?}", second.errors);
    }

    #[test]
    fn long_plan_names_still_migrate() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = DirectoryBlobSink::new(tmp.path()).with_suffix_bytes(16);
        let mut doc = DocumentValue::from(json!({
            "content": {"pricing": [{"name": "Premium ".repeat(40), "image": png(b"p")}]}
        }));

        let outcome = transform(&mut doc, &RuleSet::site_content(), &sink);

        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(outcome.extracted.len(), 1);
    }

    #[test]
    fn transform_document_works_on_bodies() {
        let sink = RecordingSink::default();
        let mut body = match DocumentValue::from(json!({"content": {"images": {"x": png(b"x")}}})) {
            DocumentValue::Map(m) => m,
            _ => unreachable!(),
        };

        let outcome = transform_document(&mut body, &RuleSet::site_content(), &sink);

        assert!(outcome.changed);
        assert!(body.contains_key("content"));
    }
}
