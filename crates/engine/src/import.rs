//! One-shot import of an external JSON export into the document store.
//!
//! Each collection comes from `<dir>/<collection>.json`, a JSON array of
//! objects. Documents are normalized before insert and, by default, replace
//! whatever the collection held before. A replacement that fails leaves the
//! old documents in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use unembed_protocol::ImportReport;

use crate::clock::{Clock, SystemClock};
use crate::document::DocumentValue;
use crate::normalize::Normalizer;
use crate::store::{DocumentStore, StoreError};

/// Collections read by `import_dir` when none are named.
pub const DEFAULT_IMPORT_COLLECTIONS: &[&str] =
    &["products", "customers", "orders", "categories", "subcategories"];

pub const SKIPPED_MISSING_FILE: &str = "file not found";
pub const SKIPPED_EMPTY: &str = "no documents";

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: element {index} is a {kind}, expected an object")]
    NotAnObject {
        path: PathBuf,
        index: usize,
        kind: &'static str,
    },

    #[error("failed to import {collection}: {source}")]
    Store {
        collection: String,
        #[source]
        source: StoreError,
    },
}

pub struct Importer<'a> {
    store: &'a dyn DocumentStore,
    clock: Arc<dyn Clock>,
    replace: bool,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            replace: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Drop the collection before inserting. On by default.
    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn import_file(&self, collection: &str, path: &Path) -> Result<ImportReport, ImportError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(
                    component = "import",
                    event = "import.skipped",
                    collection = %collection,
                    path = %path.display(),
                    reason = SKIPPED_MISSING_FILE,
                    "Skipping collection"
                );
                return Ok(skipped(collection, SKIPPED_MISSING_FILE));
            }
            Err(source) => {
                return Err(ImportError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let values: Vec<serde_json::Value> =
            serde_json::from_str(&raw).map_err(|source| ImportError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if values.is_empty() {
            info!(
                component = "import",
                event = "import.skipped",
                collection = %collection,
                reason = SKIPPED_EMPTY,
                "Skipping collection"
            );
            return Ok(skipped(collection, SKIPPED_EMPTY));
        }

        let mut normalizer = Normalizer::new(self.clock.as_ref());
        let mut docs = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            match DocumentValue::from(value) {
                DocumentValue::Map(map) => docs.push(normalizer.normalize(map)),
                other => {
                    return Err(ImportError::NotAnObject {
                        path: path.to_path_buf(),
                        index,
                        kind: other.kind(),
                    })
                }
            }
        }

        let store_err = |source| ImportError::Store {
            collection: collection.to_string(),
            source,
        };
        let ids = if self.replace {
            let (dropped, ids) = self
                .store
                .replace_collection(collection, docs)
                .map_err(store_err)?;
            if dropped > 0 {
                info!(
                    component = "import",
                    event = "import.collection_dropped",
                    collection = %collection,
                    dropped,
                    "Dropped existing documents"
                );
            }
            ids
        } else {
            self.store.insert_many(collection, docs).map_err(store_err)?
        };

        info!(
            component = "import",
            event = "import.collection_imported",
            collection = %collection,
            imported = ids.len(),
            "Imported collection"
        );
        Ok(ImportReport {
            collection: collection.to_string(),
            imported: ids.len() as u64,
            skipped: None,
        })
    }

    /// Import `<dir>/<name>.json` for each collection. A failure is reported
    /// for that collection only.
    pub fn import_dir(
        &self,
        dir: &Path,
        collections: &[&str],
    ) -> Vec<Result<ImportReport, ImportError>> {
        collections
            .iter()
            .map(|collection| {
                let path = dir.join(format!("{collection}.json"));
                let result = self.import_file(collection, &path);
                if let Err(e) = &result {
                    warn!(
                        component = "import",
                        event = "import.collection_failed",
                        collection = %collection,
                        error = %e,
                        "Collection import failed"
                    );
                }
                result
            })
            .collect()
    }
}

fn skipped(collection: &str, reason: &str) -> ImportReport {
    ImportReport {
        collection: collection.to_string(),
        imported: 0,
        skipped: Some(reason.to_string()),
    }
}
