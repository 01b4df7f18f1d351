//! Embedded media migration engine.
//!
//! Walks schema-less documents, moves inline `data:image/...;base64,` payloads
//! into a blob sink and rewrites the documents to point at the stored files.
//! Also carries the normalization used when importing an external export.

pub mod blob;
pub mod clock;
pub mod data_uri;
pub mod document;
pub mod extract;
pub mod import;
pub mod normalize;
pub mod orchestrator;
pub mod rules;
pub mod store;
pub mod walker;

pub use blob::{BlobError, BlobReference, BlobSink, DirectoryBlobSink};
pub use clock::{Clock, FixedClock, SystemClock};
pub use data_uri::{DataUri, DecodeError};
pub use document::{DocPath, DocumentValue, Map, PathSegment};
pub use extract::{transform, transform_document, ExtractError, TransformOutcome};
pub use import::{ImportError, Importer, DEFAULT_IMPORT_COLLECTIONS};
pub use normalize::{normalize, Normalizer};
pub use orchestrator::{CancelFlag, MigrationError, Orchestrator, RunPhase};
pub use rules::{ExtractionRule, PathPattern, PatternError, RuleSet};
pub use store::{
    CursorGuard, DocumentCursor, DocumentStore, Filter, MemoryStore, StoreError, StoredDocument,
};
pub use unembed_protocol::{ImportReport, MigrationStats};
