//! Core types shared across the protocol

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Statistics for one migration run over a collection.
///
/// Item-level failures (a bad data URI, a blob that could not be written, a
/// document that could not be replaced) are data, collected in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStats {
    /// Documents fetched from the cursor.
    pub processed: u64,
    /// Documents that changed and were written back successfully.
    pub migrated: u64,
    /// Blobs extracted to the sink.
    #[serde(default)]
    pub extracted: u64,
    pub errors: Vec<String>,
    /// The run stopped early because cancellation was requested.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    /// The run stopped early because the cursor failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl MigrationStats {
    /// True when every document was visited without the run ending early.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.aborted.is_none()
    }
}

/// Body of `POST /api/migrations/{collection}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrateRequest {
    /// Top-level field equalities every migrated document must satisfy.
    #[serde(default)]
    pub filter: BTreeMap<String, serde_json::Value>,
}

/// Outcome of importing one collection from an export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub collection: String,
    pub imported: u64,
    /// Why nothing was imported, when the import was a no-op.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

/// Standard response envelope for the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
