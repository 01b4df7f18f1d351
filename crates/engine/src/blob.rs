//! Blob sink: writes extracted binaries under unique names and hands back public references.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_PUBLIC_PREFIX: &str = "/uploads";

pub const MIN_SUFFIX_BYTES: usize = 8;
pub const MAX_SUFFIX_BYTES: usize = 16;

/// Longest sanitized prefix kept in a generated name.
pub const MAX_PREFIX_LEN: usize = 64;

const NAME_ATTEMPTS: usize = 4;
const BLOB_MODE: u32 = 0o644;

/// Stable pointer to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobReference {
    /// File name inside the sink.
    pub name: String,
    /// Path a client resolves, e.g. `/uploads/logo-3f2a….png`.
    pub public_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("failed to create blob directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write blob {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read blob {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob name: {0}")]
    InvalidName(String),

    #[error("system random source unavailable")]
    Random,

    #[error("no unused blob name after {0} attempts")]
    NameCollision(usize),
}

/// Append-only storage for extracted binaries.
pub trait BlobSink: Send + Sync {
    /// Store `bytes` under a fresh name derived from `prefix` and `ext`.
    /// Never overwrites an existing blob.
    fn store(&self, prefix: &str, bytes: &[u8], ext: &str) -> Result<BlobReference, BlobError>;

    fn read(&self, name: &str) -> Result<Vec<u8>, BlobError>;
}

/// Blob sink backed by a plain directory served elsewhere under `public_prefix`.
#[derive(Debug, Clone)]
pub struct DirectoryBlobSink {
    dir: PathBuf,
    public_prefix: String,
    suffix_bytes: usize,
    rng: SystemRandom,
}

impl DirectoryBlobSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            public_prefix: DEFAULT_PUBLIC_PREFIX.to_string(),
            suffix_bytes: MIN_SUFFIX_BYTES,
            rng: SystemRandom::new(),
        }
    }

    /// A relative prefix is anchored at `/` so rewritten references always
    /// read as already resolved on later runs.
    pub fn with_public_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim().trim_end_matches('/');
        let anchored = prefix.is_empty() || prefix.starts_with('/') || prefix.contains("://");
        self.public_prefix = if anchored {
            prefix.to_string()
        } else {
            format!("/{prefix}")
        };
        self
    }

    /// Random bytes per name, clamped to 8..=16.
    pub fn with_suffix_bytes(mut self, n: usize) -> Self {
        self.suffix_bytes = n.clamp(MIN_SUFFIX_BYTES, MAX_SUFFIX_BYTES);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn public_prefix(&self) -> &str {
        &self.public_prefix
    }

    fn generate_name(&self, prefix: &str, ext: &str) -> Result<String, BlobError> {
        let mut random = [0u8; MAX_SUFFIX_BYTES];
        let random = &mut random[..self.suffix_bytes];
        self.rng.fill(random).map_err(|_| BlobError::Random)?;

        let mut name = sanitize_prefix(prefix);
        name.push('-');
        for byte in random.iter() {
            let _ = write!(name, "{byte:02x}");
        }
        name.push_str(ext);
        Ok(name)
    }

    fn reference(&self, name: String) -> BlobReference {
        BlobReference {
            public_path: format!("{}/{}", self.public_prefix, name),
            name,
        }
    }
}

impl BlobSink for DirectoryBlobSink {
    fn store(&self, prefix: &str, bytes: &[u8], ext: &str) -> Result<BlobReference, BlobError> {
        fs::create_dir_all(&self.dir).map_err(|source| BlobError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        for _ in 0..NAME_ATTEMPTS {
            let name = self.generate_name(prefix, ext)?;
            let path = self.dir.join(&name);

            let mut file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(BLOB_MODE)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(
                        component = "blob",
                        event = "blob.name_collision",
                        name = %name,
                        "Generated blob name already exists, retrying"
                    );
                    continue;
                }
                Err(source) => return Err(BlobError::Write { name, source }),
            };

            // umask may have narrowed the create mode
            let written = file
                .write_all(bytes)
                .and_then(|()| file.set_permissions(Permissions::from_mode(BLOB_MODE)))
                .and_then(|()| file.sync_all());
            if let Err(source) = written {
                drop(file);
                let _ = fs::remove_file(&path);
                return Err(BlobError::Write { name, source });
            }

            debug!(
                component = "blob",
                event = "blob.stored",
                name = %name,
                bytes = bytes.len(),
                "Stored blob"
            );
            return Ok(self.reference(name));
        }

        Err(BlobError::NameCollision(NAME_ATTEMPTS))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(BlobError::InvalidName(name.to_string()));
        }

        fs::read(self.dir.join(name)).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                BlobError::NotFound(name.to_string())
            } else {
                BlobError::Read {
                    name: name.to_string(),
                    source,
                }
            }
        })
    }
}

/// Make a human-readable prefix safe to use in a file name. The result is
/// ASCII and at most `MAX_PREFIX_LEN` characters.
pub fn sanitize_prefix(prefix: &str) -> String {
    let safe: String = prefix
        .trim()
        .chars()
        .take(MAX_PREFIX_LEN)
        .map(|c| {
            if c.is_whitespace() {
                '-'
            } else if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    if safe.is_empty() {
        "blob".to_string()
    } else {
        safe
    }
}
