//! Central path resolution for all unembed data files.
//!
//! Each location comes from: CLI flag > environment variable > default under
//! the data dir (`~/.unembed`). Callsites use these helpers instead of
//! constructing paths themselves.

use std::io;
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "UNEMBED_DATA_DIR";
pub const DATABASE_ENV: &str = "UNEMBED_DATABASE";
pub const UPLOADS_DIR_ENV: &str = "UNEMBED_UPLOADS_DIR";

pub const LOG_FILE_NAME: &str = "unembed.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub uploads_dir: PathBuf,
}

/// Explicit locations from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides<'a> {
    pub data_dir: Option<&'a Path>,
    pub database: Option<&'a Path>,
    pub uploads_dir: Option<&'a Path>,
}

impl Locations {
    pub fn resolve(overrides: Overrides<'_>) -> anyhow::Result<Self> {
        let data_dir = match pick(overrides.data_dir, DATA_DIR_ENV) {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("HOME directory not found; pass --data-dir"))?
                .join(".unembed"),
        };
        let database =
            pick(overrides.database, DATABASE_ENV).unwrap_or_else(|| data_dir.join("unembed.db"));
        let uploads_dir =
            pick(overrides.uploads_dir, UPLOADS_DIR_ENV).unwrap_or_else(|| data_dir.join("uploads"));

        Ok(Self {
            data_dir,
            database,
            uploads_dir,
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join(LOG_FILE_NAME)
    }

    /// Create every directory the binary writes into.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.log_dir())?;
        std::fs::create_dir_all(&self.uploads_dir)?;
        if let Some(parent) = self.database.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

fn pick(explicit: Option<&Path>, env: &str) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        std::env::var_os(env)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
}
