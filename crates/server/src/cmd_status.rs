//! `unembed status`: report database contents and extracted media.

use std::fs;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::migration_runner;
use crate::paths::Locations;
use crate::persistence;
use crate::VERSION;

pub fn run(locations: &Locations) -> anyhow::Result<()> {
    println!();
    println!("  unembed v{}", VERSION);
    println!("  Data dir: {}", locations.data_dir.display());

    let db_path = &locations.database;
    if db_path.exists() {
        let size = fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
        println!("  Database: {} ({} KB)", db_path.display(), size / 1024);

        // Read-only: reporting never creates or migrates the schema.
        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        match migration_runner::current_version(&conn) {
            Ok(Some(version)) => {
                println!("  Schema version: {}", version);
                print_counts(&persistence::collection_counts(&conn)?);
            }
            _ => println!("  Schema version: none (run `unembed init`)"),
        }
    } else {
        println!("  Database: not found");
    }

    let (files, bytes) = dir_usage(&locations.uploads_dir);
    println!(
        "  Uploads: {} ({} file(s), {} KB)",
        locations.uploads_dir.display(),
        files,
        bytes / 1024
    );
    println!("  Log file: {}", locations.log_file().display());
    println!();

    Ok(())
}

fn print_counts(counts: &[(String, u64)]) {
    if counts.is_empty() {
        println!("  Collections: none");
    } else {
        println!("  Collections:");
        for (name, count) in counts {
            println!("    {:<16} {} document(s)", name, count);
        }
    }
}

/// File count and total size of the regular files directly inside `dir`.
fn dir_usage(dir: &Path) -> (u64, u64) {
    let Ok(entries) = fs::read_dir(dir) else {
        return (0, 0);
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .fold((0, 0), |(files, bytes), m| (files + 1, bytes + m.len()))
}
