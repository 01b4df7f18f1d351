//! `unembed import`: load an external JSON export into the document store.

use std::path::Path;

use unembed_engine::{ImportReport, Importer, DEFAULT_IMPORT_COLLECTIONS};

use crate::persistence::SqliteStore;

pub struct ImportOptions {
    pub collections: Vec<String>,
    pub keep_existing: bool,
}

/// Returns the reports of the collections that imported; fails if any did not.
pub fn run(store: &SqliteStore, dir: &Path, options: ImportOptions) -> anyhow::Result<Vec<ImportReport>> {
    if !dir.is_dir() {
        anyhow::bail!("export directory {} does not exist", dir.display());
    }

    let names: Vec<&str> = if options.collections.is_empty() {
        DEFAULT_IMPORT_COLLECTIONS.to_vec()
    } else {
        options.collections.iter().map(String::as_str).collect()
    };

    let importer = Importer::new(store).replace_existing(!options.keep_existing);
    let results = importer.import_dir(dir, &names);

    println!();
    println!("  Importing from {}", dir.display());
    let mut reports = Vec::new();
    let mut failed = 0;
    for (name, result) in names.iter().zip(results) {
        match result {
            Ok(report) => {
                match &report.skipped {
                    Some(reason) => println!("  {:<16} skipped ({})", name, reason),
                    None => println!("  {:<16} {} document(s)", name, report.imported),
                }
                reports.push(report);
            }
            Err(e) => {
                println!("  {:<16} failed: {}", name, e);
                failed += 1;
            }
        }
    }
    println!();

    if failed > 0 {
        anyhow::bail!("{failed} collection(s) failed to import");
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use unembed_engine::DocumentStore;

    #[test]
    fn imports_named_collections() {
        let tmp = tempfile::tempdir().unwrap();
        let export = tmp.path().join("export");
        std::fs::create_dir_all(&export).unwrap();
        std::fs::write(
            export.join("products.json"),
            r#"[{"id": 1, "name": "Tea", "createdAt": "2024-01-01T00:00:00Z"}]"#,
        )
        .unwrap();
        let store = SqliteStore::open(tmp.path().join("unembed.db")).unwrap();

        let reports = run(
            &store,
            &export,
            ImportOptions {
                collections: vec!["products".to_string(), "orders".to_string()],
                keep_existing: false,
            },
        )
        .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].imported, 1);
        assert_eq!(reports[1].skipped.as_deref(), Some("file not found"));
        assert_eq!(store.count("products").unwrap(), 1);
    }

    #[test]
    fn failing_collection_fails_the_command() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("orders.json"), "not json").unwrap();
        let store = SqliteStore::open(tmp.path().join("unembed.db")).unwrap();

        let err = run(
            &store,
            tmp.path(),
            ImportOptions {
                collections: vec!["orders".to_string()],
                keep_existing: false,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("1 collection(s) failed"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(tmp.path().join("unembed.db")).unwrap();
        assert!(run(
            &store,
            &tmp.path().join("nope"),
            ImportOptions {
                collections: Vec::new(),
                keep_existing: false,
            },
        )
        .is_err());
    }
}
