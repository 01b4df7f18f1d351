//! `unembed init`: bootstrap a fresh data directory.
//!
//! Creates the directory layout, initializes the document database and
//! prints next-steps guidance.

use crate::paths::Locations;
use crate::persistence::SqliteStore;

pub fn run(locations: &Locations) -> anyhow::Result<()> {
    println!();

    locations.ensure_dirs()?;
    println!("  Created {}/", locations.data_dir.display());

    let store = SqliteStore::open(&locations.database)?;
    println!("  Database initialized at {}", store.db_path().display());
    println!("  Extracted media goes to {}/", locations.uploads_dir.display());
    println!("  Logs are written to {}", locations.log_file().display());

    println!();
    println!("  Next steps:");
    println!("    1. Import an export:      unembed import <dir>");
    println!("    2. Migrate a collection:  unembed migrate metadata --where type=retail");
    println!("    3. Or serve the API:      unembed start --auth-token <token>");
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Overrides;

    #[test]
    fn creates_layout_and_database() {
        let tmp = tempfile::tempdir().unwrap();
        let locations = Locations::resolve(Overrides {
            data_dir: Some(tmp.path()),
            ..Default::default()
        })
        .unwrap();

        run(&locations).unwrap();
        run(&locations).unwrap();

        assert!(tmp.path().join("unembed.db").is_file());
        assert!(tmp.path().join("uploads").is_dir());
        assert!(tmp.path().join("logs").is_dir());
    }
}
