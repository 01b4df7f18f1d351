//! unembed
//!
//! Moves inline base64 media out of stored documents into an uploads
//! directory and rewrites the documents to reference the extracted files.

mod api;
mod auth;
mod cmd_import;
mod cmd_init;
mod cmd_migrate;
mod cmd_status;
mod logging;
mod migration_runner;
mod paths;
mod persistence;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use unembed_engine::blob::DEFAULT_PUBLIC_PREFIX;

use crate::cmd_import::ImportOptions;
use crate::cmd_migrate::MigrateOptions;
use crate::persistence::SqliteStore;
use crate::state::AppState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_BIND: &str = "127.0.0.1:4100";

#[derive(Parser)]
#[command(
    name = "unembed",
    version,
    about = "Move inline base64 media out of stored documents"
)]
struct Cli {
    /// Data directory [env: UNEMBED_DATA_DIR] [default: ~/.unembed]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// SQLite document database [env: UNEMBED_DATABASE] [default: <data-dir>/unembed.db]
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Where extracted media is written [env: UNEMBED_UPLOADS_DIR] [default: <data-dir>/uploads]
    #[arg(long, global = true)]
    uploads_dir: Option<PathBuf>,

    /// Prefix of the public path written back into documents
    #[arg(long, global = true, env = "UNEMBED_PUBLIC_PREFIX", default_value = DEFAULT_PUBLIC_PREFIX)]
    public_prefix: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory and initialize the database
    Init,

    /// Serve the migration API over HTTP
    Start {
        /// Address to listen on
        #[arg(long, env = "UNEMBED_BIND", default_value = DEFAULT_BIND)]
        bind: SocketAddr,

        /// Require `Authorization: Bearer <token>` on /api routes
        #[arg(long, env = "UNEMBED_AUTH_TOKEN")]
        auth_token: Option<String>,

        /// Extra extraction path pattern, e.g. `gallery[*].src` (repeatable)
        #[arg(long = "rule", value_name = "PATTERN")]
        rules: Vec<String>,
    },

    /// Extract embedded media from one collection
    Migrate {
        /// Collection to migrate
        #[arg(default_value = "metadata")]
        collection: String,

        /// Only migrate documents where FIELD equals VALUE (repeatable)
        #[arg(long = "where", value_name = "FIELD=VALUE")]
        filters: Vec<String>,

        /// Extra extraction path pattern, e.g. `gallery[*].src` (repeatable)
        #[arg(long = "rule", value_name = "PATTERN")]
        rules: Vec<String>,

        /// Leave `updatedAt` alone on rewritten documents
        #[arg(long)]
        no_touch: bool,

        /// Print the statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Import `<collection>.json` files from an export directory
    Import {
        /// Directory holding the export files
        dir: PathBuf,

        /// Collection to import (repeatable) [default: products, customers, orders, categories, subcategories]
        #[arg(long = "collection", value_name = "NAME")]
        collections: Vec<String>,

        /// Add to existing collections instead of replacing them
        #[arg(long)]
        keep_existing: bool,
    },

    /// Show database contents and extracted media
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let locations = paths::Locations::resolve(paths::Overrides {
        data_dir: cli.data_dir.as_deref(),
        database: cli.database.as_deref(),
        uploads_dir: cli.uploads_dir.as_deref(),
    })?;

    match cli.command {
        Command::Init => cmd_init::run(&locations),
        Command::Status => cmd_status::run(&locations),
        command => {
            locations.ensure_dirs()?;
            let _logging = logging::init_logging(&locations.log_dir())?;
            info!(
                component = "cli",
                event = "cli.started",
                version = VERSION,
                database = %locations.database.display(),
                "Starting"
            );
            let store = SqliteStore::open(&locations.database)?;
            let sink = cmd_migrate::blob_sink(&locations.uploads_dir, &cli.public_prefix);

            match command {
                Command::Start {
                    bind,
                    auth_token,
                    rules,
                } => {
                    let rules = cmd_migrate::rule_set(&rules)?;
                    let state = AppState::new(Arc::new(store), Arc::new(sink), rules);
                    serve(state, bind, auth_token).await
                }
                Command::Migrate {
                    collection,
                    filters,
                    rules,
                    no_touch,
                    json,
                } => {
                    let stats = cmd_migrate::run(
                        store,
                        sink,
                        MigrateOptions {
                            collection,
                            filters,
                            extra_rules: rules,
                            touch_updated_at: !no_touch,
                            json,
                        },
                    )
                    .await?;
                    if let Some(reason) = stats.aborted {
                        anyhow::bail!("migration aborted: {reason}");
                    }
                    Ok(())
                }
                Command::Import {
                    dir,
                    collections,
                    keep_existing,
                } => cmd_import::run(
                    &store,
                    &dir,
                    ImportOptions {
                        collections,
                        keep_existing,
                    },
                )
                .map(|_| ()),
                Command::Init | Command::Status => Ok(()),
            }
        }
    }
}

async fn serve(state: AppState, bind: SocketAddr, auth_token: Option<String>) -> anyhow::Result<()> {
    let authenticated = auth_token.is_some();
    let app = api::router(state, auth_token);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %bind,
        authenticated,
        version = VERSION,
        "Listening"
    );
    println!("  unembed v{} listening on http://{}", VERSION, bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(
                component = "server",
                event = "server.shutdown",
                "Shutting down"
            );
        })
        .await?;

    Ok(())
}
