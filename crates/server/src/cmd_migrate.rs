//! `unembed migrate`: run one extraction pass over a collection.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use unembed_engine::{
    BlobSink, CancelFlag, DirectoryBlobSink, DocumentStore, DocumentValue, ExtractionRule, Filter,
    Orchestrator, PathPattern, RuleSet,
};
use unembed_protocol::MigrationStats;

use crate::persistence::SqliteStore;

pub struct MigrateOptions {
    pub collection: String,
    pub filters: Vec<String>,
    pub extra_rules: Vec<String>,
    pub touch_updated_at: bool,
    pub json: bool,
}

/// The built-in site-content rules followed by any patterns given with `--rule`.
pub fn rule_set(extra: &[String]) -> anyhow::Result<RuleSet> {
    let mut rules = RuleSet::site_content();
    for raw in extra {
        let pattern: PathPattern = raw
            .parse()
            .with_context(|| format!("invalid --rule pattern {raw:?}"))?;
        rules.push(ExtractionRule::new(raw.clone(), pattern));
    }
    Ok(rules)
}

/// Parse `field=value` pairs into a filter. Values that parse as JSON keep
/// their type (`active=true`), anything else is a string.
pub fn parse_filter(pairs: &[String]) -> anyhow::Result<Filter> {
    let mut filter = Filter::all();
    for pair in pairs {
        let (field, raw) = pair
            .split_once('=')
            .filter(|(field, _)| !field.trim().is_empty())
            .with_context(|| format!("expected FIELD=VALUE, got {pair:?}"))?;
        let value = serde_json::from_str::<serde_json::Value>(raw)
            .map(DocumentValue::from)
            .unwrap_or_else(|_| DocumentValue::from(raw));
        filter = filter.eq(field.trim(), value);
    }
    Ok(filter)
}

pub fn blob_sink(uploads_dir: &Path, public_prefix: &str) -> DirectoryBlobSink {
    DirectoryBlobSink::new(uploads_dir).with_public_prefix(public_prefix)
}

pub async fn run(
    store: SqliteStore,
    sink: DirectoryBlobSink,
    options: MigrateOptions,
) -> anyhow::Result<MigrationStats> {
    let rules = rule_set(&options.extra_rules)?;
    let filter = parse_filter(&options.filters)?;

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let store: Arc<dyn DocumentStore> = Arc::new(store);
    let sink: Arc<dyn BlobSink> = Arc::new(sink);
    let collection = options.collection.clone();
    let touch = options.touch_updated_at;
    let stats = tokio::task::spawn_blocking(move || {
        Orchestrator::new(store.as_ref(), sink.as_ref(), &rules)
            .with_cancel(cancel)
            .touch_updated_at(touch)
            .run(&collection, &filter)
    })
    .await??;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&options.collection, &stats);
    }
    Ok(stats)
}

fn print_stats(collection: &str, stats: &MigrationStats) {
    println!();
    println!("  Collection: {}", collection);
    println!("  Processed:  {}", stats.processed);
    println!("  Migrated:   {}", stats.migrated);
    println!("  Extracted:  {} blob(s)", stats.extracted);
    if stats.cancelled {
        println!("  Cancelled before the end of the collection.");
    }
    if let Some(reason) = &stats.aborted {
        println!("  Aborted: {}", reason);
    }
    if !stats.errors.is_empty() {
        println!();
        println!("  Errors ({}):", stats.errors.len());
        for error in &stats.errors {
            println!("    - {}", error);
        }
    }
    println!();
}
