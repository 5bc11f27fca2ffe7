//! Store statistics overview.
//!
//! Summarizes what is loaded: tracked documents, articles, references and
//! views in the relational store, and committed documents per index core.
//! Used by `docsync stats` to confirm loads are landing in both stores.

use crate::config::Config;
use crate::error::Result;
use crate::index::{Core, IndexQuery, SearchIndex};
use crate::relational::{RelationalStore, StoreCounts};

#[derive(Debug, Clone, Default)]
pub struct StatsReport {
    pub store: StoreCounts,
    pub db_size: u64,
    pub index_size: u64,
    /// Committed documents per core, in [`Core::ALL`] order.
    pub cores: Vec<(Core, usize)>,
}

pub async fn collect(
    config: &Config,
    relational: &RelationalStore,
    index: &dyn SearchIndex,
) -> Result<StatsReport> {
    let store = relational.counts().await?;
    let mut cores = Vec::with_capacity(Core::ALL.len());
    for core in Core::ALL {
        let docs = index.query(core, &IndexQuery::all()).await?;
        cores.push((core, docs.len()));
    }
    Ok(StatsReport {
        store,
        db_size: file_size(&config.db.path),
        index_size: file_size(&config.index.path),
        cores,
    })
}

fn file_size(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

pub fn print(config: &Config, report: &StatsReport) {
    println!("docsync stats");
    println!("=============");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(report.db_size));
    println!("  Index:       {}", config.index.path.display());
    println!("  Size:        {}", format_bytes(report.index_size));
    println!();
    println!("  Tracked:     {}", report.store.tracked);
    println!("  Articles:    {}", report.store.articles);
    println!("  References:  {}", report.store.references);
    println!("  Views:       {}", report.store.views);
    println!();
    println!("  {:<12} {:>10}", "CORE", "DOCS");
    println!("  {}", "-".repeat(23));
    for (core, n) in &report.cores {
        println!("  {:<12} {:>10}", core.name(), n);
    }
    println!();
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
