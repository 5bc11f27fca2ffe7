//! Runs composed ranked queries and renders the results.
//!
//! `docsync most-viewed` and `docsync most-cited` print a table to stdout
//! (or one JSON object per row with `--json`), preceded by the total match
//! count from the derived count query.

use indexmap::IndexMap;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row};
use tracing::{error, warn};

use crate::config::SourcesConfig;
use crate::error::Result;
use crate::query::{Bind, RankedQuery, RankedQuerySpec, ReportFamily};
use crate::relational::RelationalStore;

/// One result row, columns in projection order.
pub type RankedRow = IndexMap<String, Value>;

#[derive(Debug, Clone)]
pub struct RankedReport {
    pub family: ReportFamily,
    /// Matches before limit/offset.
    pub total: i64,
    pub rows: Vec<RankedRow>,
}

pub async fn run(
    store: &RelationalStore,
    spec: &RankedQuerySpec,
    sources: &SourcesConfig,
) -> Result<RankedReport> {
    let query = spec.build(sources)?;
    let rows = fetch_rows(store, &query).await?;
    let total = count(store, &query).await;
    if total == 0 {
        warn!(report = ?spec.family, "no records matched");
    }
    Ok(RankedReport {
        family: spec.family,
        total,
        rows,
    })
}

pub async fn fetch_rows(store: &RelationalStore, query: &RankedQuery) -> Result<Vec<RankedRow>> {
    let mut conn = store.acquire().await?;
    let mut q = sqlx::query(&query.sql);
    for bind in &query.binds {
        q = match bind {
            Bind::Text(s) => q.bind(s.as_str()),
            Bind::Int(n) => q.bind(*n),
        };
    }
    let rows = q.fetch_all(&mut *conn).await?;
    Ok(rows.iter().map(decode_row).collect())
}

/// Total matches; an unreachable store reads as zero.
pub async fn count(store: &RelationalStore, query: &RankedQuery) -> i64 {
    try_count(store, query).await.unwrap_or_else(|e| {
        error!(error = %e, "count query failed");
        0
    })
}

async fn try_count(store: &RelationalStore, query: &RankedQuery) -> Result<i64> {
    let mut conn = store.acquire().await?;
    let mut q = sqlx::query_scalar::<_, i64>(&query.count_sql);
    for bind in &query.count_binds {
        q = match bind {
            Bind::Text(s) => q.bind(s.as_str()),
            Bind::Int(n) => q.bind(*n),
        };
    }
    Ok(q.fetch_one(&mut *conn).await?)
}

fn decode_row(row: &SqliteRow) -> RankedRow {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), decode_value(row, col.ordinal())))
        .collect()
}

fn decode_value(row: &SqliteRow, i: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    row.try_get::<Option<String>, _>(i)
        .ok()
        .flatten()
        .map(Value::from)
        .unwrap_or(Value::Null)
}

fn cell(row: &RankedRow, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(v) => v.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

pub fn print_table(report: &RankedReport) {
    let counts: &[&str] = match report.family {
        ReportFamily::MostViewed => &["lastweek", "lastmonth", "last6months", "last12months", "lastcalyear"],
        ReportFamily::MostCited => &["count5", "count10", "count20", "countAll"],
    };

    println!(
        "{}: {} matching documents",
        match report.family {
            ReportFamily::MostViewed => "Most viewed",
            ReportFamily::MostCited => "Most cited",
        },
        report.total
    );
    println!();
    let header: Vec<String> = counts.iter().map(|c| format!("{:>12}", c)).collect();
    println!("  {:<18} {:<40} {}", "DOCUMENT", "CITATION", header.join(""));
    println!("  {}", "-".repeat(60 + 12 * counts.len()));
    for row in &report.rows {
        let values: Vec<String> = counts
            .iter()
            .map(|c| format!("{:>12}", cell(row, c)))
            .collect();
        println!(
            "  {:<18} {:<40} {}",
            cell(row, "document_id"),
            truncate(&cell(row, "textref"), 40),
            values.join("")
        );
    }
    println!();
}

pub fn print_json(report: &RankedReport) -> Result<()> {
    for row in &report.rows {
        println!("{}", serde_json::to_string(row)?);
    }
    Ok(())
}
