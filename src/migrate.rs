//! Relational schema.
//!
//! Tables are written by the loader; the `vw_*` views are read-only
//! projections used by the first-in-section check and the ranked reports.
//! Every statement is idempotent so `docsync init` can be re-run.

use sqlx::SqlitePool;

use crate::error::Result;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS article_tracker (
        art_id TEXT PRIMARY KEY,
        date_inserted TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_articles (
        art_id TEXT PRIMARY KEY,
        src_code TEXT NOT NULL,
        art_year INTEGER,
        art_vol TEXT,
        art_issue TEXT,
        art_pgrg TEXT,
        art_title TEXT,
        art_auth_citation TEXT,
        src_title_abbr TEXT,
        art_citeas_xml TEXT,
        art_citeas_text TEXT,
        start_sectname TEXT,
        art_type TEXT,
        file_classification TEXT,
        filename TEXT,
        filedatetime TEXT,
        file_size INTEGER NOT NULL DEFAULT 0,
        ref_count INTEGER NOT NULL DEFAULT 0,
        last_update TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artstat (
        art_id TEXT PRIMARY KEY,
        word_count INTEGER NOT NULL DEFAULT 0,
        para_count INTEGER NOT NULL DEFAULT 0,
        ref_count INTEGER NOT NULL DEFAULT 0,
        content_hash TEXT NOT NULL,
        last_update TEXT NOT NULL
    )
    "#,
    // No uniqueness on (art_id, bib_local_id): re-ingesting a changed
    // document appends unless loader.purge_references is set.
    r#"
    CREATE TABLE IF NOT EXISTS api_biblioxml (
        art_id TEXT NOT NULL,
        bib_local_id TEXT NOT NULL,
        full_ref_xml TEXT NOT NULL,
        full_ref_text TEXT NOT NULL,
        bib_rx TEXT,
        last_update TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_docviews (
        document_id TEXT NOT NULL,
        view_type TEXT NOT NULL DEFAULT 'Document',
        datetimechar TEXT NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_tracker_inserted ON article_tracker(date_inserted)",
    "CREATE INDEX IF NOT EXISTS idx_articles_section ON api_articles(src_code, art_vol, art_issue, start_sectname)",
    "CREATE INDEX IF NOT EXISTS idx_biblio_art_id ON api_biblioxml(art_id)",
    "CREATE INDEX IF NOT EXISTS idx_biblio_rx ON api_biblioxml(bib_rx)",
    "CREATE INDEX IF NOT EXISTS idx_docviews_document ON api_docviews(document_id)",
];

const VIEWS: &[&str] = &[
    r#"
    CREATE VIEW IF NOT EXISTS vw_article_firstsectnames AS
    SELECT MIN(art_id) AS art_id, src_code, art_vol, art_issue, start_sectname
    FROM api_articles
    WHERE start_sectname IS NOT NULL AND start_sectname != ''
    GROUP BY src_code, art_vol, art_issue, start_sectname
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS vw_stat_docviews_crosstab AS
    SELECT
        document_id,
        MAX(datetimechar) AS last_viewed,
        SUM(CASE WHEN datetimechar >= datetime('now', '-7 days') THEN 1 ELSE 0 END) AS lastweek,
        SUM(CASE WHEN datetimechar >= datetime('now', '-1 month') THEN 1 ELSE 0 END) AS lastmonth,
        SUM(CASE WHEN datetimechar >= datetime('now', '-6 months') THEN 1 ELSE 0 END) AS last6months,
        SUM(CASE WHEN datetimechar >= datetime('now', '-12 months') THEN 1 ELSE 0 END) AS last12months,
        SUM(CASE WHEN CAST(strftime('%Y', datetimechar) AS INTEGER)
                      = CAST(strftime('%Y', 'now') AS INTEGER) - 1 THEN 1 ELSE 0 END) AS lastcalyear
    FROM api_docviews
    GROUP BY document_id
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS vw_stat_most_viewed AS
    SELECT
        v.document_id AS document_id,
        v.last_viewed AS last_viewed,
        v.lastweek AS lastweek,
        v.lastmonth AS lastmonth,
        v.last6months AS last6months,
        v.last12months AS last12months,
        v.lastcalyear AS lastcalyear,
        a.art_auth_citation AS hdgauthor,
        a.art_title AS hdgtitle,
        a.src_title_abbr AS srctitleseries,
        a.src_code AS source_code,
        a.art_year AS pubyear,
        a.art_vol AS vol,
        a.art_issue AS issue,
        a.art_pgrg AS pgrg,
        a.art_citeas_text AS textref
    FROM vw_stat_docviews_crosstab v
    JOIN api_articles a ON a.art_id = v.document_id
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS vw_stat_cited_crosstab AS
    SELECT
        b.bib_rx AS cited_document_id,
        COUNT(DISTINCT CASE WHEN c.art_year >= CAST(strftime('%Y', 'now') AS INTEGER) - 5
                            THEN b.art_id || '/' || b.bib_local_id END) AS count5,
        COUNT(DISTINCT CASE WHEN c.art_year >= CAST(strftime('%Y', 'now') AS INTEGER) - 10
                            THEN b.art_id || '/' || b.bib_local_id END) AS count10,
        COUNT(DISTINCT CASE WHEN c.art_year >= CAST(strftime('%Y', 'now') AS INTEGER) - 20
                            THEN b.art_id || '/' || b.bib_local_id END) AS count20,
        COUNT(DISTINCT b.art_id || '/' || b.bib_local_id) AS countAll
    FROM api_biblioxml b
    JOIN api_articles c ON c.art_id = b.art_id
    WHERE b.bib_rx IS NOT NULL AND b.bib_rx != ''
    GROUP BY b.bib_rx
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS vw_stat_cited_crosstab_with_details AS
    SELECT
        x.cited_document_id AS document_id,
        x.count5 AS count5,
        x.count10 AS count10,
        x.count20 AS count20,
        x.countAll AS countAll,
        a.art_auth_citation AS hdgauthor,
        a.art_title AS hdgtitle,
        a.src_title_abbr AS srctitleseries,
        a.src_code AS source_code,
        a.art_year AS year,
        a.art_vol AS vol,
        a.art_pgrg AS pgrg,
        a.art_citeas_text AS textref
    FROM vw_stat_cited_crosstab x
    JOIN api_articles a ON a.art_id = x.cited_document_id
    "#,
];

/// Create all tables, indexes, and views on an already-open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for stmt in TABLES.iter().chain(INDEXES).chain(VIEWS) {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}
