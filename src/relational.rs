//! Relational store access.
//!
//! Every method acquires a pooled connection for the duration of one
//! operation or one unit of work and releases it on every exit path (the
//! connection is returned to the pool when dropped). The number of
//! acquisitions is counted per store so a run can report it without any
//! process-wide state.

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{Row, Sqlite, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::config::Config;
use crate::db;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{ArticleMetadata, DocumentRecord, IssueKey, ReferenceEntry, SectionKey};

pub struct RelationalStore {
    pool: SqlitePool,
    connections: AtomicU64,
}

/// A tracked article as needed by the issue-update report.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedArticle {
    pub art_id: String,
    pub issue_key: IssueKey,
    pub citeas_xml: String,
}

/// Row counts for the stats overview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub tracked: i64,
    pub articles: i64,
    pub references: i64,
    pub views: i64,
}

impl RelationalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            connections: AtomicU64::new(0),
        }
    }

    /// Connect to `[db]` and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Connections acquired through this store so far.
    pub fn connections_opened(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        let conn = self.pool.acquire().await?;
        self.connections.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Insert the tracking row. Returns true when the document was not
    /// tracked before.
    pub async fn track_document(&self, art_id: &str) -> Result<bool> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO article_tracker (art_id, date_inserted) VALUES (?, datetime('now'))",
        )
        .bind(art_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn tracked(&self, art_id: &str) -> Result<Option<DocumentRecord>> {
        let mut conn = self.acquire().await?;
        let found: Option<String> =
            sqlx::query_scalar("SELECT date_inserted FROM article_tracker WHERE art_id = ?")
                .bind(art_id)
                .fetch_optional(&mut *conn)
                .await?;
        found
            .map(|inserted| {
                let first_seen_at = NaiveDateTime::parse_from_str(&inserted, "%Y-%m-%d %H:%M:%S")
                    .map_err(|e| Error::Integrity(format!("tracking row {art_id}: {e}")))?
                    .and_utc();
                Ok(DocumentRecord {
                    logical_id: art_id.to_string(),
                    first_seen_at,
                })
            })
            .transpose()
    }

    pub async fn upsert_article(&self, meta: &ArticleMetadata) -> Result<()> {
        let mut conn = self.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO api_articles (art_id, src_code, art_year, art_vol, art_issue, art_pgrg,
                                      art_title, art_auth_citation, src_title_abbr,
                                      art_citeas_xml, art_citeas_text, start_sectname, art_type,
                                      file_classification, filename, filedatetime, file_size,
                                      ref_count, last_update)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(art_id) DO UPDATE SET
                src_code = excluded.src_code,
                art_year = excluded.art_year,
                art_vol = excluded.art_vol,
                art_issue = excluded.art_issue,
                art_pgrg = excluded.art_pgrg,
                art_title = excluded.art_title,
                art_auth_citation = excluded.art_auth_citation,
                src_title_abbr = excluded.src_title_abbr,
                art_citeas_xml = excluded.art_citeas_xml,
                art_citeas_text = excluded.art_citeas_text,
                start_sectname = excluded.start_sectname,
                art_type = excluded.art_type,
                file_classification = excluded.file_classification,
                filename = excluded.filename,
                filedatetime = excluded.filedatetime,
                file_size = excluded.file_size,
                ref_count = excluded.ref_count,
                last_update = excluded.last_update
            "#,
        )
        .bind(&meta.art_id)
        .bind(&meta.src_code)
        .bind(meta.year)
        .bind(&meta.vol)
        .bind(&meta.issue)
        .bind(&meta.page_range)
        .bind(&meta.title)
        .bind(meta.author_citation())
        .bind(&meta.src_title_abbr)
        .bind(&meta.citeas_xml)
        .bind(&meta.citeas_text)
        .bind(&meta.start_sectname)
        .bind(&meta.art_type)
        .bind(meta.file_classification.map(|c| c.as_str()))
        .bind(&meta.filename)
        .bind(crate::models::format_timestamp(&meta.file_timestamp))
        .bind(meta.file_size as i64)
        .bind(meta.ref_count as i64)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Per-document statistics, keyed by a SHA-256 of the compiled content.
    pub async fn upsert_artstat(
        &self,
        art_id: &str,
        word_count: usize,
        para_count: usize,
        ref_count: usize,
        content: &[u8],
    ) -> Result<()> {
        let hash = format!("{:x}", Sha256::digest(content));
        let mut conn = self.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO artstat (art_id, word_count, para_count, ref_count, content_hash, last_update)
            VALUES (?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(art_id) DO UPDATE SET
                word_count = excluded.word_count,
                para_count = excluded.para_count,
                ref_count = excluded.ref_count,
                content_hash = excluded.content_hash,
                last_update = excluded.last_update
            "#,
        )
        .bind(art_id)
        .bind(word_count as i64)
        .bind(para_count as i64)
        .bind(ref_count as i64)
        .bind(&hash)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Independent read of the first-in-section view.
    pub async fn is_first_in_section(&self, art_id: &str) -> Result<bool> {
        let mut conn = self.acquire().await?;
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM vw_article_firstsectnames WHERE art_id = ?")
                .bind(art_id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(found.is_some())
    }

    /// Every article claiming the section, lowest id first.
    pub async fn section_claimants(&self, key: &SectionKey) -> Result<Vec<String>> {
        let mut conn = self.acquire().await?;
        let ids = sqlx::query_scalar(
            r#"
            SELECT art_id FROM api_articles
            WHERE src_code = ?
              AND IFNULL(art_vol, '') = ?
              AND IFNULL(art_issue, '') = ?
              AND start_sectname = ?
            ORDER BY art_id
            "#,
        )
        .bind(&key.source_code)
        .bind(&key.volume)
        .bind(&key.issue)
        .bind(&key.name)
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }

    /// Write a document's references as one unit of work.
    ///
    /// A failing row is logged and skipped; the rest are still written.
    /// Returns the number of rows inserted.
    pub async fn insert_references(
        &self,
        art_id: &str,
        refs: &[ReferenceEntry],
        purge_first: bool,
    ) -> Result<usize> {
        let mut conn = self.acquire().await?;
        let mut tx = sqlx::Connection::begin(&mut *conn).await?;

        if purge_first {
            let purged = sqlx::query("DELETE FROM api_biblioxml WHERE art_id = ?")
                .bind(art_id)
                .execute(&mut *tx)
                .await?;
            debug!(id = art_id, rows = purged.rows_affected(), "purged references");
        }

        let mut written = 0;
        for entry in refs {
            let inserted = sqlx::query(
                r#"
                INSERT INTO api_biblioxml (art_id, bib_local_id, full_ref_xml, full_ref_text, bib_rx, last_update)
                VALUES (?, ?, ?, ?, ?, datetime('now'))
                "#,
            )
            .bind(art_id)
            .bind(&entry.local_id)
            .bind(&entry.xml)
            .bind(&entry.text)
            .bind(&entry.rx)
            .execute(&mut *tx)
            .await;
            match inserted {
                Ok(_) => written += 1,
                Err(e) => warn!(id = art_id, reference = %entry.local_id, error = %e, "reference insert failed"),
            }
        }

        tx.commit().await?;
        Ok(written)
    }

    pub async fn reference_count(&self, art_id: &str) -> Result<i64> {
        let mut conn = self.acquire().await?;
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM api_biblioxml WHERE art_id = ?")
            .bind(art_id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(n)
    }

    /// Articles first tracked within the last `days` days.
    pub async fn articles_newer_than(&self, days: u32) -> Result<Vec<TrackedArticle>> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT t.art_id, a.src_code, a.art_year, a.art_vol, a.art_issue, a.art_citeas_xml
            FROM article_tracker t
            JOIN api_articles a ON a.art_id = t.art_id
            WHERE t.date_inserted >= datetime('now', ?)
            ORDER BY t.art_id
            "#,
        )
        .bind(format!("-{} days", days))
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let vol: Option<String> = row.get("art_vol");
                let issue: Option<String> = row.get("art_issue");
                let citeas: Option<String> = row.get("art_citeas_xml");
                TrackedArticle {
                    art_id: row.get("art_id"),
                    issue_key: IssueKey {
                        source_code: row.get("src_code"),
                        year: row.get::<Option<i64>, _>("art_year").map(|y| y as i32),
                        volume: vol.unwrap_or_default(),
                        issue: issue.unwrap_or_default(),
                    },
                    citeas_xml: citeas.unwrap_or_default(),
                }
            })
            .collect())
    }

    pub async fn record_document_view(&self, document_id: &str, view_type: &str) -> Result<()> {
        let mut conn = self.acquire().await?;
        sqlx::query(
            "INSERT INTO api_docviews (document_id, view_type, datetimechar) VALUES (?, ?, datetime('now'))",
        )
        .bind(document_id)
        .bind(view_type)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Administrative reset of everything the loader writes. Views are kept.
    pub async fn delete_all_article_data(&self) -> Result<u64> {
        let mut conn = self.acquire().await?;
        let mut tx = sqlx::Connection::begin(&mut *conn).await?;
        let mut removed = 0;
        for table in ["api_biblioxml", "artstat", "api_articles", "article_tracker"] {
            removed += sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let mut conn = self.acquire().await?;
        let mut totals = [0i64; 4];
        for (slot, table) in totals.iter_mut().zip([
            "article_tracker",
            "api_articles",
            "api_biblioxml",
            "api_docviews",
        ]) {
            *slot = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&mut *conn)
                .await?;
        }
        let [tracked, articles, references, views] = totals;
        Ok(StoreCounts {
            tracked,
            articles,
            references,
            views,
        })
    }
}
