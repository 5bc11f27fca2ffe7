//! SQLite-backed [`SearchIndex`].
//!
//! Each core gets a `core_<name>` table holding the document (fields as a
//! JSON object) and a `core_<name>_fts` FTS5 table over the text. Staged
//! writes are applied in a single transaction per commit.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use tracing::debug;

use super::{Core, IndexDocument, IndexQuery, PendingOp, SearchIndex, Staging};
use crate::db;
use crate::error::{Error, Result};

pub struct SqliteIndex {
    pool: SqlitePool,
    staging: Staging,
}

impl SqliteIndex {
    /// Open (creating if needed) the index database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path, 2).await?;
        let index = Self {
            pool,
            staging: Staging::default(),
        };
        index.ensure_schema().await?;
        Ok(index)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for core in Core::ALL {
            let table = table_name(core);
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    file_last_modified TEXT,
                    text TEXT NOT NULL DEFAULT '',
                    fields_json TEXT NOT NULL DEFAULT '{{}}'
                )"
            ))
            .execute(&self.pool)
            .await?;

            // FTS5 virtual tables don't support IF NOT EXISTS on every build.
            let fts = fts_name(core);
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(&fts)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                sqlx::query(&format!(
                    "CREATE VIRTUAL TABLE {fts} USING fts5(id UNINDEXED, text)"
                ))
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Apply `ops` in one transaction; an error rolls the whole batch back.
    async fn apply(&self, core: Core, ops: &[PendingOp]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                PendingOp::Upsert(doc) => apply_upsert(&mut tx, core, doc).await?,
                PendingOp::SetField { id, field, value } => {
                    apply_set_field(&mut tx, core, id, field, value.clone()).await?
                }
                PendingOp::Delete(query) => apply_delete(&mut tx, core, query).await?,
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

fn table_name(core: Core) -> String {
    format!("core_{}", core.name())
}

fn fts_name(core: Core) -> String {
    format!("core_{}_fts", core.name())
}

/// `WHERE` clause and binds selecting the documents `query` matches.
fn where_clause(core: Core, query: &IndexQuery) -> (String, Vec<String>) {
    let mut clauses = vec!["1 = 1".to_string()];
    let mut binds = Vec::new();

    if let Some(id) = &query.id {
        clauses.push("id = ?".into());
        binds.push(id.clone());
    }
    if let Some(prefix) = &query.id_prefix {
        clauses.push(r"id LIKE ? ESCAPE '\'".into());
        binds.push(format!("{}%", escape_like(prefix)));
    }
    if let Some(text) = &query.text {
        let expr = fts_expression(text);
        if !expr.is_empty() {
            clauses.push(format!(
                "id IN (SELECT id FROM {} WHERE {} MATCH ?)",
                fts_name(core),
                fts_name(core)
            ));
            binds.push(expr);
        }
    }

    (clauses.join(" AND "), binds)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', r"\\")
        .replace('%', r"\%")
        .replace('_', r"\_")
}

/// Quote every term so user text can't inject FTS operators.
fn fts_expression(text: &str) -> String {
    text.split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<IndexDocument> {
    let fields_json: String = row.get("fields_json");
    let fields: Map<String, Value> = serde_json::from_str(&fields_json)?;
    Ok(IndexDocument {
        id: row.get("id"),
        file_last_modified: row.get("file_last_modified"),
        text: row.get("text"),
        fields,
    })
}

async fn apply_upsert(
    tx: &mut Transaction<'_, Sqlite>,
    core: Core,
    doc: &IndexDocument,
) -> Result<()> {
    let fields_json = serde_json::to_string(&doc.fields)?;
    sqlx::query(&format!(
        "INSERT INTO {} (id, file_last_modified, text, fields_json)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            file_last_modified = excluded.file_last_modified,
            text = excluded.text,
            fields_json = excluded.fields_json",
        table_name(core)
    ))
    .bind(&doc.id)
    .bind(&doc.file_last_modified)
    .bind(&doc.text)
    .bind(&fields_json)
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!("DELETE FROM {} WHERE id = ?", fts_name(core)))
        .bind(&doc.id)
        .execute(&mut **tx)
        .await?;
    sqlx::query(&format!(
        "INSERT INTO {} (id, text) VALUES (?, ?)",
        fts_name(core)
    ))
    .bind(&doc.id)
    .bind(&doc.text)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn apply_set_field(
    tx: &mut Transaction<'_, Sqlite>,
    core: Core,
    id: &str,
    field: &str,
    value: Value,
) -> Result<()> {
    let row = sqlx::query(&format!(
        "SELECT id, file_last_modified, text, fields_json FROM {} WHERE id = ?",
        table_name(core)
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else {
        debug!(core = core.name(), id, field, "set_field on missing document ignored");
        return Ok(());
    };
    let mut doc = row_to_document(&row)?;
    doc.apply_field(field, value);

    sqlx::query(&format!(
        "UPDATE {} SET fields_json = ? WHERE id = ?",
        table_name(core)
    ))
    .bind(serde_json::to_string(&doc.fields)?)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn apply_delete(
    tx: &mut Transaction<'_, Sqlite>,
    core: Core,
    query: &IndexQuery,
) -> Result<()> {
    let (clause, binds) = where_clause(core, query);
    let ids_sql = format!("SELECT id FROM {} WHERE {}", table_name(core), clause);

    let mut ids_query = sqlx::query_scalar::<_, String>(&ids_sql);
    for b in &binds {
        ids_query = ids_query.bind(b);
    }
    let ids = ids_query.fetch_all(&mut **tx).await?;

    for id in ids {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", fts_name(core)))
            .bind(&id)
            .execute(&mut **tx)
            .await?;
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", table_name(core)))
            .bind(&id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn commit_error(core: Core, e: Error) -> Error {
    Error::Commit {
        core: core.name(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn upsert(&self, core: Core, doc: IndexDocument) -> Result<()> {
        self.staging.push(core, PendingOp::Upsert(doc));
        Ok(())
    }

    async fn set_field(&self, core: Core, id: &str, field: &str, value: Value) -> Result<()> {
        self.staging.push(
            core,
            PendingOp::SetField {
                id: id.to_string(),
                field: field.to_string(),
                value,
            },
        );
        Ok(())
    }

    async fn delete(&self, core: Core, query: &IndexQuery) -> Result<()> {
        self.staging.push(core, PendingOp::Delete(query.clone()));
        Ok(())
    }

    async fn commit(&self, core: Core) -> Result<usize> {
        let ops = self.staging.drain(core);
        if ops.is_empty() {
            return Ok(0);
        }

        match self.apply(core, &ops).await {
            Ok(()) => {
                debug!(core = core.name(), applied = ops.len(), "index commit");
                Ok(ops.len())
            }
            Err(e) => {
                self.staging.restore(core, ops);
                Err(commit_error(core, e))
            }
        }
    }

    async fn query(&self, core: Core, query: &IndexQuery) -> Result<Vec<IndexDocument>> {
        let (clause, binds) = where_clause(core, query);
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT id, file_last_modified, text, fields_json FROM {} WHERE {} ORDER BY id LIMIT ?",
            table_name(core),
            clause
        );

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_document).collect()
    }

    fn pending(&self, core: Core) -> usize {
        self.staging.len(core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SECTION_START_FIELD;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteIndex) {
        let tmp = TempDir::new().unwrap();
        let index = SqliteIndex::open(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();
        (tmp, index)
    }

    fn doc(id: &str, text: &str) -> IndexDocument {
        let mut d = IndexDocument::new(id).with_field(SECTION_START_FIELD, "Papers");
        d.text = text.into();
        d.file_last_modified = Some("2024-01-02T03:04:05Z".into());
        d
    }

    #[tokio::test]
    async fn upsert_visible_after_commit() {
        let (_tmp, index) = open().await;
        index.upsert(Core::Docs, doc("A", "dream work")).await.unwrap();
        assert!(index.get(Core::Docs, "A").await.unwrap().is_none());

        index.commit(Core::Docs).await.unwrap();
        let got = index.get(Core::Docs, "A").await.unwrap().unwrap();
        assert_eq!(got.field_str(SECTION_START_FIELD), Some("Papers"));
        assert!(got.last_modified().is_some());
    }

    #[tokio::test]
    async fn text_query_and_prefix_delete() {
        let (_tmp, index) = open().await;
        index.upsert(Core::Authors, doc("A.1", "Freud")).await.unwrap();
        index.upsert(Core::Authors, doc("A.2", "Jung")).await.unwrap();
        index.upsert(Core::Authors, doc("AB.1", "Klein")).await.unwrap();
        index.commit(Core::Authors).await.unwrap();

        let hits = index
            .query(Core::Authors, &IndexQuery::matching("freud"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "A.1");

        index
            .delete(Core::Authors, &IndexQuery::by_prefix("A."))
            .await
            .unwrap();
        index.commit(Core::Authors).await.unwrap();
        let left = index.query(Core::Authors, &IndexQuery::all()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "AB.1");
    }

    #[tokio::test]
    async fn set_field_null_clears_section_start() {
        let (_tmp, index) = open().await;
        index.upsert(Core::Docs, doc("A", "x")).await.unwrap();
        index.commit(Core::Docs).await.unwrap();

        index
            .set_field(Core::Docs, "A", SECTION_START_FIELD, Value::Null)
            .await
            .unwrap();
        index
            .set_field(Core::Docs, "missing", SECTION_START_FIELD, Value::Null)
            .await
            .unwrap();
        assert_eq!(index.commit(Core::Docs).await.unwrap(), 2);

        let got = index.get(Core::Docs, "A").await.unwrap().unwrap();
        assert!(got.field(SECTION_START_FIELD).is_none());
    }

    #[test]
    fn fts_terms_are_quoted() {
        assert_eq!(fts_expression(r#"a "b OR"#), r#""a" """b" "OR""#);
        assert_eq!(escape_like("A_1%"), r"A\_1\%");
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_and_keeps_writes_staged() {
        let (_tmp, index) = open().await;
        index.upsert(Core::Docs, doc("A", "dream work")).await.unwrap();
        sqlx::query("DROP TABLE core_docs")
            .execute(&index.pool)
            .await
            .unwrap();

        let err = index.commit(Core::Docs).await.unwrap_err();
        assert!(matches!(err, Error::Commit { core: "docs", .. }));
        assert_eq!(index.pending(Core::Docs), 1);

        index.ensure_schema().await.unwrap();
        assert_eq!(index.commit(Core::Docs).await.unwrap(), 1);
        assert!(index.get(Core::Docs, "A").await.unwrap().is_some());
        assert_eq!(index.pending(Core::Docs), 0);
    }
}
