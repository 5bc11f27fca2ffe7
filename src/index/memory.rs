//! In-memory [`SearchIndex`] for tests.
//!
//! Committed documents live in a `BTreeMap` per core behind a `RwLock`;
//! staged writes go through the shared [`Staging`] queue exactly as they
//! do for the SQLite backend.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError, RwLock};

use super::{Core, IndexDocument, IndexQuery, PendingOp, SearchIndex, Staging};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MemoryIndex {
    committed: RwLock<HashMap<Core, BTreeMap<String, IndexDocument>>>,
    staging: Staging,
    // Remaining failures per core; `None` fails forever.
    failing_commits: Mutex<HashMap<Core, Option<usize>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later commit on `core` fail (simulates an unreachable index).
    pub fn fail_commits(&self, core: Core) {
        self.failing_commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(core, None);
    }

    /// Make only the next `times` commits on `core` fail.
    pub fn fail_next_commits(&self, core: Core, times: usize) {
        self.failing_commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(core, Some(times));
    }

    fn take_failure(&self, core: Core) -> bool {
        let mut failing = self
            .failing_commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match failing.get_mut(&core) {
            None => false,
            Some(None) => true,
            Some(Some(0)) => {
                failing.remove(&core);
                false
            }
            Some(Some(n)) => {
                *n -= 1;
                true
            }
        }
    }

    /// Committed document count for `core`.
    pub fn len(&self, core: Core) -> usize {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&core)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, core: Core) -> bool {
        self.len(core) == 0
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
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
        if self.take_failure(core) {
            self.staging.restore(core, ops);
            return Err(Error::Commit {
                core: core.name(),
                reason: "index unavailable".to_string(),
            });
        }

        let applied = ops.len();
        let mut committed = self
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let docs = committed.entry(core).or_default();
        for op in ops {
            match op {
                PendingOp::Upsert(doc) => {
                    docs.insert(doc.id.clone(), doc);
                }
                PendingOp::SetField { id, field, value } => {
                    if let Some(doc) = docs.get_mut(&id) {
                        doc.apply_field(&field, value);
                    }
                }
                PendingOp::Delete(query) => docs.retain(|_, doc| !query.matches(doc)),
            }
        }
        Ok(applied)
    }

    async fn query(&self, core: Core, query: &IndexQuery) -> Result<Vec<IndexDocument>> {
        let committed = self
            .committed
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(docs) = committed.get(&core) else {
            return Ok(Vec::new());
        };
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(docs
            .values()
            .filter(|doc| query.matches(doc))
            .take(limit)
            .cloned()
            .collect())
    }

    fn pending(&self, core: Core) -> usize {
        self.staging.len(core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SECTION_START_FIELD;

    #[tokio::test]
    async fn writes_invisible_until_commit() {
        let index = MemoryIndex::new();
        index
            .upsert(Core::Docs, IndexDocument::new("A"))
            .await
            .unwrap();
        assert!(index.get(Core::Docs, "A").await.unwrap().is_none());
        assert_eq!(index.pending(Core::Docs), 1);

        assert_eq!(index.commit(Core::Docs).await.unwrap(), 1);
        assert!(index.get(Core::Docs, "A").await.unwrap().is_some());
        assert_eq!(index.pending(Core::Docs), 0);
    }

    #[tokio::test]
    async fn cores_commit_independently() {
        let index = MemoryIndex::new();
        index.upsert(Core::Docs, IndexDocument::new("A")).await.unwrap();
        index.upsert(Core::Authors, IndexDocument::new("A.1")).await.unwrap();
        index.commit(Core::Authors).await.unwrap();
        assert!(index.is_empty(Core::Docs));
        assert_eq!(index.len(Core::Authors), 1);
    }

    #[tokio::test]
    async fn set_field_and_delete_apply_in_order() {
        let index = MemoryIndex::new();
        let doc = IndexDocument::new("A").with_field(SECTION_START_FIELD, "Papers");
        index.upsert(Core::Docs, doc).await.unwrap();
        index.upsert(Core::Docs, IndexDocument::new("B")).await.unwrap();
        index
            .set_field(Core::Docs, "A", SECTION_START_FIELD, Value::Null)
            .await
            .unwrap();
        index
            .delete(Core::Docs, &IndexQuery::by_id("B"))
            .await
            .unwrap();
        index.commit(Core::Docs).await.unwrap();

        let a = index.get(Core::Docs, "A").await.unwrap().unwrap();
        assert!(a.field(SECTION_START_FIELD).is_none());
        assert!(index.get(Core::Docs, "B").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_commit_reports_core() {
        let index = MemoryIndex::new();
        index.fail_commits(Core::Glossary);
        let err = index.commit(Core::Glossary).await.unwrap_err();
        assert!(matches!(err, Error::Commit { core: "glossary", .. }));
    }

    #[tokio::test]
    async fn failed_commit_keeps_writes_for_the_retry() {
        let index = MemoryIndex::new();
        index.upsert(Core::Docs, IndexDocument::new("A")).await.unwrap();
        index.fail_next_commits(Core::Docs, 1);
        assert!(index.commit(Core::Docs).await.is_err());
        assert_eq!(index.pending(Core::Docs), 1);

        index.upsert(Core::Docs, IndexDocument::new("B")).await.unwrap();
        assert_eq!(index.commit(Core::Docs).await.unwrap(), 2);
        assert_eq!(index.len(Core::Docs), 2);
    }
}
