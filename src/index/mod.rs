//! Search index abstraction.
//!
//! The index is split into independent [`Core`]s (primary documents,
//! authors, glossary). Writes are staged per core and only become visible
//! to [`SearchIndex::query`] after [`SearchIndex::commit`] for that core,
//! so a crash between commits loses at most one commit window.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](SearchIndex::upsert) | Stage a full document replacement |
//! | [`set_field`](SearchIndex::set_field) | Stage a single-field update |
//! | [`delete`](SearchIndex::delete) | Stage a delete-by-query |
//! | [`commit`](SearchIndex::commit) | Apply staged writes for one core |
//! | [`query`](SearchIndex::query) | Read committed documents |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::error::Result;

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Core {
    Docs,
    Authors,
    Glossary,
}

impl Core {
    pub const ALL: [Core; 3] = [Core::Docs, Core::Authors, Core::Glossary];

    pub fn name(&self) -> &'static str {
        match self {
            Core::Docs => "docs",
            Core::Authors => "authors",
            Core::Glossary => "glossary",
        }
    }
}

/// Field holding the section heading on a document that opens a section.
pub const SECTION_START_FIELD: &str = "art_newsecnm";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    /// Source file timestamp, `YYYY-MM-DDTHH:MM:SSZ`.
    pub file_last_modified: Option<String>,
    /// Full-text searchable content.
    pub text: String,
    pub fields: Map<String, Value>,
}

impl IndexDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            file_last_modified: None,
            text: String::new(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.fields.insert(key.to_string(), value);
        }
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    /// Parsed `file_last_modified`; `None` if absent or unparseable.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.file_last_modified.as_deref().and_then(parse_timestamp)
    }

    pub(crate) fn apply_field(&mut self, field: &str, value: Value) {
        if value.is_null() {
            self.fields.remove(field);
        } else {
            self.fields.insert(field.to_string(), value);
        }
    }
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc())
        })
}

/// Filter for reads and delete-by-query. Empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexQuery {
    pub id: Option<String>,
    pub id_prefix: Option<String>,
    /// Every whitespace-separated term must occur in the document text.
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl IndexQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn by_prefix(prefix: impl Into<String>) -> Self {
        Self {
            id_prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn matching(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &IndexDocument) -> bool {
        if let Some(id) = &self.id {
            if &doc.id != id {
                return false;
            }
        }
        if let Some(prefix) = &self.id_prefix {
            if !doc.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let haystack = doc.text.to_lowercase();
            if !text
                .split_whitespace()
                .all(|term| haystack.contains(&term.to_lowercase()))
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Upsert(IndexDocument),
    SetField {
        id: String,
        field: String,
        value: Value,
    },
    Delete(IndexQuery),
}

/// Per-core queue of writes awaiting commit.
#[derive(Default)]
pub(crate) struct Staging {
    ops: Mutex<HashMap<Core, Vec<PendingOp>>>,
}

impl Staging {
    pub(crate) fn push(&self, core: Core, op: PendingOp) {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        ops.entry(core).or_default().push(op);
    }

    pub(crate) fn drain(&self, core: Core) -> Vec<PendingOp> {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        ops.remove(&core).unwrap_or_default()
    }

    /// Put back ops a failed commit drained, ahead of anything staged since.
    pub(crate) fn restore(&self, core: Core, mut drained: Vec<PendingOp>) {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = ops.entry(core).or_default();
        drained.append(queue);
        *queue = drained;
    }

    pub(crate) fn len(&self, core: Core) -> usize {
        let ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        ops.get(&core).map_or(0, Vec::len)
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, core: Core, doc: IndexDocument) -> Result<()>;

    /// Atomic single-field update; a `Null` value removes the field.
    /// Applies only if the document exists when the commit runs.
    async fn set_field(&self, core: Core, id: &str, field: &str, value: Value) -> Result<()>;

    async fn delete(&self, core: Core, query: &IndexQuery) -> Result<()>;

    /// Apply staged writes. Returns the number of operations applied.
    /// On failure nothing is applied and the writes stay staged.
    async fn commit(&self, core: Core) -> Result<usize>;

    async fn query(&self, core: Core, query: &IndexQuery) -> Result<Vec<IndexDocument>>;

    /// Writes staged since the last commit.
    fn pending(&self, core: Core) -> usize;

    async fn get(&self, core: Core, id: &str) -> Result<Option<IndexDocument>> {
        let mut docs = self.query(core, &IndexQuery::by_id(id).limit(1)).await?;
        Ok(docs.pop())
    }
}
