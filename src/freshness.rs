//! Freshness comparison between a candidate file and the search index.
//!
//! An index timestamp equal to or newer than the candidate's means the
//! document is current.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::index::{Core, SearchIndex};

/// Decide whether a document must be reprocessed.
pub fn needs_sync(
    existing: Option<DateTime<Utc>>,
    candidate: DateTime<Utc>,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    match existing {
        None => true,
        Some(indexed) => indexed < candidate,
    }
}

/// Look the document up in `core` and apply [`needs_sync`].
///
/// Lookup failures and records without a readable timestamp both count as
/// "needs sync", so the loader errs toward reprocessing.
pub async fn check(
    index: &dyn SearchIndex,
    core: Core,
    logical_id: &str,
    candidate: DateTime<Utc>,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    match index.get(core, logical_id).await {
        Ok(Some(doc)) => needs_sync(doc.last_modified(), candidate, false),
        Ok(None) => true,
        Err(e) => {
            warn!(id = logical_id, core = core.name(), error = %e, "index lookup failed; reprocessing");
            true
        }
    }
}
