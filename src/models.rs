//! Core data models shared by the loader, the stores, and the reports.

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// A file as listed by a [`FileStore`](crate::file_store::FileStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub basename: String,
    pub logical_id: String,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub build_tag: Option<String>,
}

impl FileDescriptor {
    pub fn new(path: PathBuf, timestamp: DateTime<Utc>, size: u64) -> Self {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let logical_id = logical_id_from_basename(&basename);
        let build_tag = build_tag_from_basename(&basename);
        Self {
            path,
            basename,
            logical_id,
            timestamp,
            size,
            build_tag,
        }
    }

    /// Timestamp in the `YYYY-MM-DDTHH:MM:SSZ` form stored in the index.
    pub fn timestamp_str(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn file_stem(basename: &str) -> &str {
    match basename.rfind('.') {
        Some(pos) if pos > 0 => &basename[..pos],
        _ => basename,
    }
}

/// Derive the logical id from a filename.
///
/// Drops the extension, the `(build)` tag and any annotation after a space:
/// `JICAP.018.0307A updated but no page breaks (bEXP_ARCH1).XML` becomes
/// `JICAP.018.0307A`.
pub fn logical_id_from_basename(basename: &str) -> String {
    file_stem(basename)
        .split([' ', '('])
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

/// The build tag inside the last pair of parentheses, e.g. `bKBD3`.
pub fn build_tag_from_basename(basename: &str) -> Option<String> {
    let stem = file_stem(basename);
    let open = stem.rfind('(')?;
    let close = stem[open..].find(')')? + open;
    let tag = &stem[open + 1..close];
    (!tag.is_empty()).then(|| tag.to_string())
}

/// Which product area a file belongs to, taken from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileClassification {
    Archive,
    Current,
    Future,
    Free,
    Special,
    Offsite,
}

impl FileClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileClassification::Archive => "archive",
            FileClassification::Current => "current",
            FileClassification::Future => "future",
            FileClassification::Free => "free",
            FileClassification::Special => "special",
            FileClassification::Offsite => "offsite",
        }
    }

    /// First classification keyword found anywhere in `path`, case-insensitive.
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_lowercase();
        [
            ("current", FileClassification::Current),
            ("archive", FileClassification::Archive),
            ("future", FileClassification::Future),
            ("free", FileClassification::Free),
            ("special", FileClassification::Special),
            ("offsite", FileClassification::Offsite),
        ]
        .into_iter()
        .filter_map(|(kw, class)| lower.find(kw).map(|pos| (pos, class)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, class)| class)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Author {
    pub first: Option<String>,
    pub last: String,
}

impl Author {
    /// `Freud, S.`
    pub fn citation_name(&self) -> String {
        match self
            .first
            .as_deref()
            .and_then(|f| f.trim().chars().next())
        {
            Some(initial) => format!("{}, {}.", self.last, initial),
            None => self.last.clone(),
        }
    }

    /// `Sigmund Freud`
    pub fn display_name(&self) -> String {
        match &self.first {
            Some(first) if !first.trim().is_empty() => format!("{} {}", first.trim(), self.last),
            _ => self.last.clone(),
        }
    }
}

/// Attributes parsed out of a compiled document, shared by both stores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleMetadata {
    pub art_id: String,
    pub src_code: String,
    pub src_title_abbr: Option<String>,
    pub art_type: Option<String>,
    pub year: Option<i32>,
    pub vol: Option<String>,
    pub issue: Option<String>,
    pub page_range: Option<String>,
    pub title: Option<String>,
    pub authors: Vec<Author>,
    pub citeas_xml: String,
    pub citeas_text: String,
    /// Section heading this document opens, if it claims to be first in section.
    pub start_sectname: Option<String>,
    pub ref_count: usize,
    pub file_classification: Option<FileClassification>,
    pub filename: String,
    pub file_timestamp: DateTime<Utc>,
    pub file_size: u64,
}

impl ArticleMetadata {
    pub fn is_first_in_section(&self) -> bool {
        self.start_sectname.is_some()
    }

    pub fn issue_key(&self) -> IssueKey {
        IssueKey {
            source_code: self.src_code.clone(),
            year: self.year,
            volume: self.vol.clone().unwrap_or_default(),
            issue: self.issue.clone().unwrap_or_default(),
        }
    }

    /// Author line for citations: `Freud, S. and Jung, C.`
    pub fn author_citation(&self) -> String {
        let names: Vec<String> = self.authors.iter().map(Author::citation_name).collect();
        match names.len() {
            0 => String::new(),
            1 => names[0].clone(),
            n => format!("{} and {}", names[..n - 1].join(", "), names[n - 1]),
        }
    }

    /// Section identity used by the first-in-section check.
    pub fn section_key(&self) -> Option<SectionKey> {
        self.start_sectname.as_ref().map(|name| SectionKey {
            source_code: self.src_code.clone(),
            volume: self.vol.clone().unwrap_or_default(),
            issue: self.issue.clone().unwrap_or_default(),
            name: name.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionKey {
    pub source_code: String,
    pub volume: String,
    pub issue: String,
    pub name: String,
}

/// One citation extracted from a document's bibliography.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceEntry {
    /// Unique within the owning document (`B001`, ...).
    pub local_id: String,
    pub xml: String,
    pub text: String,
    /// Logical id of the cited document, when resolved.
    pub rx: Option<String>,
}

/// Aggregation key for the issue-update report.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssueKey {
    pub source_code: String,
    pub year: Option<i32>,
    pub volume: String,
    pub issue: String,
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let year = self.year.map(|y| y.to_string()).unwrap_or_default();
        write!(
            f,
            "<issue_id><src>{}</src><yr>{}</yr><vol>{}</vol><iss>{}</iss></issue_id>",
            escape(self.source_code.as_str()),
            year,
            escape(self.volume.as_str()),
            escape(self.issue.as_str())
        )
    }
}

/// A row of the tracking table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub logical_id: String,
    pub first_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_id_strips_build_tag() {
        assert_eq!(
            logical_id_from_basename("ABC.001.0001A(bKBD3).xml"),
            "ABC.001.0001A"
        );
    }

    #[test]
    fn logical_id_strips_annotation_and_uppercases() {
        assert_eq!(
            logical_id_from_basename("jicap.018.0307a updated but no page breaks (bEXP_ARCH1).XML"),
            "JICAP.018.0307A"
        );
    }

    #[test]
    fn logical_id_without_tag() {
        assert_eq!(logical_id_from_basename("ZBK.069.0001A.xml"), "ZBK.069.0001A");
    }

    #[test]
    fn build_tag_extracted() {
        assert_eq!(
            build_tag_from_basename("ABC.001.0001A(bKBD3).xml").as_deref(),
            Some("bKBD3")
        );
        assert_eq!(build_tag_from_basename("ABC.001.0001A.xml"), None);
    }

    #[test]
    fn classification_from_path() {
        assert_eq!(
            FileClassification::from_path("/data/_PEPCurrent/CFP/012.2022/x.xml"),
            Some(FileClassification::Current)
        );
        assert_eq!(
            FileClassification::from_path("/data/_PEPFree/x.xml"),
            Some(FileClassification::Free)
        );
        assert_eq!(FileClassification::from_path("/data/plain/x.xml"), None);
    }

    #[test]
    fn issue_key_renders_escaped() {
        let key = IssueKey {
            source_code: "A&B".into(),
            year: Some(2020),
            volume: "1".into(),
            issue: "2".into(),
        };
        assert_eq!(
            key.to_string(),
            "<issue_id><src>A&amp;B</src><yr>2020</yr><vol>1</vol><iss>2</iss></issue_id>"
        );
    }

    #[test]
    fn author_citation_joins() {
        let a = Author {
            first: Some("Sigmund".into()),
            last: "Freud".into(),
        };
        let b = Author {
            first: None,
            last: "Jung".into(),
        };
        assert_eq!(a.citation_name(), "Freud, S.");
        assert_eq!(b.citation_name(), "Jung");
    }
}
