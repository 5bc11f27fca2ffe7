//! Issue-update ("what's new") report.
//!
//! Newly tracked documents are grouped by [`IssueKey`] and written as
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <issue_updates>
//!     <issue>
//!         <issue_id><src>ABC</src><yr>2020</yr><vol>1</vol><iss>2</iss></issue_id>
//!         <articles>
//!             <article id='ABC.001.0001A'>...citation xml...</article>
//!         </articles>
//!     </issue>
//! </issue_updates>
//! ```
//!
//! Default file names carry a timestamp and a random four-digit suffix. They
//! are created exclusively, and a name that is already taken draws a new
//! suffix, so concurrent loaders never overwrite each other's reports.

use chrono::Local;
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::ReportConfig;
use crate::error::Result;
use crate::models::{ArticleMetadata, IssueKey};
use crate::relational::{RelationalStore, TrackedArticle};

const NAME_ATTEMPTS: usize = 50;

/// A written report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flushed {
    /// Issue blocks written.
    pub issues: usize,
    pub path: PathBuf,
}

pub struct IssueUpdateReporter {
    dir: PathBuf,
    ignore: HashSet<String>,
    rng: StdRng,
    issues: IndexMap<IssueKey, Vec<(String, String)>>,
    seen: HashSet<String>,
}

impl IssueUpdateReporter {
    pub fn new(report: &ReportConfig, ignore_sources: &[String]) -> Self {
        Self {
            dir: report.dir.clone(),
            ignore: ignore_sources.iter().map(|s| s.to_uppercase()).collect(),
            rng: StdRng::from_entropy(),
            issues: IndexMap::new(),
            seen: HashSet::new(),
        }
    }

    /// Fix the file-name suffix seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Record a written document. Only new documents from sources outside
    /// the ignore list are kept. Returns whether it was recorded.
    pub fn record(&mut self, meta: &ArticleMetadata, is_new: bool) -> bool {
        if !is_new {
            return false;
        }
        self.add(&meta.art_id, meta.issue_key(), &meta.citeas_xml)
    }

    pub fn record_tracked(&mut self, article: &TrackedArticle) -> bool {
        self.add(&article.art_id, article.issue_key.clone(), &article.citeas_xml)
    }

    /// Rebuild the report from the tracking table instead of a live run.
    pub async fn load_history(&mut self, store: &RelationalStore, days: u32) -> Result<usize> {
        info!(days, "listing tracked documents");
        let articles = store.articles_newer_than(days).await?;
        Ok(articles
            .iter()
            .filter(|a| self.record_tracked(a))
            .count())
    }

    fn add(&mut self, art_id: &str, key: IssueKey, citeas_xml: &str) -> bool {
        if self.ignore.contains(&key.source_code.to_uppercase()) {
            return false;
        }
        if !self.seen.insert(art_id.to_string()) {
            return false;
        }
        self.issues
            .entry(key)
            .or_default()
            .push((art_id.to_string(), citeas_xml.to_string()));
        true
    }

    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    pub fn article_count(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// `<dir>/updated_issues_YYYYmmdd_HHMMSS(NNNN).xml`
    pub fn default_path(&mut self) -> PathBuf {
        let suffix: u16 = self.rng.gen_range(1000..=9999);
        self.dir.join(format!(
            "updated_issues_{}({}).xml",
            Local::now().format("%Y%m%d_%H%M%S"),
            suffix
        ))
    }

    fn issue_block(key: &IssueKey, articles: &[(String, String)]) -> String {
        let mut block = format!("\n\t<issue>\n\t\t{}\n\t\t<articles>\n", key);
        for (id, citeas) in articles {
            block.push_str(&format!(
                "\t\t\t<article id='{}'>{}</article>\n",
                quick_xml::escape::escape(id.as_str()),
                citeas
            ));
        }
        block.push_str("\t\t</articles>\n\t</issue>");
        block
    }

    /// Create the report file. An explicit path is overwritten; a default
    /// name is only ever created new.
    fn create(&mut self, path: Option<&Path>) -> Result<(PathBuf, File)> {
        if let Some(path) = path {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            return Ok((path.to_path_buf(), File::create(path)?));
        }

        std::fs::create_dir_all(&self.dir)?;
        for _ in 0..NAME_ATTEMPTS {
            let path = self.default_path();
            match File::options().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(path = %path.display(), "report name taken; drawing another");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free report name in {}", self.dir.display()),
        )
        .into())
    }

    /// Write the report and clear it. Nothing is written (and a warning
    /// logged) when empty.
    pub fn flush(&mut self, path: Option<&Path>) -> Result<Option<Flushed>> {
        if self.issues.is_empty() {
            warn!("nothing new to report; no issue-update file written");
            return Ok(None);
        }

        let (path, file) = self.create(path)?;
        info!(path = %path.display(), issues = self.issues.len(), "writing issue updates");

        let mut out = BufWriter::new(file);
        out.write_all(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<issue_updates>\n")?;
        let mut written = 0;
        for (key, articles) in &self.issues {
            match out.write_all(Self::issue_block(key, articles).as_bytes()) {
                Ok(()) => written += 1,
                Err(e) => error!(issue = %key, error = %e, "issue block write failed"),
            }
        }
        out.write_all(b"\n</issue_updates>\n")?;
        out.flush()?;

        self.issues.clear();
        self.seen.clear();
        Ok(Some(Flushed {
            issues: written,
            path,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracked(id: &str, src: &str, issue: &str) -> TrackedArticle {
        TrackedArticle {
            art_id: id.into(),
            issue_key: IssueKey {
                source_code: src.into(),
                year: Some(2020),
                volume: "1".into(),
                issue: issue.into(),
            },
            citeas_xml: format!("<p>{}</p>", id),
        }
    }

    fn reporter(dir: &Path) -> IssueUpdateReporter {
        IssueUpdateReporter::new(
            &ReportConfig {
                dir: dir.to_path_buf(),
            },
            &["NEWJ".to_string()],
        )
    }

    #[test]
    fn groups_by_issue_and_skips_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut r = reporter(tmp.path());
        assert!(r.record_tracked(&tracked("ABC.001.0001A", "ABC", "1")));
        assert!(r.record_tracked(&tracked("ABC.001.0002A", "ABC", "1")));
        assert!(r.record_tracked(&tracked("ABC.001.0100A", "ABC", "2")));
        assert!(!r.record_tracked(&tracked("ABC.001.0001A", "ABC", "1")));
        assert!(!r.record_tracked(&tracked("NEWJ.001.0001A", "newj", "1")));
        assert_eq!(r.issue_count(), 2);
        assert_eq!(r.article_count(), 3);
    }

    #[test]
    fn flush_writes_report() {
        let tmp = TempDir::new().unwrap();
        let mut r = reporter(tmp.path());
        r.record_tracked(&tracked("ABC.001.0001A", "ABC", "1"));
        let path = tmp.path().join("out.xml");
        let flushed = r.flush(Some(&path)).unwrap().unwrap();
        assert_eq!(flushed.issues, 1);
        assert_eq!(flushed.path, path);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("<?xml"));
        assert!(text.contains("<issue_id><src>ABC</src><yr>2020</yr><vol>1</vol><iss>1</iss></issue_id>"));
        assert!(text.contains("<article id='ABC.001.0001A'><p>ABC.001.0001A</p></article>"));
        assert!(text.trim_end().ends_with("</issue_updates>"));
        assert!(r.is_empty());
    }

    #[test]
    fn empty_flush_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut r = reporter(tmp.path());
        assert!(r.flush(None).unwrap().is_none());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn default_name_has_stamp_and_suffix() {
        let tmp = TempDir::new().unwrap();
        let name_of = |seed| {
            let mut r = reporter(tmp.path()).with_seed(seed);
            let path = r.default_path();
            path.file_name().unwrap().to_string_lossy().to_string()
        };
        let name = name_of(42);
        let re = regex::Regex::new(r"^updated_issues_\d{8}_\d{6}\(\d{4}\)\.xml$").unwrap();
        assert!(re.is_match(&name), "{name}");
        let suffix = |n: &str| n[n.len() - 9..n.len() - 5].to_string();
        assert_eq!(suffix(&name), suffix(&name_of(42)));
    }

    #[test]
    fn same_seed_reporters_never_share_a_file() {
        let tmp = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for id in ["ABC.001.0001A", "ABC.001.0002A"] {
            let mut r = reporter(tmp.path()).with_seed(7);
            r.record_tracked(&tracked(id, "ABC", "1"));
            paths.push(r.flush(None).unwrap().unwrap().path);
        }
        assert_ne!(paths[0], paths[1]);
        assert!(std::fs::read_to_string(&paths[0]).unwrap().contains("ABC.001.0001A"));
        assert!(std::fs::read_to_string(&paths[1]).unwrap().contains("ABC.001.0002A"));
    }
}
