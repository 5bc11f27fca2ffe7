//! File store abstraction and the local filesystem implementation.
//!
//! Listing walks the whole subtree under `root[/subfolder]`, keeps files
//! whose basename matches `(.*?)\(<build>\)\.(xml|XML)$`, and returns them
//! sorted by path so forward and reverse runs see mirror-image orders.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::FilesConfig;
use crate::error::{Error, Result};
use crate::models::FileDescriptor;

/// What to list.
#[derive(Debug, Clone, Default)]
pub struct FileQuery {
    pub subfolder: Option<PathBuf>,
    /// Regex applied to basenames.
    pub pattern: String,
    pub revised_after: Option<NaiveDate>,
}

impl FileQuery {
    /// All files carrying the given build tag.
    pub fn for_build(build: &str) -> Self {
        Self {
            pattern: build_pattern(build),
            ..Default::default()
        }
    }
}

/// Basename regex for files produced by `build`.
pub fn build_pattern(build: &str) -> String {
    format!(r"(?i)^(.*?)\({}\)\.xml$", regex::escape(build))
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn list_files(&self, query: &FileQuery) -> Result<Vec<FileDescriptor>>;

    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Describe a single file, `None` when it does not exist.
    async fn describe(&self, path: &Path) -> Result<Option<FileDescriptor>>;
}

pub struct LocalFileStore {
    root: PathBuf,
    follow_symlinks: bool,
    exclude: GlobSet,
}

impl LocalFileStore {
    pub fn new(config: &FilesConfig) -> Result<Self> {
        let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
        default_excludes.extend(config.exclude_globs.clone());
        Ok(Self {
            root: config.root.clone(),
            follow_symlinks: config.follow_symlinks,
            exclude: build_globset(&default_excludes)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn list_files(&self, query: &FileQuery) -> Result<Vec<FileDescriptor>> {
        let start = match &query.subfolder {
            Some(sub) => self.root.join(sub),
            None => self.root.clone(),
        };
        if !start.exists() {
            return Err(Error::Config(format!(
                "file store path does not exist: {}",
                start.display()
            )));
        }

        let pattern = Regex::new(&query.pattern).map_err(|e| {
            Error::Config(format!("bad file pattern '{}': {}", query.pattern, e))
        })?;
        let cutoff = query.revised_after.map(start_of_day);

        let mut files = Vec::new();
        for entry in WalkDir::new(&start).follow_links(self.follow_symlinks) {
            let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            if self.exclude.is_match(relative) {
                continue;
            }

            let basename = entry.file_name().to_string_lossy();
            if !pattern.is_match(&basename) {
                continue;
            }

            let descriptor = describe_path(path)?;
            if let Some(cutoff) = cutoff {
                if descriptor.timestamp <= cutoff {
                    continue;
                }
            }
            files.push(descriptor);
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn describe(&self, path: &Path) -> Result<Option<FileDescriptor>> {
        if !path.is_file() {
            return Ok(None);
        }
        describe_path(path).map(Some)
    }
}

fn describe_path(path: &Path) -> Result<FileDescriptor> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    let modified_secs = modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    // Whole seconds: the index stores `YYYY-MM-DDTHH:MM:SSZ`.
    let timestamp = Utc
        .timestamp_opt(modified_secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    Ok(FileDescriptor::new(
        path.to_path_buf(),
        timestamp,
        metadata.len(),
    ))
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Path of the sibling file carrying `to` in place of the build tag `from`.
pub fn rebuild_path(path: &Path, from: &str, to: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let renamed = name.replacen(&format!("({})", from), &format!("({})", to), 1);
    path.with_file_name(renamed)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Config(format!("bad exclude glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("bad exclude globs: {}", e)))
}
