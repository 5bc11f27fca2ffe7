use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub index: IndexConfig,
    pub files: FilesConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

/// Build tags name the processing stage embedded in a filename, e.g.
/// `ABC.001.0001A(bKBD3).xml`.
#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    #[serde(default = "default_input_build")]
    pub input: String,
    #[serde(default = "default_output_build")]
    pub output: String,
    #[serde(default = "default_precompiled_build")]
    pub precompiled: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            input: default_input_build(),
            output: default_output_build(),
            precompiled: default_precompiled_build(),
        }
    }
}

fn default_input_build() -> String {
    "bKBD3".to_string()
}
fn default_output_build() -> String {
    "bEXP_ARCH1".to_string()
}
fn default_precompiled_build() -> String {
    "bEXP_ARCH1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    #[serde(default = "default_commit_limit")]
    pub commit_limit: usize,
    /// Source codes never reported as new issues (bulk onboarding noise).
    #[serde(default)]
    pub ignore_sources: Vec<String>,
    #[serde(default = "default_glossary_pattern")]
    pub glossary_pattern: String,
    /// Delete a document's stored references before inserting the fresh set.
    #[serde(default)]
    pub purge_references: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            commit_limit: default_commit_limit(),
            ignore_sources: Vec::new(),
            glossary_pattern: default_glossary_pattern(),
            purge_references: false,
        }
    }
}

fn default_commit_limit() -> usize {
    1000
}
fn default_glossary_pattern() -> String {
    r"^ZBK\.069".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    #[serde(default = "default_report_dir")]
    pub dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: default_report_dir(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("data/whatsnew")
}

/// Source-code sets behind the `books` and `videos` content classes.
/// Everything outside both sets counts as a journal.
#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "default_book_codes")]
    pub book_codes: Vec<String>,
    #[serde(default = "default_video_codes")]
    pub video_codes: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            book_codes: default_book_codes(),
            video_codes: default_video_codes(),
        }
    }
}

fn default_book_codes() -> Vec<String> {
    ["ZBK", "IPL", "NLP", "SE", "GW"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_video_codes() -> Vec<String> {
    [
        "AFCVS", "BPSIVS", "IJPVS", "IPSAVS", "NYPSIVS", "PCVS", "PEPGRANTVS", "PEPTOPAUTHVS",
        "PEPVS", "SFCPVS", "SPIVS", "UCLVS",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Configuration rooted at `base`, used by tests and scratch runs.
    pub fn minimal(base: &Path) -> Self {
        Self {
            db: DbConfig {
                path: base.join("data/docsync.sqlite"),
                max_connections: default_max_connections(),
            },
            index: IndexConfig {
                path: base.join("data/docsync-index.sqlite"),
            },
            files: FilesConfig {
                root: base.join("xml"),
                exclude_globs: Vec::new(),
                follow_symlinks: false,
            },
            build: BuildConfig::default(),
            loader: LoaderConfig::default(),
            report: ReportConfig {
                dir: base.join("data/whatsnew"),
            },
            sources: SourcesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.loader.commit_limit == 0 {
            return Err(Error::Config("loader.commit_limit must be > 0".into()));
        }
        for (name, tag) in [
            ("build.input", &self.build.input),
            ("build.output", &self.build.output),
            ("build.precompiled", &self.build.precompiled),
        ] {
            validate_build_tag(name, tag)?;
        }
        regex::Regex::new(&self.loader.glossary_pattern).map_err(|e| {
            Error::Config(format!(
                "loader.glossary_pattern is not a valid regex: {}",
                e
            ))
        })?;
        if self.db.max_connections == 0 {
            return Err(Error::Config("db.max_connections must be > 0".into()));
        }
        Ok(())
    }
}

pub fn validate_build_tag(name: &str, tag: &str) -> Result<()> {
    if tag.trim().is_empty() {
        return Err(Error::Config(format!("{} must not be empty", name)));
    }
    if tag.contains(['(', ')', '/', '\\']) {
        return Err(Error::Config(format!(
            "{} must be a bare build name without parentheses or path separators: '{}'",
            name, tag
        )));
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[db]
path = "data/docsync.sqlite"

[index]
path = "data/index.sqlite"

[files]
root = "xml"
"#;

    #[test]
    fn defaults_fill_optional_sections() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.loader.commit_limit, 1000);
        assert_eq!(cfg.build.input, "bKBD3");
        assert_eq!(cfg.build.output, "bEXP_ARCH1");
        assert!(!cfg.loader.purge_references);
        assert!(cfg.sources.video_codes.iter().any(|c| c == "PEPVS"));
    }

    #[test]
    fn zero_commit_limit_rejected() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.loader.commit_limit = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn parenthesised_build_tag_rejected() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.build.input = "(bKBD3)".into();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn bad_glossary_pattern_rejected() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.loader.glossary_pattern = "ZBK(".into();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
