//! Batch synchronization controller.
//!
//! Drives one load run: list files, check each against the index, compile
//! and/or load the ones that changed, commit the index every
//! `loader.commit_limit` successful writes, then commit every core, repair
//! section-start markers for the sections the run touched, and write the
//! issue-update report.
//!
//! Two runs may walk the same tree from opposite ends (`reverse`) and stop
//! a little past the middle (`halfway`). Nothing is locked: every write is
//! an idempotent upsert keyed by logical id, and the only contended field
//! (the section-start marker) is re-derived from the relational view.

use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compiler::{Compiler, CompilerAdapter};
use crate::config::{validate_build_tag, Config};
use crate::error::{Error, Result};
use crate::extract::parse_document;
use crate::file_store::{build_pattern, rebuild_path, FileQuery, FileStore};
use crate::freshness;
use crate::index::{Core, SearchIndex, SECTION_START_FIELD};
use crate::models::{ArticleMetadata, FileDescriptor, SectionKey};
use crate::progress::{LoadProgressEvent, LoadProgressReporter, NoProgress};
use crate::relational::RelationalStore;
use crate::whatsnew::IssueUpdateReporter;
use crate::writer::MultiStoreWriter;

/// Extra entries each half of a split run evaluates past the midpoint.
pub const HALFWAY_OVERLAP: usize = 5;

const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Load already-compiled files (the `precompiled` build).
    LoadOnly,
    /// Compile raw files and load the result.
    #[default]
    CompileAndLoad,
    /// Compile raw files and save the output next to them; stores untouched.
    CompileAndSave,
    CompileLoadAndSave,
    /// Load the compiled sibling when it is at least as new as the raw
    /// file, otherwise compile.
    Smart,
}

impl RunMode {
    fn saves(&self) -> bool {
        matches!(self, RunMode::CompileAndSave | RunMode::CompileLoadAndSave)
    }
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "load" | "load-only" => Ok(RunMode::LoadOnly),
            "compile" | "compile-load" => Ok(RunMode::CompileAndLoad),
            "compile-save" => Ok(RunMode::CompileAndSave),
            "compile-load-save" => Ok(RunMode::CompileLoadAndSave),
            "smart" => Ok(RunMode::Smart),
            other => Err(Error::Config(format!("unknown run mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reprocess regardless of index timestamps.
    pub force: bool,
    pub reverse: bool,
    /// Stop after `ceil(n/2) + HALFWAY_OVERLAP` files.
    pub halfway: bool,
    /// Only documents whose logical id starts with this key.
    pub key: Option<String>,
    /// A single file instead of a listing.
    pub file: Option<PathBuf>,
    pub subfolder: Option<PathBuf>,
    /// Only files modified after this date.
    pub after: Option<NaiveDate>,
    pub mode: RunMode,
    pub include_paras: bool,
    pub glossary_only: bool,
    /// Overrides `build.input`.
    pub input_build: Option<String>,
    /// Report file; generated under `report.dir` when absent.
    pub report_path: Option<PathBuf>,
    /// Build the report from documents tracked in the last N days instead
    /// of from this run.
    pub report_days: Option<u32>,
    /// Seed for the report file suffix.
    pub report_seed: Option<u64>,
}

/// Totals for one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub build: String,
    pub reverse: bool,
    pub listed: u64,
    pub evaluated: u64,
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub saved: u64,
    pub new_documents: u64,
    pub references: u64,
    pub commits: u64,
    pub sections_reconciled: u64,
    pub connections: u64,
    pub compile_passed: u64,
    pub compile_failed: u64,
    pub compile_time: Duration,
    pub reported_issues: usize,
    pub report_path: Option<PathBuf>,
    pub stopped_early: bool,
    /// Window commits that failed; their writes stayed staged for the next commit.
    pub window_commit_failures: Vec<String>,
    pub commit_failures: Vec<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    fn per_minute(&self, n: u64) -> f64 {
        let minutes = self.elapsed.as_secs_f64() / 60.0;
        if minutes > 0.0 {
            n as f64 / minutes
        } else {
            0.0
        }
    }

    /// Documents actually loaded per minute.
    pub fn loaded_per_minute(&self) -> f64 {
        self.per_minute(self.processed)
    }

    /// Documents evaluated per minute, skips included.
    pub fn evaluated_per_minute(&self) -> f64 {
        self.per_minute(self.evaluated)
    }

    /// A failed final commit makes the run unsuccessful.
    pub fn is_fatal(&self) -> bool {
        !self.commit_failures.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.reverse { "reverse" } else { "forward" };
        writeln!(f, "load {} ({}) run {}", self.build, direction, self.run_id)?;
        writeln!(f, "  listed: {} files", self.listed)?;
        writeln!(f, "  evaluated: {}", self.evaluated)?;
        writeln!(f, "  processed: {}", self.processed)?;
        writeln!(f, "  skipped (current): {}", self.skipped)?;
        writeln!(f, "  failed: {}", self.failed)?;
        if self.saved > 0 {
            writeln!(f, "  compiled files saved: {}", self.saved)?;
        }
        writeln!(f, "  new documents: {}", self.new_documents)?;
        writeln!(f, "  references written: {}", self.references)?;
        writeln!(
            f,
            "  compiles: {} passed, {} failed ({:.1}s)",
            self.compile_passed,
            self.compile_failed,
            self.compile_time.as_secs_f64()
        )?;
        writeln!(f, "  index commits: {}", self.commits)?;
        writeln!(f, "  sections reconciled: {}", self.sections_reconciled)?;
        writeln!(f, "  connections: {}", self.connections)?;
        if let Some(path) = &self.report_path {
            writeln!(
                f,
                "  issue updates: {} issues -> {}",
                self.reported_issues,
                path.display()
            )?;
        }
        writeln!(f, "  elapsed: {:.1}s", self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "  throughput: {:.1} docs/min loaded, {:.1} docs/min evaluated",
            self.loaded_per_minute(),
            self.evaluated_per_minute()
        )?;
        if self.stopped_early {
            writeln!(f, "  stopped early on request")?;
        }
        for failure in &self.window_commit_failures {
            writeln!(f, "  window commit failed (retried): {}", failure)?;
        }
        for failure in &self.commit_failures {
            writeln!(f, "  COMMIT FAILED: {}", failure)?;
        }
        write!(f, "{}", if self.is_fatal() { "failed" } else { "ok" })
    }
}

/// Number of entries one half of a split run evaluates.
pub fn halfway_limit(n: usize) -> usize {
    (n.div_ceil(2) + HALFWAY_OVERLAP).min(n)
}

enum Outcome {
    Loaded {
        is_new: bool,
        references: usize,
        section: Option<SectionKey>,
        core: Core,
        meta: Box<ArticleMetadata>,
    },
    Saved,
}

pub struct SyncController<'a> {
    config: &'a Config,
    files: &'a dyn FileStore,
    relational: &'a RelationalStore,
    index: &'a dyn SearchIndex,
    compiler: CompilerAdapter<Box<dyn Compiler>>,
    progress: Box<dyn LoadProgressReporter>,
    stop: Arc<AtomicBool>,
}

impl<'a> SyncController<'a> {
    pub fn new(
        config: &'a Config,
        files: &'a dyn FileStore,
        relational: &'a RelationalStore,
        index: &'a dyn SearchIndex,
        compiler: Box<dyn Compiler>,
    ) -> Self {
        Self {
            config,
            files,
            relational,
            index,
            compiler: CompilerAdapter::new(compiler),
            progress: Box::new(NoProgress),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn LoadProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Setting the flag ends the run after the document in flight.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Resolve the file list for `opts`, in processing order.
    pub async fn list(&self, opts: &RunOptions, writer: &MultiStoreWriter<'_>) -> Result<Vec<FileDescriptor>> {
        let build = self.listing_build(opts);
        validate_build_tag("input build", &build)?;

        let mut files = match &opts.file {
            Some(path) => match self.files.describe(path).await? {
                Some(fd) => vec![fd],
                None => {
                    return Err(Error::Config(format!(
                        "file not found: {}",
                        path.display()
                    )))
                }
            },
            None => {
                let query = FileQuery {
                    subfolder: opts.subfolder.clone(),
                    pattern: build_pattern(&build),
                    revised_after: opts.after,
                };
                self.files.list_files(&query).await?
            }
        };

        if let Some(key) = &opts.key {
            let key = key.trim().to_uppercase();
            files.retain(|f| f.logical_id.starts_with(&key));
        }
        if opts.glossary_only {
            files.retain(|f| writer.core_for(f) == Core::Glossary);
        }
        if opts.reverse {
            files.reverse();
        }
        if opts.halfway {
            files.truncate(halfway_limit(files.len()));
        }
        Ok(files)
    }

    fn listing_build(&self, opts: &RunOptions) -> String {
        match opts.mode {
            RunMode::LoadOnly => self.config.build.precompiled.clone(),
            _ => opts
                .input_build
                .clone()
                .unwrap_or_else(|| self.config.build.input.clone()),
        }
    }

    pub async fn run(&mut self, opts: &RunOptions) -> Result<RunSummary> {
        let started = Instant::now();
        let connections_before = self.relational.connections_opened();
        let config = self.config;
        let writer = MultiStoreWriter::new(
            self.relational,
            self.index,
            &config.loader,
            opts.include_paras,
        )?;

        let mut summary = RunSummary {
            run_id: Uuid::new_v4().to_string(),
            build: self.listing_build(opts),
            reverse: opts.reverse,
            ..Default::default()
        };
        let files = self.list(opts, &writer).await?;
        summary.listed = files.len() as u64;
        info!(
            run = %summary.run_id,
            files = files.len(),
            mode = ?opts.mode,
            reverse = opts.reverse,
            halfway = opts.halfway,
            "load starting"
        );
        self.progress.report(LoadProgressEvent::Listed {
            total: summary.listed,
        });

        let mut reporter = IssueUpdateReporter::new(&config.report, &config.loader.ignore_sources);
        if let Some(seed) = opts.report_seed {
            reporter = reporter.with_seed(seed);
        }
        let mut touched: BTreeSet<SectionKey> = BTreeSet::new();
        let mut uncommitted = 0usize;

        for file in &files {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested; ending run");
                summary.stopped_early = true;
                break;
            }
            summary.evaluated += 1;

            if !self.needs_processing(file, opts, &writer).await {
                debug!(id = %file.logical_id, "current; skipped");
                summary.skipped += 1;
            } else {
                match self.process(file, opts, &writer).await {
                    Ok(Outcome::Loaded {
                        is_new,
                        references,
                        section,
                        core,
                        meta,
                    }) => {
                        summary.processed += 1;
                        summary.references += references as u64;
                        if is_new {
                            summary.new_documents += 1;
                        }
                        if opts.report_days.is_none() {
                            reporter.record(&meta, is_new);
                        }
                        if let (Some(section), Core::Docs) = (section, core) {
                            touched.insert(section);
                        }
                        uncommitted += 1;
                        if uncommitted >= config.loader.commit_limit {
                            self.commit_window(&mut summary).await;
                            uncommitted = 0;
                        }
                    }
                    Ok(Outcome::Saved) => {
                        summary.processed += 1;
                        summary.saved += 1;
                    }
                    Err(e) => {
                        summary.failed += 1;
                        error!(id = %file.logical_id, path = %file.path.display(), error = %e, "document failed");
                    }
                }
            }

            if summary.evaluated % PROGRESS_EVERY == 0 {
                self.progress.report(LoadProgressEvent::Loading {
                    n: summary.evaluated,
                    total: summary.listed,
                    skipped: summary.skipped,
                    failed: summary.failed,
                });
            }
        }
        self.progress.report(LoadProgressEvent::Loading {
            n: summary.evaluated,
            total: summary.listed,
            skipped: summary.skipped,
            failed: summary.failed,
        });

        if opts.mode != RunMode::CompileAndSave {
            self.final_commit(&mut summary).await;
            self.reconcile_sections(&touched, &mut summary).await;
        }

        if let Some(days) = opts.report_days {
            if let Err(e) = reporter.load_history(self.relational, days).await {
                error!(error = %e, "could not list recently tracked documents");
            }
        }
        if reporter.is_empty() {
            match opts.report_days {
                Some(days) => warn!(days, "nothing tracked in the requested window"),
                None => warn!("nothing new in this run"),
            }
        } else {
            match reporter.flush(opts.report_path.as_deref()) {
                Ok(Some(flushed)) => {
                    summary.reported_issues = flushed.issues;
                    summary.report_path = Some(flushed.path);
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "issue-update report failed"),
            }
        }

        summary.compile_passed = self.compiler.passed();
        summary.compile_failed = self.compiler.failed();
        summary.compile_time = self.compiler.total_time();
        summary.connections = self.relational.connections_opened() - connections_before;
        summary.elapsed = started.elapsed();
        info!(
            run = %summary.run_id,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            "load finished"
        );
        Ok(summary)
    }

    async fn needs_processing(
        &self,
        file: &FileDescriptor,
        opts: &RunOptions,
        writer: &MultiStoreWriter<'_>,
    ) -> bool {
        if opts.mode == RunMode::CompileAndSave {
            // Compare against the saved output rather than the index.
            let target = rebuild_path(&file.path, &self.listing_build(opts), &self.config.build.output);
            let saved = match self.files.describe(&target).await {
                Ok(found) => found.map(|fd| fd.timestamp),
                Err(_) => None,
            };
            return freshness::needs_sync(saved, file.timestamp, opts.force);
        }
        freshness::check(
            self.index,
            writer.core_for(file),
            &file.logical_id,
            file.timestamp,
            opts.force,
        )
        .await
    }

    async fn process(
        &mut self,
        file: &FileDescriptor,
        opts: &RunOptions,
        writer: &MultiStoreWriter<'_>,
    ) -> Result<Outcome> {
        let input_build = self.listing_build(opts);
        let content = match opts.mode {
            RunMode::LoadOnly => self.files.read(&file.path).await?,
            RunMode::Smart => {
                let sibling = rebuild_path(&file.path, &input_build, &self.config.build.output);
                match self.files.describe(&sibling).await? {
                    Some(compiled) if compiled.timestamp >= file.timestamp => {
                        debug!(id = %file.logical_id, "loading compiled sibling");
                        self.files.read(&compiled.path).await?
                    }
                    _ => self.compile(file, &input_build, false).await?,
                }
            }
            mode => self.compile(file, &input_build, mode.saves()).await?,
        };

        if opts.mode == RunMode::CompileAndSave {
            return Ok(Outcome::Saved);
        }

        let parsed = parse_document(&content, file)?;
        let result = writer.write(file, &parsed, &content).await?;
        Ok(Outcome::Loaded {
            is_new: result.is_new,
            references: result.references_written,
            section: result.section,
            core: result.core,
            meta: Box::new(parsed.metadata),
        })
    }

    async fn compile(&mut self, file: &FileDescriptor, input_build: &str, save: bool) -> Result<Vec<u8>> {
        let raw = self.files.read(&file.path).await?;
        let compiled = self.compiler.compile(&raw, file)?;
        if save {
            let target = rebuild_path(&file.path, input_build, &compiled.build_tag);
            if target == file.path {
                return Err(Error::Config(format!(
                    "output build '{}' would overwrite {}",
                    compiled.build_tag,
                    file.path.display()
                )));
            }
            self.files.write(&target, &compiled.xml).await?;
            debug!(id = %file.logical_id, path = %target.display(), "compiled output saved");
        }
        Ok(compiled.xml)
    }

    async fn commit_window(&self, summary: &mut RunSummary) {
        for core in Core::ALL {
            if self.index.pending(core) == 0 {
                continue;
            }
            match self.index.commit(core).await {
                Ok(n) => {
                    summary.commits += 1;
                    debug!(core = core.name(), ops = n, "window commit");
                }
                // Nothing was applied; the writes stay staged for the next commit.
                Err(e) => {
                    warn!(core = core.name(), error = %e, "window commit failed");
                    summary.window_commit_failures.push(e.to_string());
                }
            }
        }
    }

    /// Commit every core regardless of pending counts. Failures are
    /// recorded; documents committed earlier stay committed.
    async fn final_commit(&self, summary: &mut RunSummary) {
        for core in Core::ALL {
            match self.index.commit(core).await {
                Ok(_) => summary.commits += 1,
                Err(e) => {
                    error!(core = core.name(), error = %e, "final commit failed");
                    summary.commit_failures.push(e.to_string());
                }
            }
        }
    }

    /// For each touched section, make the lowest-id claimant the only
    /// document in the index carrying the section-start marker.
    async fn reconcile_sections(&self, touched: &BTreeSet<SectionKey>, summary: &mut RunSummary) {
        if touched.is_empty() {
            return;
        }
        for section in touched {
            let claimants = match self.relational.section_claimants(section).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(section = %section.name, error = %e, "section lookup failed");
                    continue;
                }
            };
            let Some((first, rest)) = claimants.split_first() else {
                continue;
            };
            let mut staged = self
                .index
                .set_field(Core::Docs, first, SECTION_START_FIELD, section.name.clone().into())
                .await;
            for id in rest {
                if staged.is_err() {
                    break;
                }
                staged = self
                    .index
                    .set_field(Core::Docs, id, SECTION_START_FIELD, serde_json::Value::Null)
                    .await;
            }
            match staged {
                Ok(()) => summary.sections_reconciled += 1,
                Err(e) => warn!(section = %section.name, error = %e, "section reconcile failed"),
            }
        }
        match self.index.commit(Core::Docs).await {
            Ok(_) => summary.commits += 1,
            Err(e) => {
                error!(error = %e, "section reconcile commit failed");
                summary.commit_failures.push(e.to_string());
            }
        }
    }
}
