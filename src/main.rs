//! # docsync CLI
//!
//! The `docsync` binary loads a tree of XML documents into the relational
//! store and the search index, and runs the ranked reports over the result.
//!
//! ## Usage
//!
//! ```bash
//! docsync --config ./config/docsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsync init` | Create the relational schema and the index cores |
//! | `docsync load` | Compile and/or load changed documents |
//! | `docsync whatsnew --days N` | Issue-update report from recently tracked documents |
//! | `docsync most-viewed` | Ranked most-viewed report |
//! | `docsync most-cited` | Ranked most-cited report |
//! | `docsync view <id>` | Record a document view |
//! | `docsync stats` | Store and index counts |
//! | `docsync reset` | Delete all article data and empty every core |
//!
//! ## Examples
//!
//! ```bash
//! # Two loaders sharing the work from opposite ends
//! docsync load --no-check --halfway &
//! docsync load --no-check --halfway --reverse &
//!
//! # Reload one journal from precompiled files
//! docsync load --no-check --mode load --key IJP --force
//!
//! # Videos with "Freud" in the title, all time, as JSON
//! docsync most-viewed --content videos --years all --title 'Freud*' --json
//! ```

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

use docsync::compiler::PassthroughCompiler;
use docsync::config::{self, Config};
use docsync::file_store::LocalFileStore;
use docsync::index::{Core, IndexQuery, SearchIndex, SqliteIndex};
use docsync::ingest::{RunMode, RunOptions, SyncController};
use docsync::logging;
use docsync::progress::ProgressMode;
use docsync::query::{ContentClass, CountColumn, PublicationWindow, RankedQuerySpec, ReportFamily, Sort};
use docsync::ranked;
use docsync::relational::RelationalStore;
use docsync::stats;
use docsync::whatsnew::IssueUpdateReporter;

/// docsync: incremental XML document loader and ranked reports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docsync.toml` for an example.
#[derive(Parser)]
#[command(name = "docsync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the relational schema and the index cores. Idempotent.
    Init,

    /// Load changed documents into the relational store and the index.
    ///
    /// A document is processed when the index has no record of it, its
    /// recorded file timestamp is older than the file's, or `--force` is
    /// given.
    Load {
        /// Reprocess every listed document.
        #[arg(long)]
        force: bool,

        /// Walk the file list from the end.
        #[arg(long)]
        reverse: bool,

        /// Stop a few documents past the middle of the list.
        #[arg(long)]
        halfway: bool,

        /// Only documents whose id starts with this key (e.g. `IJP.051`).
        #[arg(long)]
        key: Option<String>,

        /// Load a single file.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Only walk this folder below the file root.
        #[arg(long)]
        subfolder: Option<PathBuf>,

        /// Only files modified after this date (YYYY-MM-DD).
        #[arg(long)]
        after: Option<NaiveDate>,

        /// load, compile, compile-save, compile-load-save or smart.
        #[arg(long, default_value = "compile")]
        mode: RunMode,

        /// Store paragraph text as a field on primary documents.
        #[arg(long)]
        include_paras: bool,

        /// Only glossary files.
        #[arg(long)]
        glossary_only: bool,

        /// Input build tag (overrides `build.input`).
        #[arg(long)]
        input_build: Option<String>,

        /// Issue-update report path.
        #[arg(long)]
        report: Option<PathBuf>,

        /// Build the report from documents tracked in the last N days.
        #[arg(long)]
        report_days: Option<u32>,

        /// Skip the confirmation prompt.
        #[arg(long)]
        no_check: bool,

        /// Progress on stderr: off, human or json. Defaults to human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Write the issue-update report for documents tracked in the last N days.
    Whatsnew {
        #[arg(long, default_value_t = 7)]
        days: u32,

        /// Report path (default: generated under `report.dir`).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Most-viewed documents.
    MostViewed {
        #[command(flatten)]
        filters: ReportFilters,

        /// 0 last calendar year, 1 last week, 2 last month, 3 last six
        /// months, 4 last twelve months.
        #[arg(long, default_value_t = 4)]
        period: u8,
    },

    /// Most-cited documents.
    MostCited {
        #[command(flatten)]
        filters: ReportFilters,

        /// 5, 10, 20 or all.
        #[arg(long, default_value = "all")]
        period: String,
    },

    /// Record a view of a document.
    View {
        id: String,

        #[arg(long, default_value = "Document")]
        view_type: String,
    },

    /// Show store and index counts.
    Stats,

    /// Delete all article data and empty every index core.
    Reset {
        #[arg(long)]
        no_check: bool,
    },
}

#[derive(clap::Args)]
struct ReportFilters {
    /// Author glob, e.g. `Freud*`.
    #[arg(long)]
    author: Option<String>,

    /// Title glob.
    #[arg(long)]
    title: Option<String>,

    /// Source title glob.
    #[arg(long)]
    source_name: Option<String>,

    /// Exact source code.
    #[arg(long)]
    source_code: Option<String>,

    /// journals, books, videos (any prefix) or all.
    #[arg(long)]
    content: Option<String>,

    /// Publication window in years back, or `all`.
    #[arg(long)]
    years: Option<String>,

    /// Minimum count in the selected period.
    #[arg(long)]
    min_count: Option<i64>,

    /// `none`, or a column with optional direction, e.g. `title:asc`.
    #[arg(long)]
    sort: Option<String>,

    #[arg(long)]
    limit: Option<u32>,

    #[arg(long, default_value_t = 0)]
    offset: u32,

    /// One JSON object per row instead of a table.
    #[arg(long)]
    json: bool,
}

impl ReportFilters {
    /// Apply the filters on top of the family defaults.
    fn apply(&self, spec: &mut RankedQuerySpec) -> anyhow::Result<()> {
        if self.author.is_some() {
            spec.author = self.author.clone();
        }
        if self.title.is_some() {
            spec.title = self.title.clone();
        }
        if self.source_name.is_some() {
            spec.source_name = self.source_name.clone();
        }
        if self.source_code.is_some() {
            spec.source_code = self.source_code.clone();
        }
        if let Some(content) = &self.content {
            spec.content_class = ContentClass::parse(content);
        }
        if let Some(years) = &self.years {
            spec.window = Some(PublicationWindow::parse(years)?);
        }
        if self.min_count.is_some() {
            spec.min_count = self.min_count;
        }
        if let Some(sort) = &self.sort {
            spec.sort = Sort::parse(sort, spec.family)?;
        }
        spec.limit = self.limit;
        spec.offset = self.offset;
        Ok(())
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    let mut stderr = std::io::stderr().lock();
    write!(stderr, "{} [y/N] ", prompt)?;
    stderr.flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn open_stores(cfg: &Config) -> anyhow::Result<(RelationalStore, SqliteIndex)> {
    let relational = RelationalStore::open(cfg)
        .await
        .with_context(|| format!("opening relational store {}", cfg.db.path.display()))?;
    let index = SqliteIndex::open(&cfg.index.path)
        .await
        .with_context(|| format!("opening search index {}", cfg.index.path.display()))?;
    Ok((relational, index))
}

async fn run_report(
    cfg: &Config,
    mut spec: RankedQuerySpec,
    filters: &ReportFilters,
) -> anyhow::Result<()> {
    filters.apply(&mut spec)?;
    let relational = RelationalStore::open(cfg).await?;
    let report = ranked::run(&relational, &spec, &cfg.sources).await?;
    if filters.json {
        ranked::print_json(&report)?;
    } else {
        ranked::print_table(&report);
    }
    relational.close().await;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_with_config(&cfg.logging);

    match cli.command {
        Commands::Init => {
            let (relational, index) = open_stores(&cfg).await?;
            relational.close().await;
            index.close().await;
            println!("Stores initialized successfully.");
        }
        Commands::Load {
            force,
            reverse,
            halfway,
            key,
            file,
            subfolder,
            after,
            mode,
            include_paras,
            glossary_only,
            input_build,
            report,
            report_days,
            no_check,
            progress,
        } => {
            let progress = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some("off") => ProgressMode::Off,
                Some("human") => ProgressMode::Human,
                Some("json") => ProgressMode::Json,
                Some(other) => bail!("unknown progress mode '{}'", other),
            };
            if !no_check
                && !confirm(&format!(
                    "Load from {} into {} and {}?",
                    cfg.files.root.display(),
                    cfg.db.path.display(),
                    cfg.index.path.display()
                ))?
            {
                println!("Aborted.");
                return Ok(());
            }

            let opts = RunOptions {
                force,
                reverse,
                halfway,
                key,
                file,
                subfolder,
                after,
                mode,
                include_paras,
                glossary_only,
                input_build,
                report_path: report,
                report_days,
                report_seed: None,
            };

            let files = LocalFileStore::new(&cfg.files)?;
            let (relational, index) = open_stores(&cfg).await?;
            let compiler = Box::new(PassthroughCompiler::new(cfg.build.output.clone()));
            let mut controller = SyncController::new(&cfg, &files, &relational, &index, compiler)
                .with_progress(progress.reporter());

            let stop = controller.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing the current document");
                    stop.store(true, Ordering::Relaxed);
                }
            });

            let summary = controller.run(&opts).await?;
            println!("{}", summary);
            relational.close().await;
            index.close().await;
            if summary.is_fatal() {
                bail!("load finished with {} commit failure(s)", summary.commit_failures.len());
            }
        }
        Commands::Whatsnew { days, out } => {
            let relational = RelationalStore::open(&cfg).await?;
            let mut reporter = IssueUpdateReporter::new(&cfg.report, &cfg.loader.ignore_sources);
            let articles = reporter.load_history(&relational, days).await?;
            match reporter.flush(out.as_deref())? {
                Some(flushed) => println!(
                    "{} documents in {} issues -> {}",
                    articles,
                    flushed.issues,
                    flushed.path.display()
                ),
                None => println!("Nothing tracked in the last {} days.", days),
            }
            relational.close().await;
        }
        Commands::MostViewed { filters, period } => {
            let mut spec = RankedQuerySpec::most_viewed();
            spec.period = CountColumn::view_period(period)
                .with_context(|| format!("view period must be 0-4, got {}", period))?;
            run_report(&cfg, spec, &filters).await?;
        }
        Commands::MostCited { filters, period } => {
            let mut spec = RankedQuerySpec::new(ReportFamily::MostCited);
            spec.period = CountColumn::cite_period(&period)
                .with_context(|| format!("citation period must be 5, 10, 20 or all, got '{}'", period))?;
            run_report(&cfg, spec, &filters).await?;
        }
        Commands::View { id, view_type } => {
            let relational = RelationalStore::open(&cfg).await?;
            relational.record_document_view(&id, &view_type).await?;
            relational.close().await;
            println!("Recorded {} view of {}.", view_type, id);
        }
        Commands::Stats => {
            let (relational, index) = open_stores(&cfg).await?;
            let report = stats::collect(&cfg, &relational, &index).await?;
            stats::print(&cfg, &report);
            relational.close().await;
            index.close().await;
        }
        Commands::Reset { no_check } => {
            if !no_check && !confirm("Delete ALL article data and empty every index core?")? {
                println!("Aborted.");
                return Ok(());
            }
            let (relational, index) = open_stores(&cfg).await?;
            let removed = relational.delete_all_article_data().await?;
            for core in Core::ALL {
                index.delete(core, &IndexQuery::all()).await?;
                index
                    .commit(core)
                    .await
                    .with_context(|| format!("emptying core {}", core.name()))?;
            }
            info!(rows = removed, "reset complete");
            println!("Removed {} rows; all cores emptied.", removed);
            relational.close().await;
            index.close().await;
        }
    }

    Ok(())
}
