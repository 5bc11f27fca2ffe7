//! End-to-end load runs over a temporary XML tree.
//!
//! Each test drives `SyncController` against real SQLite relational
//! storage and the in-memory index.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use docsync::compiler::PassthroughCompiler;
use docsync::config::Config;
use docsync::file_store::LocalFileStore;
use docsync::index::{Core, MemoryIndex, SearchIndex, SECTION_START_FIELD};
use docsync::ingest::{RunMode, RunOptions, RunSummary, SyncController};
use docsync::relational::RelationalStore;
use tempfile::TempDir;

struct Env {
    tmp: TempDir,
    config: Config,
    files: LocalFileStore,
    relational: RelationalStore,
    index: MemoryIndex,
}

impl Env {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        fs::create_dir_all(&config.files.root).unwrap();
        let files = LocalFileStore::new(&config.files).unwrap();
        let relational = RelationalStore::open(&config).await.unwrap();
        Self {
            tmp,
            config,
            files,
            relational,
            index: MemoryIndex::new(),
        }
    }

    fn report_path(&self, name: &str) -> PathBuf {
        self.tmp.path().join("reports").join(name)
    }

    /// Write `ABC.001.0001A(bKBD3).xml`-style raw files under `xml/<src>/`.
    fn add(&self, id: &str, body: &str) -> PathBuf {
        let src = id.split('.').next().unwrap();
        let dir = self.config.files.root.join(src);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}(bKBD3).xml", id));
        fs::write(&path, body).unwrap();
        path
    }

    async fn run(&self, opts: RunOptions) -> RunSummary {
        let compiler = Box::new(PassthroughCompiler::new(self.config.build.output.clone()));
        let mut controller =
            SyncController::new(&self.config, &self.files, &self.relational, &self.index, compiler);
        controller.run(&opts).await.unwrap()
    }
}

fn article(id: &str, issue: &str, section: Option<&str>) -> String {
    let src = id.split('.').next().unwrap();
    let newsecnm = section
        .map(|s| format!(r#" newsecnm="{}""#, s))
        .unwrap_or_default();
    format!(
        r#"<pepkbd3>
  <artinfo id="{id}" j="{src}" arttype="ART"{newsecnm}>
    <artyear>2020</artyear><artvol>1</artvol><artiss>{issue}</artiss><artpgrg>1-10</artpgrg>
    <arttitle>Article {id}</arttitle>
    <artauth><aut><nfirst>Sigmund</nfirst><nlast>Freud</nlast></aut></artauth>
  </artinfo>
  <body><p>Some body text for {id}.</p></body>
  <bib><be id="B001" rx="XYZ.002.0003A">A reference</be></bib>
</pepkbd3>"#
    )
}

fn opts(report: PathBuf) -> RunOptions {
    RunOptions {
        report_path: Some(report),
        report_seed: Some(7),
        ..Default::default()
    }
}

fn touch_later(path: &Path) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(120))
        .unwrap();
}

#[tokio::test]
async fn second_run_skips_current_documents() {
    let env = Env::new().await;
    for n in 1..=3 {
        let id = format!("ABC.001.000{}A", n);
        env.add(&id, &article(&id, "1", None));
    }

    let first = env.run(opts(env.report_path("first.xml"))).await;
    assert_eq!(first.listed, 3);
    assert_eq!(first.processed, 3);
    assert_eq!(first.new_documents, 3);
    assert_eq!(first.failed, 0);
    assert!(!first.is_fatal());
    assert_eq!(env.index.len(Core::Docs), 3);

    let second = env.run(opts(env.report_path("second.xml"))).await;
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.new_documents, 0);
    assert!(!env.report_path("second.xml").exists());
}

#[tokio::test]
async fn force_reprocesses_without_new_documents() {
    let env = Env::new().await;
    for n in 1..=3 {
        let id = format!("ABC.001.000{}A", n);
        env.add(&id, &article(&id, "1", None));
    }
    env.run(opts(env.report_path("a.xml"))).await;

    let forced = env
        .run(RunOptions {
            force: true,
            ..opts(env.report_path("b.xml"))
        })
        .await;
    assert_eq!(forced.processed, 3);
    assert_eq!(forced.skipped, 0);
    assert_eq!(forced.new_documents, 0);
    assert_eq!(env.relational.counts().await.unwrap().tracked, 3);
}

#[tokio::test]
async fn newer_file_is_reprocessed() {
    let env = Env::new().await;
    let mut paths = Vec::new();
    for n in 1..=3 {
        let id = format!("ABC.001.000{}A", n);
        paths.push(env.add(&id, &article(&id, "1", None)));
    }
    env.run(opts(env.report_path("a.xml"))).await;

    touch_later(&paths[1]);
    let again = env.run(opts(env.report_path("b.xml"))).await;
    assert_eq!(again.processed, 1);
    assert_eq!(again.skipped, 2);
}

#[tokio::test]
async fn broken_document_does_not_stop_the_run() {
    let env = Env::new().await;
    env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));
    env.add("ABC.001.0002A", "<pepkbd3><artinfo id='ABC.001.0002A'>");
    env.add("ABC.001.0003A", &article("ABC.001.0003A", "1", None));

    let summary = env.run(opts(env.report_path("a.xml"))).await;
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.compile_failed, 1);
    assert_eq!(summary.compile_passed, 2);
    assert!(!summary.is_fatal());
    assert!(env.index.get(Core::Docs, "ABC.001.0002A").await.unwrap().is_none());
    assert!(env.relational.tracked("ABC.001.0002A").await.unwrap().is_none());
}

#[tokio::test]
async fn new_documents_are_reported_per_issue() {
    let mut env = Env::new().await;
    env.config.loader.ignore_sources = vec!["NEWJ".to_string()];
    env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));
    env.add("ABC.001.0002A", &article("ABC.001.0002A", "1", None));
    env.add("ABC.001.0100A", &article("ABC.001.0100A", "2", None));
    env.add("NEWJ.001.0001A", &article("NEWJ.001.0001A", "1", None));

    let report = env.report_path("updates.xml");
    let summary = env.run(opts(report.clone())).await;
    assert_eq!(summary.new_documents, 4);
    assert_eq!(summary.reported_issues, 2);
    assert_eq!(summary.report_path.as_deref(), Some(report.as_path()));

    let text = fs::read_to_string(&report).unwrap();
    assert!(text.contains("<iss>1</iss>"));
    assert!(text.contains("<iss>2</iss>"));
    assert!(text.contains("<article id='ABC.001.0002A'>"));
    assert!(!text.contains("NEWJ.001.0001A"));
}

#[tokio::test]
async fn report_can_come_from_tracking_history() {
    let env = Env::new().await;
    env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));
    env.run(opts(env.report_path("live.xml"))).await;

    let report = env.report_path("history.xml");
    let summary = env
        .run(RunOptions {
            report_days: Some(1),
            ..opts(report.clone())
        })
        .await;
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.reported_issues, 1);
    assert!(fs::read_to_string(&report)
        .unwrap()
        .contains("ABC.001.0001A"));
}

#[tokio::test]
async fn reverse_run_leaves_section_start_on_lowest_id() {
    let env = Env::new().await;
    env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", Some("Papers")));
    env.add("ABC.001.0002A", &article("ABC.001.0002A", "1", Some("Papers")));
    env.add("ABC.001.0003A", &article("ABC.001.0003A", "1", Some("Reviews")));

    let summary = env
        .run(RunOptions {
            reverse: true,
            ..opts(env.report_path("a.xml"))
        })
        .await;
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.sections_reconciled, 2);

    let first = env.index.get(Core::Docs, "ABC.001.0001A").await.unwrap().unwrap();
    let second = env.index.get(Core::Docs, "ABC.001.0002A").await.unwrap().unwrap();
    let reviews = env.index.get(Core::Docs, "ABC.001.0003A").await.unwrap().unwrap();
    assert_eq!(first.field_str(SECTION_START_FIELD), Some("Papers"));
    assert!(second.field(SECTION_START_FIELD).is_none());
    assert_eq!(reviews.field_str(SECTION_START_FIELD), Some("Reviews"));
}

#[tokio::test]
async fn split_runs_cover_the_list_once() {
    let env = Env::new().await;
    for n in 1..=20 {
        let id = format!("ABC.001.{:04}A", n);
        env.add(&id, &article(&id, "1", None));
    }

    let forward = env
        .run(RunOptions {
            halfway: true,
            ..opts(env.report_path("f.xml"))
        })
        .await;
    assert_eq!(forward.listed, 15);
    assert_eq!(forward.processed, 15);

    let reverse = env
        .run(RunOptions {
            halfway: true,
            reverse: true,
            ..opts(env.report_path("r.xml"))
        })
        .await;
    assert_eq!(reverse.listed, 15);
    assert_eq!(reverse.processed, 5);
    assert_eq!(reverse.skipped, 10);
    assert_eq!(env.index.len(Core::Docs), 20);
}

#[tokio::test]
async fn failed_final_commit_makes_the_run_fatal() {
    let env = Env::new().await;
    env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));
    env.index.fail_commits(Core::Authors);

    let summary = env.run(opts(env.report_path("a.xml"))).await;
    assert!(summary.is_fatal());
    assert_eq!(summary.commit_failures.len(), 1);
    assert!(summary.to_string().ends_with("failed"));
    // The docs core commits independently.
    assert_eq!(env.index.len(Core::Docs), 1);
}

#[tokio::test]
async fn commit_window_makes_documents_visible_mid_run() {
    let mut env = Env::new().await;
    env.config.loader.commit_limit = 2;
    for n in 1..=5 {
        let id = format!("ABC.001.000{}A", n);
        env.add(&id, &article(&id, "1", None));
    }

    let summary = env.run(opts(env.report_path("a.xml"))).await;
    assert_eq!(summary.processed, 5);
    // Two windows of two documents each commit every non-empty core.
    assert!(summary.commits >= 4 + Core::ALL.len() as u64);
    assert_eq!(env.index.pending(Core::Docs), 0);
}

#[tokio::test]
async fn failed_window_commit_is_retried_by_the_final_commit() {
    let mut env = Env::new().await;
    env.config.loader.commit_limit = 1;
    for n in 1..=3 {
        let id = format!("ABC.001.000{}A", n);
        env.add(&id, &article(&id, "1", None));
    }
    env.index.fail_next_commits(Core::Docs, 1);

    let summary = env.run(opts(env.report_path("a.xml"))).await;
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.window_commit_failures.len(), 1);
    assert!(summary.commit_failures.is_empty());
    assert!(summary.to_string().contains("window commit failed"));
    assert_eq!(env.index.len(Core::Docs), 3);
    assert!(env.index.get(Core::Docs, "ABC.001.0001A").await.unwrap().is_some());
    assert_eq!(env.index.pending(Core::Docs), 0);
}

#[tokio::test]
async fn concurrent_forward_and_reverse_runs_mark_one_start_per_section() {
    let mut env = Env::new().await;
    env.config.loader.commit_limit = 2;
    let sections = [
        ("ABC.001.0001A", "1", "Papers"),
        ("ABC.001.0002A", "1", "Papers"),
        ("ABC.001.0003A", "1", "Papers"),
        ("ABC.001.0004A", "1", "Reviews"),
        ("ABC.001.0005A", "1", "Reviews"),
        ("ABC.001.0006A", "2", "Papers"),
        ("ABC.001.0007A", "2", "Papers"),
        ("ABC.001.0008A", "2", "Papers"),
    ];
    for (id, issue, section) in sections {
        env.add(id, &article(id, issue, Some(section)));
    }

    let (forward, reverse) = tokio::join!(
        env.run(opts(env.report_path("f.xml"))),
        env.run(RunOptions {
            reverse: true,
            ..opts(env.report_path("r.xml"))
        }),
    );
    assert!(!forward.is_fatal());
    assert!(!reverse.is_fatal());
    assert_eq!(env.index.len(Core::Docs), sections.len());

    let starts = ["ABC.001.0001A", "ABC.001.0004A", "ABC.001.0006A"];
    for (id, _, section) in sections {
        let doc = env.index.get(Core::Docs, id).await.unwrap().unwrap();
        if starts.contains(&id) {
            assert_eq!(doc.field_str(SECTION_START_FIELD), Some(section), "{id}");
        } else {
            assert!(doc.field(SECTION_START_FIELD).is_none(), "{id}");
        }
    }
}

#[tokio::test]
async fn compile_and_save_then_load_precompiled() {
    let env = Env::new().await;
    let raw = env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));
    env.add("ABC.001.0002A", &article("ABC.001.0002A", "1", None));

    let saved = env
        .run(RunOptions {
            mode: RunMode::CompileAndSave,
            ..opts(env.report_path("a.xml"))
        })
        .await;
    assert_eq!(saved.saved, 2);
    assert!(env.index.is_empty(Core::Docs));
    let compiled = raw.with_file_name("ABC.001.0001A(bEXP_ARCH1).xml");
    assert!(compiled.exists());

    let again = env
        .run(RunOptions {
            mode: RunMode::CompileAndSave,
            ..opts(env.report_path("b.xml"))
        })
        .await;
    assert_eq!(again.saved, 0);
    assert_eq!(again.skipped, 2);

    let loaded = env
        .run(RunOptions {
            mode: RunMode::LoadOnly,
            ..opts(env.report_path("c.xml"))
        })
        .await;
    assert_eq!(loaded.build, "bEXP_ARCH1");
    assert_eq!(loaded.processed, 2);
    assert_eq!(loaded.compile_passed, 0);
    assert_eq!(env.index.len(Core::Docs), 2);
}

#[tokio::test]
async fn smart_mode_prefers_current_compiled_sibling() {
    let env = Env::new().await;
    let raw = env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));
    env.run(RunOptions {
        mode: RunMode::CompileAndSave,
        ..opts(env.report_path("a.xml"))
    })
    .await;

    let smart = env
        .run(RunOptions {
            mode: RunMode::Smart,
            ..opts(env.report_path("b.xml"))
        })
        .await;
    assert_eq!(smart.processed, 1);
    assert_eq!(smart.compile_passed, 0);

    touch_later(&raw);
    let recompiled = env
        .run(RunOptions {
            mode: RunMode::Smart,
            ..opts(env.report_path("c.xml"))
        })
        .await;
    assert_eq!(recompiled.processed, 1);
    assert_eq!(recompiled.compile_passed, 1);
}

#[tokio::test]
async fn key_and_glossary_filters_narrow_the_listing() {
    let env = Env::new().await;
    env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));
    env.add("XYZ.001.0001A", &article("XYZ.001.0001A", "1", None));
    env.add("ZBK.069.0001A", &article("ZBK.069.0001A", "1", None));

    let keyed = env
        .run(RunOptions {
            key: Some("xyz".into()),
            ..opts(env.report_path("a.xml"))
        })
        .await;
    assert_eq!(keyed.listed, 1);
    assert!(env.index.get(Core::Docs, "XYZ.001.0001A").await.unwrap().is_some());

    let glossary = env
        .run(RunOptions {
            glossary_only: true,
            ..opts(env.report_path("b.xml"))
        })
        .await;
    assert_eq!(glossary.listed, 1);
    assert_eq!(glossary.processed, 1);
    assert_eq!(env.index.len(Core::Glossary), 1);
    assert!(env.index.get(Core::Docs, "ZBK.069.0001A").await.unwrap().is_none());
}

#[tokio::test]
async fn single_file_run_and_missing_file() {
    let env = Env::new().await;
    let path = env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));
    env.add("ABC.001.0002A", &article("ABC.001.0002A", "1", None));

    let single = env
        .run(RunOptions {
            file: Some(path),
            ..opts(env.report_path("a.xml"))
        })
        .await;
    assert_eq!(single.listed, 1);
    assert_eq!(single.processed, 1);

    let compiler = Box::new(PassthroughCompiler::new("bEXP_ARCH1"));
    let mut controller =
        SyncController::new(&env.config, &env.files, &env.relational, &env.index, compiler);
    let missing = controller
        .run(&RunOptions {
            file: Some(env.tmp.path().join("nope(bKBD3).xml")),
            ..Default::default()
        })
        .await;
    assert!(matches!(missing, Err(e) if e.is_fatal()));
}

#[tokio::test]
async fn stop_flag_ends_the_run_early() {
    let env = Env::new().await;
    env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));

    let compiler = Box::new(PassthroughCompiler::new("bEXP_ARCH1"));
    let mut controller =
        SyncController::new(&env.config, &env.files, &env.relational, &env.index, compiler);
    controller
        .stop_handle()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let summary = controller.run(&opts(env.report_path("a.xml"))).await.unwrap();
    assert!(summary.stopped_early);
    assert_eq!(summary.evaluated, 0);
}

#[tokio::test]
async fn connections_are_counted_per_run() {
    let env = Env::new().await;
    env.add("ABC.001.0001A", &article("ABC.001.0001A", "1", None));
    let summary = env.run(opts(env.report_path("a.xml"))).await;
    assert!(summary.connections > 0);
}
