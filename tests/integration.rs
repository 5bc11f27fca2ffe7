use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docsync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docsync");
    path
}

fn article(id: &str, title: &str) -> String {
    let src = id.split('.').next().unwrap();
    format!(
        r#"<pepkbd3>
  <artinfo id="{id}" j="{src}" arttype="ART" newsecnm="Papers">
    <artyear>2024</artyear><artvol>3</artvol><artiss>1</artiss><artpgrg>1-12</artpgrg>
    <arttitle>{title}</arttitle>
    <artauth><aut><nfirst>Melanie</nfirst><nlast>Klein</nlast></aut></artauth>
  </artinfo>
  <body><p>Body of {id}.</p></body>
</pepkbd3>"#
    )
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let xml_dir = root.join("xml").join("ABC");
    fs::create_dir_all(&xml_dir).unwrap();
    for (id, title) in [
        ("ABC.003.0001A", "Envy and Gratitude"),
        ("ABC.003.0015A", "Notes on Schizoid Mechanisms"),
        ("ABC.003.0030A", "On Loneliness"),
    ] {
        fs::write(xml_dir.join(format!("{}(bKBD3).xml", id)), article(id, title)).unwrap();
    }

    let config_content = format!(
        r#"[db]
path = "{root}/data/docsync.sqlite"

[index]
path = "{root}/data/docsync-index.sqlite"

[files]
root = "{root}/xml"

[report]
dir = "{root}/reports"

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docsync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docsync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_stores() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docsync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/docsync.sqlite").exists());
    assert!(tmp.path().join("data/docsync-index.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_docsync(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_docsync(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_load_then_reload_is_incremental() {
    let (tmp, config_path) = setup_test_env();
    let report = tmp.path().join("first.xml");

    let (stdout, stderr, success) = run_docsync(
        &config_path,
        &["load", "--no-check", "--report", report.to_str().unwrap()],
    );
    assert!(success, "load failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("processed: 3"));
    assert!(stdout.contains("new documents: 3"));
    assert!(stdout.trim_end().ends_with("ok"));
    assert!(fs::read_to_string(&report).unwrap().contains("<iss>1</iss>"));

    let (stdout, _, success) = run_docsync(&config_path, &["load", "--no-check"]);
    assert!(success);
    assert!(stdout.contains("processed: 0"));
    assert!(stdout.contains("skipped (current): 3"));
}

#[test]
fn test_load_force_and_key() {
    let (_tmp, config_path) = setup_test_env();
    run_docsync(&config_path, &["load", "--no-check"]);

    let (stdout, _, success) = run_docsync(
        &config_path,
        &["load", "--no-check", "--force", "--key", "ABC.003.0015"],
    );
    assert!(success);
    assert!(stdout.contains("listed: 1 files"));
    assert!(stdout.contains("processed: 1"));
    assert!(stdout.contains("new documents: 0"));
}

#[test]
fn test_load_without_confirmation_aborts() {
    let (_tmp, config_path) = setup_test_env();
    // stdin is empty, so the prompt reads no answer.
    let (stdout, _, success) = run_docsync(&config_path, &["load"]);
    assert!(success);
    assert!(stdout.contains("Aborted"));
}

#[test]
fn test_load_unknown_mode_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, success) = run_docsync(&config_path, &["load", "--no-check", "--mode", "sideways"]);
    assert!(!success);
}

#[test]
fn test_whatsnew_from_history() {
    let (tmp, config_path) = setup_test_env();
    run_docsync(&config_path, &["load", "--no-check"]);

    let out = tmp.path().join("history.xml");
    let (stdout, stderr, success) = run_docsync(
        &config_path,
        &["whatsnew", "--days", "1", "--out", out.to_str().unwrap()],
    );
    assert!(success, "whatsnew failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("3 documents in 1 issues"));
    let text = fs::read_to_string(&out).unwrap();
    assert!(text.contains("<article id='ABC.003.0030A'>"));
}

#[test]
fn test_whatsnew_empty_writes_nothing() {
    let (tmp, config_path) = setup_test_env();
    run_docsync(&config_path, &["init"]);
    let out = tmp.path().join("none.xml");
    let (stdout, _, success) = run_docsync(
        &config_path,
        &["whatsnew", "--days", "1", "--out", out.to_str().unwrap()],
    );
    assert!(success);
    assert!(stdout.contains("Nothing tracked"));
    assert!(!out.exists());
}

#[test]
fn test_most_viewed_json() {
    let (_tmp, config_path) = setup_test_env();
    run_docsync(&config_path, &["load", "--no-check"]);
    for _ in 0..2 {
        run_docsync(&config_path, &["view", "ABC.003.0015A"]);
    }
    run_docsync(&config_path, &["view", "ABC.003.0001A"]);

    let (stdout, stderr, success) = run_docsync(
        &config_path,
        &["most-viewed", "--years", "all", "--json"],
    );
    assert!(success, "most-viewed failed: stdout={}, stderr={}", stdout, stderr);
    let rows: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["document_id"], "ABC.003.0015A");
    assert_eq!(rows[0]["last12months"], 2);
}

#[test]
fn test_most_viewed_rejects_bad_glob() {
    let (_tmp, config_path) = setup_test_env();
    run_docsync(&config_path, &["init"]);
    let (_, stderr, success) =
        run_docsync(&config_path, &["most-viewed", "--title", "Envy%"]);
    assert!(!success);
    assert!(stderr.contains("invalid filter"));
}

#[test]
fn test_most_cited_table() {
    let (_tmp, config_path) = setup_test_env();
    run_docsync(&config_path, &["init"]);
    let (stdout, _, success) = run_docsync(&config_path, &["most-cited", "--period", "10"]);
    assert!(success);
    assert!(stdout.contains("Most cited"));
    assert!(stdout.contains("0 matching documents"));
}

#[test]
fn test_stats_and_reset() {
    let (_tmp, config_path) = setup_test_env();
    run_docsync(&config_path, &["load", "--no-check"]);

    let (stdout, _, success) = run_docsync(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Tracked:     3"));

    let (stdout, _, success) = run_docsync(&config_path, &["reset", "--no-check"]);
    assert!(success);
    assert!(stdout.contains("all cores emptied"));

    let (stdout, _, _) = run_docsync(&config_path, &["stats"]);
    assert!(stdout.contains("Tracked:     0"));
    let (stdout, _, _) = run_docsync(&config_path, &["load", "--no-check"]);
    assert!(stdout.contains("processed: 3"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_docsync(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("nope.toml"));
}
