//! End-to-end tests driving the `cchat` binary. These run with both
//! providers disabled, so they cover initialization, startup verification,
//! and the degraded paths that need no external gateway.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cchat_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cchat");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_content = format!(
        r#"[db]
path = "{}/data/corpus.sqlite"

[chunking]
chunk_chars = 200
overlap_chars = 20

[server]
bind = "127.0.0.1:7341"
"#,
        root.display()
    );

    let config_path = root.join("corpus.toml");
    fs::write(&config_path, config_content).unwrap();

    fs::write(
        root.join("notes.txt"),
        "Deployment notes.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    (tmp, config_path)
}

fn run_cchat(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cchat_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cchat binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cchat(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_cchat(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cchat(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_commands_refuse_to_run_without_init() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_cchat(&config_path, &["sessions", "list"]);
    assert!(!success, "expected failure before init");
    assert!(stderr.contains("cchat init"), "stderr was: {}", stderr);
}

#[test]
fn test_sessions_list_empty_after_init() {
    let (_tmp, config_path) = setup_test_env();
    run_cchat(&config_path, &["init"]);

    let (stdout, stderr, success) = run_cchat(&config_path, &["sessions", "list"]);
    assert!(success, "sessions list failed: {}", stderr);
    assert!(stdout.contains("No sessions"));
}

#[test]
fn test_ingest_fails_cleanly_when_embeddings_disabled() {
    let (tmp, config_path) = setup_test_env();
    run_cchat(&config_path, &["init"]);

    let notes = tmp.path().join("notes.txt");
    let (_, stderr, success) = run_cchat(&config_path, &["ingest", notes.to_str().unwrap()]);
    assert!(!success, "expected ingest to fail with disabled provider");
    assert!(stderr.contains("disabled"), "stderr was: {}", stderr);
}

#[test]
fn test_ingest_rejects_unknown_extension() {
    let (tmp, config_path) = setup_test_env();
    run_cchat(&config_path, &["init"]);

    let file = tmp.path().join("image.png");
    fs::write(&file, b"\x89PNG").unwrap();
    let (_, stderr, success) = run_cchat(&config_path, &["ingest", file.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("MIME"), "stderr was: {}", stderr);
}

#[test]
fn test_search_fails_cleanly_when_embeddings_disabled() {
    let (_tmp, config_path) = setup_test_env();
    run_cchat(&config_path, &["init"]);

    let (_, stderr, success) = run_cchat(&config_path, &["search", "kubernetes"]);
    assert!(!success, "expected search to fail with disabled provider");
    assert!(stderr.contains("retrieval unavailable"), "stderr was: {}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("corpus.toml");
    fs::write(
        &config_path,
        "[db]\npath = \"x.sqlite\"\n[chunking]\nchunk_chars = 100\noverlap_chars = 150\n",
    )
    .unwrap();

    let (_, stderr, success) = run_cchat(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("overlap_chars"), "stderr was: {}", stderr);
}
