//! Drives the `harvest` binary. None of these touch the network.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use paper_harvest::state::{FileLock, StateStore};
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[storage]
data_root = "{}/data"

[schedule]
cron = "30 4 1 * *"

[instances.physics.archive]
categories = ["physics.optics", "quant-ph"]

[[instances.biology.journals]]
name = "plos-bio"
feed_url = "https://journals.example.org/plosbiology/rss"
"#,
        root.display()
    );
    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, i32) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    )
}

#[test]
fn missing_config_exits_with_fatal_code() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, code) = run_harvest(&tmp.path().join("nope.toml"), &["instances"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn invalid_config_exits_with_fatal_code() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bad.toml");
    fs::write(
        &path,
        "[storage]\ndata_root = \"/tmp/x\"\n\n[instances.empty]\nmax_failure_ratio = 0.5\n",
    )
    .unwrap();
    let (_, stderr, code) = run_harvest(&path, &["instances"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("needs at least one source"), "stderr: {}", stderr);
}

#[test]
fn instances_lists_sources() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, code) = run_harvest(&config, &["instances"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("physics"));
    assert!(stdout.contains("archive[physics.optics,quant-ph]"));
    assert!(stdout.contains("journal:plos-bio"));
    assert!(stdout.contains("never"));
}

#[test]
fn status_before_first_cycle() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, code) = run_harvest(&config, &["status", "--instance", "physics"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Lock:        free"));
    assert!(stdout.contains("no cycle has run yet"));
}

#[test]
fn unknown_instance_is_fatal() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, code) = run_harvest(&config, &["run-cycle", "--instance", "chemistry"]);
    assert_eq!(code, 2);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["status"], "aborted");
    assert!(report["reason"].as_str().unwrap().contains("Unknown instance"));
}

#[test]
fn held_lock_exits_with_busy_code() {
    let (tmp, config) = setup_test_env();
    let store = StateStore::new(tmp.path().join("data"));
    store.ensure_layout("physics").unwrap();
    let _held = FileLock::try_acquire(&store.lock_path("physics"))
        .unwrap()
        .unwrap();

    let (stdout, _, code) = run_harvest(&config, &["run-cycle", "--instance", "physics"]);
    assert_eq!(code, 3);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["status"], "skipped");
    assert_eq!(report["instance"], "physics");
    assert!(store.load("physics").unwrap().is_none());
}

#[test]
fn schedule_install_writes_cron_file() {
    let (tmp, config) = setup_test_env();
    let (stdout, _, code) = run_harvest(&config, &["schedule", "--install"]);
    assert_eq!(code, 0, "stdout: {}", stdout);
    let cron = fs::read_to_string(tmp.path().join("data").join("harvest.cron")).unwrap();
    assert!(cron.starts_with("30 4 1 * * "));
    assert!(cron.trim_end().ends_with("schedule"));
    assert!(cron.contains("harvest.toml"));
}

#[test]
fn init_store_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, _, code) = run_harvest(&config, &["init-store"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Vector store initialized"));
    assert!(tmp.path().join("data").join("vectors.sqlite").exists());

    let (_, _, again) = run_harvest(&config, &["init-store"]);
    assert_eq!(again, 0);
}

#[test]
fn storage_reports_usage() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, code) = run_harvest(&config, &["storage", "--instance", "physics"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Storage for physics"));
    assert!(stdout.contains("Used:"));
}
