//! End-to-end tests for the corral CLI.
//!
//! These run the real binary, so every test forks real worker processes.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// A configuration file in a temporary directory.
struct TestConfig {
    _temp_dir: TempDir,
    path: PathBuf,
}

impl TestConfig {
    fn new(json: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("pool.json");
        fs::write(&path, json).expect("Failed to write config");
        Self {
            _temp_dir: temp_dir,
            path,
        }
    }
}

fn corral() -> Command {
    let mut cmd = Command::cargo_bin("corral").expect("binary builds");
    cmd.timeout(std::time::Duration::from_secs(30));
    cmd
}

// =============================================================================
// run
// =============================================================================

#[test]
fn test_run_echoes_upper_case() {
    corral()
        .args(["run", "--workers", "2", "--tasks", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TASK-0"))
        .stdout(predicate::str::contains("TASK-3"))
        .stdout(predicate::str::contains("4 tasks, 4 replies"));
}

#[test]
fn test_run_over_stream_socket() {
    corral()
        .args(["run", "--workers", "2", "--tasks", "3", "--ipc", "stream_socket"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TASK-2"))
        .stdout(predicate::str::contains("3 tasks, 3 replies"));
}

#[test]
fn test_run_with_message_protocol() {
    corral()
        .args(["run", "--workers", "1", "--tasks", "2", "--protocol", "message"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TASK-1"));
}

#[test]
fn test_run_with_reload() {
    corral()
        .args(["run", "--workers", "2", "--tasks", "2", "--reload"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Reload #1 complete"))
        .stdout(predicate::str::contains("1 reloads"));
}

#[test]
fn test_run_from_config_file() {
    let config = TestConfig::new(r#"{ "worker_num": 3, "ipc_mode": "unix_socket" }"#);
    corral()
        .arg("run")
        .arg("--config")
        .arg(&config.path)
        .args(["--tasks", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 tasks, 3 replies"));
}

#[test]
fn test_run_more_tasks_than_one_worker_buffers() {
    corral()
        .args(["run", "--workers", "1", "--tasks", "3000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3000 tasks, 3000 replies"));
}

#[test]
fn test_run_many_tasks_over_msg_queue() {
    corral()
        .args(["run", "--workers", "2", "--tasks", "2000", "--ipc", "msg_queue"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2000 tasks, 2000 replies"));
}

#[test]
fn test_run_rejects_zero_workers() {
    corral()
        .args(["run", "--workers", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker_num"));
}

#[test]
fn test_run_rejects_unknown_ipc() {
    corral()
        .args(["run", "--ipc", "carrier_pigeon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown ipc mode"));
}

// =============================================================================
// check
// =============================================================================

#[test]
fn test_check_valid_config() {
    let config = TestConfig::new(r#"{ "worker_num": 4, "protocol": "task" }"#);
    corral()
        .arg("check")
        .arg(&config.path)
        .assert()
        .success()
        .stdout(predicate::str::contains("4 workers"));
}

#[test]
fn test_check_invalid_combination() {
    let config = TestConfig::new(r#"{ "ipc_mode": "stream_socket", "protocol": "task" }"#);
    corral().arg("check").arg(&config.path).assert().failure();
}

#[test]
fn test_check_malformed_json() {
    let config = TestConfig::new("{ worker_num: ");
    corral().arg("check").arg(&config.path).assert().failure();
}

// =============================================================================
// serve --listen / call
// =============================================================================

#[test]
fn test_call_reaches_listening_pool() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let socket = temp_dir.path().join("corral.sock");
    let bin = assert_cmd::cargo::cargo_bin("corral");
    let mut server = std::process::Command::new(&bin)
        .args(["serve", "--workers", "2", "--ipc", "stream_socket", "--listen"])
        .arg(&socket)
        .stdout(std::process::Stdio::null())
        .spawn()
        .expect("serve starts");

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !socket.exists() && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let outcome = corral()
        .args(["call", socket.to_str().unwrap(), "hello"])
        .assert()
        .try_success();

    // SIGTERM for a graceful stop.
    let _ = std::process::Command::new("kill")
        .args(["-TERM", &server.id().to_string()])
        .status();
    let _ = server.wait();

    outcome
        .expect("call succeeds")
        .stdout(predicate::str::contains("HELLO"));
}
