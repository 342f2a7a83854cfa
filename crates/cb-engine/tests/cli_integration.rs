//! CLI integration tests
//!
//! Tests the cb-deploy CLI using assert_cmd. Nothing here opens an SSH
//! connection; every test stops at argument handling or key parsing.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn cb_deploy() -> Command {
    Command::cargo_bin("cb-deploy")
        .expect("Failed to locate cb-deploy binary - ensure it's built before running tests")
}

fn key_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp key file");
    file.write_all(contents.as_bytes()).expect("write key file");
    file
}

#[test]
fn test_cli_help() {
    cb_deploy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cb-deploy"))
        .stdout(predicate::str::contains(
            "CloudBox Install Protocol deployment engine",
        ))
        .stdout(predicate::str::contains("--publish"))
        .stdout(predicate::str::contains("--script"));
}

#[test]
fn test_cli_version() {
    cb_deploy()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cb-deploy"));
}

#[test]
fn test_cli_requires_connection_arguments() {
    cb_deploy()
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"))
        .stderr(predicate::str::contains("--host"));
}

#[test]
fn test_cli_rejects_unknown_script() {
    cb_deploy()
        .args([
            "--host", "127.0.0.1", "--username", "deploy", "--key", "/dev/null",
            "--deployment-id", "1", "--project-id", "1", "--name", "app",
            "--script", "restart",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_cli_script_conflicts_with_repo() {
    cb_deploy()
        .args([
            "--host", "127.0.0.1", "--username", "deploy", "--key", "/dev/null",
            "--deployment-id", "1", "--project-id", "1", "--name", "app",
            "--script", "install",
            "--repo", "https://github.com/acme/app.git",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_cli_rejects_malformed_publish_flag() {
    let key = key_file("placeholder");
    let key_path = key.path().to_string_lossy().to_string();
    cb_deploy()
        .args([
            "--host", "127.0.0.1", "--username", "deploy",
            "--key", key_path.as_str(),
            "--deployment-id", "1", "--project-id", "1", "--name", "app",
            "--publish", "web:3000",
            "--script", "status",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid --publish"));
}

#[test]
fn test_cli_unusable_key_fails_before_connecting() {
    // Garbage key material fails key parsing, which happens before any
    // network activity.
    let key = key_file("this is not a private key");
    let key_path = key.path().to_string_lossy().to_string();
    cb_deploy()
        .args([
            "--host", "127.0.0.1", "--port", "1", "--username", "deploy",
            "--key", key_path.as_str(),
            "--deployment-id", "1", "--project-id", "1", "--name", "app",
            "--script", "status",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("private key"));
}

#[test]
fn test_cli_missing_key_file() {
    cb_deploy()
        .args([
            "--host", "127.0.0.1", "--username", "deploy",
            "--key", "/nonexistent/path/to/key",
            "--deployment-id", "1", "--project-id", "1", "--name", "app",
            "--script", "status",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read key file"));
}
