//! Binary-level smoke tests: argument surface and fatal startup behaviour.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn server_help_names_the_config_flag() {
    Command::cargo_bin("crewdeck-server")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn watcher_help_takes_no_positional_arguments() {
    Command::cargo_bin("crewdeck-watcher")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn server_exits_nonzero_on_unreadable_config() {
    Command::cargo_bin("crewdeck-server")
        .unwrap()
        .args(["--config", "/nonexistent/crewdeck.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read config"));
}

#[test]
fn watcher_exits_nonzero_on_malformed_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[server\nport=").unwrap();

    Command::cargo_bin("crewdeck-watcher")
        .unwrap()
        .args(["--config", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid config"));
}
