//! Command line handling tests
//!
//! Everything here fails (or exits) before the netlink channel is opened,
//! so no privileges are needed.

use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_help_lists_options() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("topfast");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--sort"))
        .stdout(predicate::str::contains("--interval"))
        .stdout(predicate::str::contains("--history"))
        .stdout(predicate::str::contains("--top"))
        .stdout(predicate::str::contains("--raw"));
}

#[test]
fn test_version() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("topfast");
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_sort_criterion_rejected() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("topfast");
    cmd.args(["-s", "memory"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value 'memory'"));
}

#[test]
fn test_bad_interval_rejected() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("topfast");
    cmd.args(["-i", "sometimes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--interval"));
}

#[test]
fn test_raw_and_format_conflict() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("topfast");
    cmd.args(["-r", "--format", "json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_missing_config_file() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("topfast");
    cmd.args(["--config", "/nonexistent/topfast.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("topfast.toml");
    fs::write(&path, "[engine]\nmax_walk_depth = 0\n").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("topfast");
    cmd.arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_walk_depth"));
}

#[test]
fn test_zero_max_depth_flag_rejected() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("topfast");
    cmd.args(["--max-depth", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_walk_depth must be >= 1"));
}

#[test]
fn test_unwritable_output_file() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("topfast");
    cmd.args(["-o", "/nonexistent/dir/report.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to create output file"));
}
