//! Integration tests for `concprobe run`
//!
//! The "cluster" is a directory of marker files: a node is alive while
//! `up.<node>` exists. The workload removes `up.2` when asked to run above
//! the configured threshold.

#![cfg(unix)]
#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn write_config(dir: &Path, workload_run: &str, extra_search: &str) -> PathBuf {
    let state = dir.display();
    let config = format!(
        r#"
[search]
min_concurrency = 32
max_concurrency = 192
{extra_search}

[cluster]
server_nodes = [1, 2, 3]
driver_node = 4
artifacts_dir = "{state}/artifacts"
poll_interval = "5ms"

[cluster.commands]
start = "sh -c 'for n in $(echo $1 | tr , \" \"); do touch $0/up.$n; done' {state} {{nodes}}"
stop = "sh -c 'for n in $(echo $1 | tr , \" \"); do rm -f $0/up.$n; done' {state} {{nodes}}"
run = "sh -c {{cmd}}"
sql = "sh -c 'echo \"$1\" >> $0/sql.log' {state} {{statement}}"
alive = "test -f {state}/up.{{node}}"
replication = "true {{copies}}"

[workload]
name = "tpch"
queries = 3
database = "tpch"
tables = ["lineitem"]
run = "{workload_run}"
kill = "true"

[setup]
statements = ["SET CLUSTER SETTING kv.range_merge.queue_enabled = false;"]
"#
    );
    let path = dir.join("concprobe.toml");
    fs::write(&path, config).expect("write config");
    path
}

fn crash_above(dir: &Path, threshold: u32) -> String {
    format!(
        "test {{concurrency}} -le {threshold} || rm -f {}/up.2",
        dir.display()
    )
}

#[test]
fn run_finds_threshold_and_writes_stats() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let config = write_config(temp_dir.path(), &crash_above(temp_dir.path(), 100), "");

    let mut cmd = Command::cargo_bin("concprobe").expect("failed to find concprobe binary");
    cmd.arg("run").arg("--config").arg(&config);

    cmd.assert()
        .success()
        .stdout(predicate::str::diff("100\n"))
        .stderr(predicate::str::contains("max supported concurrency is 100"));

    let stats = fs::read_to_string(temp_dir.path().join("artifacts").join("stats.json"))
        .expect("stats.json should exist");
    assert_eq!(stats, r#"{"max_concurrency":100}"#);

    // Cluster is left running after the final restart.
    for node in 1..=3 {
        assert!(temp_dir.path().join(format!("up.{node}")).exists());
    }
}

#[test]
fn run_writes_receipt_with_every_probe() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let config = write_config(temp_dir.path(), &crash_above(temp_dir.path(), 100), "");
    let receipt_path = temp_dir.path().join("out").join("receipt.json");

    let mut cmd = Command::cargo_bin("concprobe").expect("failed to find concprobe binary");
    cmd.arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--receipt")
        .arg(&receipt_path)
        .arg("--pretty");
    cmd.assert().success();

    let content = fs::read_to_string(&receipt_path).expect("receipt should exist");
    let receipt: serde_json::Value =
        serde_json::from_str(&content).expect("receipt should be valid JSON");

    assert_eq!(receipt["schema"].as_str(), Some("concprobe.search.v1"));
    assert_eq!(receipt["result"]["max_concurrency"].as_u64(), Some(100));

    let levels: Vec<u64> = receipt["probes"]
        .as_array()
        .expect("probes should be an array")
        .iter()
        .map(|p| p["concurrency"].as_u64().expect("concurrency"))
        .collect();
    assert_eq!(levels, vec![112, 72, 92, 102, 97, 99, 100, 101]);
    assert_eq!(receipt["probes"][0]["status"].as_str(), Some("crashed"));
    assert_eq!(receipt["probes"][0]["max_ops"].as_u64(), Some(11));

    // Warm-up ran against the configured database.
    let sql = fs::read_to_string(temp_dir.path().join("sql.log")).expect("sql log");
    assert!(sql.contains("USE tpch; SELECT count(*) FROM lineitem;"));
}

#[test]
fn cli_bounds_override_config() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let config = write_config(temp_dir.path(), "true", "");
    let artifacts = temp_dir.path().join("elsewhere");

    let mut cmd = Command::cargo_bin("concprobe").expect("failed to find concprobe binary");
    cmd.arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--min")
        .arg("10")
        .arg("--max")
        .arg("14")
        .arg("--artifacts-dir")
        .arg(&artifacts);

    cmd.assert().success().stdout(predicate::str::diff("13\n"));

    let stats = fs::read_to_string(artifacts.join("stats.json")).expect("stats.json");
    assert_eq!(stats, r#"{"max_concurrency":13}"#);
}

#[test]
fn deadline_is_fatal_and_writes_nothing() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let config = write_config(temp_dir.path(), "sleep 5", "");

    let mut cmd = Command::cargo_bin("concprobe").expect("failed to find concprobe binary");
    cmd.arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--timeout")
        .arg("300ms");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("did not finish within"));

    assert!(!temp_dir.path().join("artifacts").join("stats.json").exists());
}

#[test]
fn invalid_config_fails_before_touching_cluster() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let config = write_config(temp_dir.path(), "true", "");

    let mut cmd = Command::cargo_bin("concprobe").expect("failed to find concprobe binary");
    cmd.arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--min")
        .arg("300");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("must be below max_concurrency"));

    assert!(!temp_dir.path().join("up.1").exists());
}

#[test]
fn missing_config_reports_path() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let missing = temp_dir.path().join("nope.toml");

    let mut cmd = Command::cargo_bin("concprobe").expect("failed to find concprobe binary");
    cmd.arg("run").arg("--config").arg(&missing);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("nope.toml"));
}

#[test]
fn json_logs_are_structured() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let config = write_config(temp_dir.path(), "true", "");

    let mut cmd = Command::cargo_bin("concprobe").expect("failed to find concprobe binary");
    cmd.arg("--log-format")
        .arg("json")
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--min")
        .arg("1")
        .arg("--max")
        .arg("3");

    let output = cmd.output().expect("run concprobe");
    assert!(output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<serde_json::Value> = stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("each log line should be JSON"))
        .collect();
    assert!(lines.iter().any(|l| {
        l["fields"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("running with concurrency = 2"))
    }));
}
