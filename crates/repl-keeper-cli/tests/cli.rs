//! Process-level tests of the `repl-keeper` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const MALFORMED_LINE: &str = r#"{"domainId":"d-1","workflowId":"wf-3""#;

fn task_line(workflow_id: &str, first: i64) -> String {
    format!(
        r#"{{"domainId":"d-1","workflowId":"{}","runId":"run-a","firstEventId":{},"nextEventId":{},"version":1,"taskType":"history-append","payload":"AAE="}}"#,
        workflow_id,
        first,
        first + 10
    )
}

/// Binary isolated from the caller's configuration and logging environment
fn repl_keeper(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("repl-keeper").unwrap();
    cmd.env_remove("REPL_KEEPER_CONFIG")
        .env_remove("RUST_LOG")
        .env("XDG_CONFIG_HOME", home)
        .env("HOME", home)
        .env("REPL_KEEPER__BUS_PROVIDER", "in_memory");
    cmd
}

fn dlq_file(dir: &TempDir) -> std::path::PathBuf {
    let lines = [
        task_line("wf-1", 0),
        task_line("wf-2", 0),
        MALFORMED_LINE.to_string(),
        task_line("wf-4", 0),
        task_line("wf-5", 0),
    ];
    let path = dir.path().join("dlq.jsonl");
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();
    path
}

fn host_file(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("hosts.yaml");
    std::fs::write(
        &path,
        "clusters:\n  standby:\n    brokers: [\"broker-1:9092\"]\n",
    )
    .unwrap();
    path
}

#[test]
fn test_get_shard_prints_shard() {
    let home = TempDir::new().unwrap();
    let expected = repl_keeper_core::shard_for("order-7731", 16384).unwrap();

    repl_keeper(home.path())
        .args(["get-shard", "--workflow-id", "order-7731", "--number-of-shards", "16384"])
        .assert()
        .success()
        .stdout(format!("{}\n", expected));
}

#[test]
fn test_get_shard_with_zero_shards_is_a_configuration_error() {
    let home = TempDir::new().unwrap();

    repl_keeper(home.path())
        .args(["get-shard", "--workflow-id", "wf", "--number-of-shards", "0"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("number of shards"));
}

#[test]
fn test_get_shard_reads_shards_from_environment() {
    let home = TempDir::new().unwrap();
    let expected = repl_keeper_core::shard_for("wf-9", 64).unwrap();

    repl_keeper(home.path())
        .env("REPL_KEEPER__NUMBER_OF_SHARDS", "64")
        .args(["get-shard", "--workflow-id", "wf-9"])
        .assert()
        .success()
        .stdout(format!("{}\n", expected));
}

#[test]
fn test_parse_skip_errors_forwards_the_rest() {
    let home = TempDir::new().unwrap();
    let input = dlq_file(&home);

    let output = repl_keeper(home.path())
        .args(["parse", "--skip-errors", "--input-file"])
        .arg(&input)
        .assert()
        .success()
        .stderr(predicate::str::contains("skipped line 3"))
        .get_output()
        .stdout
        .clone();

    let stdout = String::from_utf8(output).unwrap();
    assert_eq!(stdout.lines().count(), 4);
    assert!(!stdout.contains("wf-3"));
}

#[test]
fn test_parse_skip_errors_skips_bytes_that_are_not_utf8() {
    let home = TempDir::new().unwrap();
    let input = home.path().join("binary.jsonl");
    let mut bytes = task_line("wf-1", 0).into_bytes();
    bytes.extend_from_slice(b"\n\xff\xfe{\n");
    bytes.extend_from_slice(task_line("wf-2", 0).as_bytes());
    bytes.push(b'\n');
    std::fs::write(&input, bytes).unwrap();

    repl_keeper(home.path())
        .args(["parse", "--skip-errors", "--input-file"])
        .arg(&input)
        .assert()
        .success()
        .stderr(predicate::str::contains("skipped line 2"));
}

#[test]
fn test_parse_abort_writes_nothing() {
    let home = TempDir::new().unwrap();
    let input = dlq_file(&home);
    let output_file = home.path().join("out.jsonl");

    repl_keeper(home.path())
        .args(["parse", "--input-file"])
        .arg(&input)
        .arg("--output-file")
        .arg(&output_file)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("line 3"));

    assert!(!output_file.exists());
    assert!(!home.path().join("out.jsonl.partial").exists());
}

#[test]
fn test_parse_headers_from_stdin() {
    let home = TempDir::new().unwrap();

    repl_keeper(home.path())
        .args(["parse", "--headers-only", "--workflow-id", "wf-2"])
        .write_stdin(format!("{}\n\n{}\n", task_line("wf-1", 0), task_line("wf-2", 5)))
        .assert()
        .success()
        .stdout("domainID,workflowID,runID,firstEventID,nextEventID\nd-1,wf-2,run-a,5,15\n");
}

#[test]
fn test_rereplicate_without_history_is_a_no_op() {
    let home = TempDir::new().unwrap();
    let hosts = host_file(&home);
    let history = home.path().join("history");
    std::fs::create_dir(&history).unwrap();

    repl_keeper(home.path())
        .args([
            "rereplicate",
            "--domain-id",
            "d-1",
            "--workflow-id",
            "wf-1",
            "--run-id",
            "run-a",
            "--cluster",
            "standby",
            "--topic",
            "replication",
            "--number-of-shards",
            "16",
            "--history-dir",
        ])
        .arg(&history)
        .arg("--host-file")
        .arg(&hosts)
        .assert()
        .success()
        .stderr(predicate::str::contains("no stored events"));
}

#[test]
fn test_rereplicate_reports_history_gaps() {
    let home = TempDir::new().unwrap();
    let hosts = host_file(&home);
    let history = home.path().join("history");
    let run_dir = history.join("d-1").join("wf-1");
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(
        run_dir.join("run-a.jsonl"),
        concat!(
            r#"{"firstEventId":0,"nextEventId":10,"version":1,"events":""}"#,
            "\n",
            r#"{"firstEventId":15,"nextEventId":20,"version":1,"events":""}"#,
            "\n"
        ),
    )
    .unwrap();
    let ranges = home.path().join("ranges.txt");
    std::fs::write(&ranges, "# ranges\nd-1,wf-1,run-a\nd-1,wf-2,run-a,,\n").unwrap();

    repl_keeper(home.path())
        .args([
            "rereplicate",
            "--cluster",
            "standby",
            "--topic",
            "replication",
            "--number-of-shards",
            "16",
            "--input-file",
        ])
        .arg(&ranges)
        .arg("--history-dir")
        .arg(&history)
        .arg("--host-file")
        .arg(&hosts)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("line 2: d-1/wf-1/run-a: FAILED after 0 tasks"))
        .stderr(predicate::str::contains("line 3: d-1/wf-2/run-a: no stored events"));
}

#[test]
fn test_rereplicate_rejects_inverted_range() {
    let home = TempDir::new().unwrap();
    let hosts = host_file(&home);

    repl_keeper(home.path())
        .args([
            "rereplicate",
            "--domain-id",
            "d-1",
            "--workflow-id",
            "wf-1",
            "--run-id",
            "run-a",
            "--min-event-id",
            "50",
            "--max-event-id",
            "10",
            "--cluster",
            "standby",
            "--topic",
            "replication",
            "--number-of-shards",
            "16",
            "--history-dir",
            "unused",
        ])
        .arg("--host-file")
        .arg(&hosts)
        .assert()
        .code(3);
}

#[test]
fn test_purge_unknown_cluster_is_a_configuration_error() {
    let home = TempDir::new().unwrap();
    let hosts = host_file(&home);

    repl_keeper(home.path())
        .args([
            "purge-topic",
            "--cluster",
            "elsewhere",
            "--topic",
            "dlq",
            "--group",
            "standby-consumers",
            "--host-file",
        ])
        .arg(&hosts)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("elsewhere"));
}

#[test]
fn test_missing_config_file_is_a_configuration_error() {
    let home = TempDir::new().unwrap();

    repl_keeper(home.path())
        .args(["--config"])
        .arg(home.path().join("absent.toml"))
        .args(["get-shard", "--workflow-id", "wf", "--number-of-shards", "4"])
        .assert()
        .code(1);
}

#[test]
fn test_completions() {
    let home = TempDir::new().unwrap();

    repl_keeper(home.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("repl-keeper"));
}
