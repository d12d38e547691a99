//! Command-line surface of the `tickscope` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn tickscope() -> Command {
    let mut cmd = Command::cargo_bin("tickscope").unwrap();
    cmd.env_remove("TICKSCOPE_LOG").env_remove("RUST_LOG").arg("--log-level").arg("error");
    cmd
}

#[test]
fn prints_default_config() {
    tickscope()
        .arg("print-default-config")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("# tickscope configuration"))
        .stdout(predicate::str::contains("flush_interval_ms = 5000"))
        .stdout(predicate::str::contains("[[providers]]"));
}

#[test]
fn screen_prints_one_scored_tick_per_row() {
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "timestamp,close,volume").unwrap();
    for (i, volume) in [1_000, 1_010, 990, 1_005, 995, 1_002, 998, 1_001, 999, 25_000].iter().enumerate() {
        writeln!(csv, "{},100.0,{}", 1_704_200_000 + i * 60, volume).unwrap();
    }

    let output = tickscope()
        .arg("screen")
        .arg("--data")
        .arg(csv.path())
        .arg("--symbol")
        .arg("qqq")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let lines: Vec<serde_json::Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 10);
    assert!(lines.iter().all(|l| l["tick"]["symbol"] == "QQQ"));
    assert_eq!(lines[9]["classification"], "urgent");
    assert_eq!(lines[0]["classification"], "skip");
}

#[test]
fn run_without_config_file_fails() {
    tickscope()
        .arg("run")
        .arg("--config")
        .arg("/definitely/not/here.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}
