#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

fn seed_file() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("seed.json");
    let data = json!({
        "people": [
            {"_key": "ada", "name": "Ada", "born": 1815},
            {"_key": "grace", "name": "Grace", "born": 1906},
            {"_key": "alan", "name": "Alan", "born": 1912}
        ]
    });
    fs::write(&path, serde_json::to_vec(&data).expect("encode")).expect("write seed");
    (dir, path)
}

fn stdout_json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("valid json")
}

#[test]
fn query_prints_rows_as_json() {
    let (_dir, seed) = seed_file();
    let output = cargo_bin_cmd!("tessera")
        .args(["query", "FOR p IN people FILTER p.born > @year SORT p.born RETURN p.name"])
        .arg("--data")
        .arg(&seed)
        .args(["--bind", r#"{"year": 1900}"#])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["code"], json!(0));
    assert_eq!(json["rows"], json!(["Grace", "Alan"]));
    assert_eq!(json["stats"]["scannedFull"], json!(3));
    assert_eq!(json["stats"]["filtered"], json!(1));
}

#[test]
fn text_format_prints_one_row_per_line() {
    let output = cargo_bin_cmd!("tessera")
        .args(["--format", "text", "query", "FOR i IN [1, 2] RETURN i * 10"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(&lines[..2], &["10", "20"]);
    assert!(lines[2].starts_with("writes_executed=0"));
}

#[test]
fn failed_query_exits_with_two() {
    let output = cargo_bin_cmd!("tessera")
        .args(["query", "RETURN @missing"])
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["code"], json!(1551));
    assert!(json["message"]
        .as_str()
        .is_some_and(|m| m.starts_with("in state parsing: ")));
    assert!(json.get("rows").is_none());
}

#[test]
fn explain_then_run_the_saved_plan() {
    let (dir, seed) = seed_file();
    let output = cargo_bin_cmd!("tessera")
        .args(["explain", "FOR p IN people FILTER p.born < 1900 RETURN p._key"])
        .arg("--data")
        .arg(&seed)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let plan = stdout_json(&output)["rows"][0].clone();
    assert_eq!(plan["collections"], json!(["people"]));

    let plan_path = dir.path().join("plan.json");
    fs::write(&plan_path, serde_json::to_vec(&plan).expect("encode")).expect("write plan");
    let output = cargo_bin_cmd!("tessera")
        .arg("query")
        .arg("--plan")
        .arg(&plan_path)
        .arg("--data")
        .arg(&seed)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(stdout_json(&output)["rows"], json!(["ada"]));
}

#[test]
fn parse_reports_syntax_errors_without_state() {
    let output = cargo_bin_cmd!("tessera")
        .args(["parse", "FOR x IN [1] RETURN"])
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let json = stdout_json(&output);
    assert_eq!(json["code"], json!(1501));
    assert!(json["message"]
        .as_str()
        .is_some_and(|m| m.starts_with("syntax error, ")));

    let output = cargo_bin_cmd!("tessera")
        .args(["parse", "FOR x IN things RETURN x"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(stdout_json(&output)["rows"][0]["collections"], json!(["things"]));
}

#[test]
fn malformed_bind_json_is_a_cli_error() {
    cargo_bin_cmd!("tessera")
        .args(["query", "RETURN 1", "--bind", "{not json"])
        .assert()
        .code(1);
}
