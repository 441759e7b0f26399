#![allow(clippy::single_match_else)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn abx_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_abx") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/abx");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "ab-testing-cli", "--bin", "abx"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build abx binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn abx_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(abx_binary_path());
    command.env_remove("ABX_DB").env_remove("ABX_ASSIGNMENT_MODE");
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run abx command {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("abx-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn create_hero(db_path: &Path) -> i64 {
    let output = abx_output(
        db_path,
        &[
            "experiment",
            "create",
            "--name",
            "Hero-Section",
            "--goal",
            "Kontaktanfragen",
            "--split-a",
            "50",
            "--variant",
            r#"{"title":"IT-Support, der funktioniert","button_text":"Kontakt","button_link":"/kontakt"}"#,
            "--variant",
            r#"{"title":"Ihr IT-Partner vor Ort","button_text":"Beratung","button_link":"/beratung"}"#,
        ],
    );
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["success"], Value::Bool(true));
    match value["experiment_id"].as_i64() {
        Some(id) => id,
        None => panic!("missing experiment_id in {value}"),
    }
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(abx_binary_path()).arg("--help").output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run abx --help: {err}"),
    };
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in [
        "db",
        "config",
        "experiment",
        "start",
        "stop",
        "assign",
        "event",
        "events",
        "stats",
        "winner",
    ] {
        assert!(
            stdout.contains(command),
            "expected `{command}` in help output:\n{stdout}"
        );
    }
}

#[test]
fn fresh_database_reports_inactive_config_and_assignment() {
    let db_path = temp_db("fresh");

    let config = stdout_json(&abx_output(&db_path, &["config", "show"]));
    assert_eq!(config["ab_active"], Value::Bool(false));
    assert_eq!(config["default_split"], Value::from(50));
    assert_eq!(config["auto_winner_threshold"], Value::from(1000));
    assert_eq!(config["auto_winner_days"], Value::from(7));

    let assignment = stdout_json(&abx_output(&db_path, &["assign"]));
    assert_eq!(assignment["active"], Value::Bool(false));
    assert_eq!(assignment["variant"], Value::Null);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn start_then_stop_toggles_ab_active() {
    let db_path = temp_db("lifecycle");
    let id = create_hero(&db_path);
    let id_arg = id.to_string();

    let started = stdout_json(&abx_output(&db_path, &["start", "--experiment-id", &id_arg]));
    assert_eq!(started["ab_active"], Value::Bool(true));

    let listed = stdout_json(&abx_output(
        &db_path,
        &["experiment", "list", "--status", "running"],
    ));
    assert_eq!(listed["count"], Value::from(1));
    assert_eq!(listed["experiments"][0]["status"], Value::from("running"));
    assert_eq!(
        listed["experiments"][0]["variants"][1]["variant_key"],
        Value::from("B")
    );

    let stopped = stdout_json(&abx_output(&db_path, &["stop"]));
    assert_eq!(stopped["ab_active"], Value::Bool(false));
    assert_eq!(stopped["active_experiments"], Value::from(0));
    assert_eq!(stopped["status"], Value::from("paused"));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn repeated_click_events_are_counted_twice() {
    let db_path = temp_db("clicks");
    let id = create_hero(&db_path);
    let id_arg = id.to_string();

    for _ in 0..2 {
        let output = abx_output(
            &db_path,
            &[
                "event",
                "record",
                "--experiment-id",
                &id_arg,
                "--variant-key",
                "A",
                "--event-type",
                "click",
                "--user-agent",
                "Mozilla/5.0 (iPad; Tablet)",
            ],
        );
        assert!(output.status.success());
        let value = stdout_json(&output);
        assert_eq!(value["event_type"], Value::from("click"));
        assert_eq!(value["device_type"], Value::from("tablet"));
    }

    let report = stdout_json(&abx_output(
        &db_path,
        &["stats", "--experiment-id", &id_arg, "--json"],
    ));
    assert_eq!(report["stats"][0]["variant_key"], Value::from("A"));
    assert_eq!(report["stats"][0]["clicks"], Value::from(2));
    assert_eq!(report["stats"][0]["ctr"], Value::from(0.0));
    assert_eq!(report["totals"]["clicks"], Value::from(2));

    let events = stdout_json(&abx_output(
        &db_path,
        &["events", "list", "--experiment-id", &id_arg],
    ));
    assert_eq!(events.as_array().map(Vec::len), Some(2));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn unknown_variant_exits_non_zero_with_stable_message() {
    let db_path = temp_db("unknown-variant");
    let id = create_hero(&db_path);

    let output = abx_output(
        &db_path,
        &[
            "event",
            "record",
            "--experiment-id",
            &id.to_string(),
            "--variant-key",
            "Q",
            "--event-type",
            "conversion",
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("variant Q of experiment"),
        "expected stable error shape, got stderr={stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}
