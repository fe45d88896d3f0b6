use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

const CONFIG: &str = r#"
[
  {
    "name": "staging",
    "aliases": [
      { "address": "127.0.1.1", "domain": "api.staging.test" },
      { "address": "127.0.1.2" }
    ],
    "services": [
      {
        "id": "api",
        "name": "API",
        "ports": [8080],
        "command": "api-server --bind $IP:8080 --db $IP2"
      },
      {
        "id": "worker",
        "name": "Worker",
        "command": "worker --db $IP2",
        "enabled": false
      }
    ]
  }
]
"#;

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("environments.json");
    fs::write(&path, CONFIG).unwrap();
    path
}

#[test]
fn list_shows_environments_and_services() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path());

    Command::cargo_bin("loopman")
        .unwrap()
        .args(["list", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("staging"))
        .stdout(predicate::str::contains("alias 127.0.1.1 (api.staging.test)"))
        .stdout(predicate::str::contains("worker (disabled)"));
}

#[test]
fn list_emits_valid_json() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path());

    let output = Command::cargo_bin("loopman")
        .unwrap()
        .args(["list", "--json", "--config"])
        .arg(&config)
        .output()
        .unwrap();

    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed[0]["name"], "staging");
    assert_eq!(parsed[0]["services"][0]["id"], "api");
}

#[test]
fn list_with_missing_config_reports_nothing_defined() {
    let temp = tempdir().unwrap();

    Command::cargo_bin("loopman")
        .unwrap()
        .args(["list", "--config"])
        .arg(temp.path().join("absent.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("No environments defined"));
}

#[test]
fn resolve_substitutes_alias_addresses() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path());

    Command::cargo_bin("loopman")
        .unwrap()
        .args(["resolve", "staging", "api", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "api-server --bind 127.0.1.1:8080 --db 127.0.1.2",
        ));
}

#[test]
fn unknown_environment_fails_with_context() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path());

    Command::cargo_bin("loopman")
        .unwrap()
        .args(["up", "production", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("environment 'production' not found"));
}

#[test]
fn unknown_service_fails_with_context() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path());

    Command::cargo_bin("loopman")
        .unwrap()
        .args(["resolve", "staging", "ghost", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("service 'ghost' not found"));
}
