//! Integration tests for the vpnctl binary
//!
//! Backends are pointed at `true`/`false` so the full connect and disconnect
//! paths run without any tunnel software installed.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn vpnctl() -> Command {
    Command::cargo_bin("vpnctl").unwrap()
}

/// Write a configuration whose WireGuard backend runs `up_cmd` to connect
fn write_config(dir: &Path, up_cmd: &str) -> PathBuf {
    let state_dir = dir.join("state");
    let log_dir = dir.join("log");
    let config = format!(
        r#"selected_server = "nl1"

[paths]
state_dir = "{state}"
log_dir = "{log}"

[timing]
connect_grace_ms = 50

[protocol]
kind = "wireguard"

[[servers]]
id = "nl1"
name = "Amsterdam"
address = "nl1.vpn.example.net"

[backends.wireguard]
interface = ""
up = ["{up}"]
down = ["true"]
status = ["true"]
"#,
        state = state_dir.display(),
        log = log_dir.display(),
        up = up_cmd,
    );

    let path = dir.join("vpnctl.toml");
    std::fs::write(&path, config).unwrap();
    path
}

#[test]
fn test_help_command() {
    vpnctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Coordinate IPsec, OpenVPN and WireGuard"));
}

#[test]
fn test_config_prints_effective_configuration() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "true");

    vpnctl()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("connect_grace_ms = 50"))
        .stdout(predicate::str::contains("rule_reinstall_ms = 2000"))
        .stdout(predicate::str::contains("nl1.vpn.example.net"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = TempDir::new().unwrap();

    vpnctl()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config"));
}

#[test]
fn test_unknown_selected_server_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vpnctl.toml");
    std::fs::write(&path, "selected_server = \"nowhere\"\n").unwrap();

    vpnctl()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not in the server list"));
}

#[test]
fn test_status_of_unconfigured_backends() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "true");

    vpnctl()
        .arg("--config")
        .arg(&path)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("wireguard: invalid"));
}

#[test]
fn test_connect_then_disconnect() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "true");

    vpnctl()
        .arg("--config")
        .arg(&path)
        .arg("connect")
        .assert()
        .success()
        .stdout(predicate::str::contains("wireguard: connected"));

    assert!(dir.path().join("state/wireguard.json").exists());
    assert!(dir.path().join("state/wireguard.ondemand.json").exists());

    vpnctl()
        .arg("--config")
        .arg(&path)
        .arg("server")
        .assert()
        .success()
        .stdout(predicate::str::contains("nl1.vpn.example.net"));

    vpnctl()
        .arg("--config")
        .arg(&path)
        .arg("disconnect")
        .assert()
        .success()
        .stdout(predicate::str::contains("Disconnected"));
}

#[test]
fn test_failed_connect_reports_error() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "false");

    vpnctl()
        .arg("--config")
        .arg(&path)
        .arg("--timeout")
        .arg("10")
        .arg("connect")
        .assert()
        .failure()
        .stderr(predicate::str::contains("wireguard connection failed"));
}

#[test]
fn test_remove_rules_and_remove_all() {
    let dir = TempDir::new().unwrap();
    let path = write_config(dir.path(), "true");

    vpnctl()
        .arg("--config")
        .arg(&path)
        .arg("remove-rules")
        .assert()
        .success()
        .stdout(predicate::str::contains("On-demand rules removed"));

    vpnctl()
        .arg("--config")
        .arg(&path)
        .arg("remove-all")
        .assert()
        .success()
        .stdout(predicate::str::contains("Backend configurations removed"));

    assert!(!dir.path().join("state/wireguard.json").exists());
}
