//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("wattbench")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Network-load vs. power-draw test bench",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("wattbench")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("wattbench"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("wattbench")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_probe_subcommand_exists() {
    Command::cargo_bin("wattbench")
        .unwrap()
        .args(["probe", "--help"])
        .assert()
        .success();
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("wattbench")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success();
}

#[test]
fn test_probe_with_mock_meter() {
    Command::cargo_bin("wattbench")
        .unwrap()
        .args(["probe", "--mock"])
        .assert()
        .success()
        .stdout(predicates::str::contains("power source reachable"));
}
