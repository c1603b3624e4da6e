//! End-to-end CLI tests that exercise the `timelocker` binary through its
//! CLI interface rather than calling `IntegrationService` directly.

use assert_cmd::Command;
use predicates::prelude::*;

fn timelocker() -> Command {
    Command::cargo_bin("timelocker").expect("binary `timelocker` should be built")
}

#[test]
fn help_flag_lists_all_subcommands() {
    timelocker()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Backup orchestration"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("backup"))
        .stdout(predicate::str::contains("restore"))
        .stdout(predicate::str::contains("prune"))
        .stdout(predicate::str::contains("verify"));
}

#[test]
fn init_writes_a_loadable_configuration_document() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("timelocker.json");

    timelocker()
        .current_dir(dir.path())
        .args(["init", "--output", output.to_str().unwrap()])
        .assert()
        .success();

    let contents = std::fs::read_to_string(&output).unwrap();
    assert!(contents.contains("repositories"));
    assert!(contents.contains("backup_targets"));
}

#[test]
fn backup_without_an_initialized_credential_store_fails_with_credential_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("timelocker.json");

    timelocker()
        .current_dir(dir.path())
        .args(["init", "--output", config.to_str().unwrap()])
        .assert()
        .success();

    // No `init-credentials` run yet, so unlock is attempted against a store
    // that was never created — this must fail before the engine is ever
    // invoked, with the credential-error exit code rather than a panic or a
    // hang on an interactive password prompt.
    timelocker()
        .current_dir(dir.path())
        .env("TIMELOCKER_MASTER_PASSWORD", "whatever")
        .args(["--config", config.to_str().unwrap(), "backup", "does-not-exist"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn missing_subcommand_is_rejected() {
    timelocker().assert().failure();
}
