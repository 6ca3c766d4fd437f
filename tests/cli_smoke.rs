//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("hangar");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("tail"))
        .stdout(predicate::str::contains("cancel"));
}

#[test]
fn tail_rejects_a_malformed_session_id() {
    let mut cmd = cargo_bin_cmd!("hangar");
    cmd.args(["tail", "not-a-uuid", "--backend", "http://127.0.0.1:9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("'not-a-uuid' is not a session identifier"));
}

#[test]
fn cancel_rejects_a_non_http_backend() {
    let mut cmd = cargo_bin_cmd!("hangar");
    cmd.args([
        "cancel",
        "5f0c6f2e-8d4b-4c47-9d51-0f4f3c7a9b10",
        "--backend",
        "ftp://example.com",
    ])
    .env_remove("HANGAR_BACKEND_URL")
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid backend URL 'ftp://example.com'"));
}
