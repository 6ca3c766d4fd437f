//! Tests for the multiplexed SSH channel.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

use super::*;
use crate::runner::NullSink;
use crate::test_support::ScriptedRunner;

#[fixture]
fn settings() -> SshSettings {
    SshSettings {
        ssh_bin: String::from("ssh"),
        control_dir: Utf8PathBuf::from("/tmp/hangar-test/ssh"),
        connect_timeout: Duration::from_secs(5),
        control_persist: Duration::from_secs(600),
    }
}

#[fixture]
fn target() -> SshTarget {
    SshTarget {
        host: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
        port: 22,
        user: String::from("root"),
        identity_file: Utf8PathBuf::from("/tmp/keys/id_ed25519"),
    }
}

async fn connected(
    runner: &ScriptedRunner,
    settings: SshSettings,
    target: SshTarget,
) -> SshChannel {
    runner.push_success();
    SshChannel::connect(Arc::new(runner.clone()), settings, target)
        .await
        .unwrap_or_else(|err| panic!("connect: {err}"))
}

#[rstest]
#[tokio::test]
async fn connect_starts_a_control_master(settings: SshSettings, target: SshTarget) {
    let runner = ScriptedRunner::new();
    let _channel = connected(&runner, settings, target).await;

    let line = runner
        .invocations()
        .first()
        .map(crate::test_support::CommandInvocation::command_string)
        .unwrap_or_default();
    assert!(line.contains("ControlMaster=yes"), "{line}");
    assert!(line.contains("ControlPersist=600"), "{line}");
    assert!(line.contains("ConnectTimeout=5"), "{line}");
    assert!(line.contains("BatchMode=yes"), "{line}");
    assert!(line.contains("-i /tmp/keys/id_ed25519"), "{line}");
    assert!(line.ends_with("root@192.0.2.7 true"), "{line}");
}

#[rstest]
#[tokio::test]
async fn connect_failure_reports_stderr(settings: SshSettings, target: SshTarget) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(255), "", "Permission denied (publickey).");

    let err = SshChannel::connect(Arc::new(runner), settings, target)
        .await
        .expect_err("connect should fail");

    assert!(
        matches!(
            err,
            SshError::Connect { ref message, .. } if message.contains("Permission denied")
        ),
        "{err}"
    );
}

#[rstest]
#[tokio::test]
async fn commands_reuse_the_control_socket(settings: SshSettings, target: SshTarget) {
    let runner = ScriptedRunner::new();
    let channel = connected(&runner, settings, target).await;
    runner.push_output(Some(0), "hello\n", "");

    let output = channel
        .run_capture("echo hello", &NullSink)
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert_eq!(output, "hello\n");
    let line = runner
        .commands_containing("echo hello")
        .pop()
        .unwrap_or_default();
    assert!(line.contains("ControlMaster=no"), "{line}");
    assert!(line.contains("ControlPath=/tmp/hangar-test/ssh/%C"), "{line}");
}

#[rstest]
#[tokio::test]
async fn failing_command_carries_text_status_and_output(settings: SshSettings, target: SshTarget) {
    let runner = ScriptedRunner::new();
    let channel = connected(&runner, settings, target).await;
    runner.push_output(Some(3), "partial\n", "boom\n");

    let err = channel
        .run("false", &NullSink)
        .await
        .expect_err("command should fail");

    assert_eq!(
        err,
        SshError::Command {
            command: String::from("false"),
            exit_code: Some(3),
            output: String::from("partial\nboom"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn run_all_stops_at_first_failure(settings: SshSettings, target: SshTarget) {
    let runner = ScriptedRunner::new();
    let channel = connected(&runner, settings, target).await;
    runner.push_success();
    runner.push_failure(1);

    let commands = ["first", "second", "third"];
    let err = channel
        .run_all(&commands, &NullSink)
        .await
        .expect_err("sequence should fail");

    assert!(matches!(err, SshError::Sequence { index: 1, .. }), "{err}");
    assert!(err.to_string().contains("command 2 of the sequence"), "{err}");
    assert!(runner.commands_containing("third").is_empty());
}

#[rstest]
#[tokio::test]
async fn close_tolerates_missing_master(settings: SshSettings, target: SshTarget) {
    let runner = ScriptedRunner::new();
    let channel = connected(&runner, settings, target).await;
    runner.push_output(Some(255), "", "No such file or directory");

    channel
        .close()
        .await
        .unwrap_or_else(|err| panic!("close: {err}"));
    assert_eq!(runner.commands_containing("-O exit").len(), 1);
}

#[rstest]
fn pty_args_force_a_terminal(settings: SshSettings, target: SshTarget) {
    let channel = SshChannel {
        runner: Arc::new(ScriptedRunner::new()),
        settings,
        target,
    };
    let args: Vec<String> = channel
        .pty_args()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    assert_eq!(args.first().map(String::as_str), Some("-tt"));
    assert_eq!(args.last().map(String::as_str), Some("root@192.0.2.7"));
}
