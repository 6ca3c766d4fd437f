//! HTTP routes exercised in-process through the axum router.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use camino::Utf8PathBuf;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use hangar::api::{AppState, KeySettings, router};
use hangar::catalog::Catalog;
use hangar::provider::ProviderRegistry;
use hangar::runner::{CommandRunner, ProcessCommandRunner};
use hangar::session::{DeploymentSession, DeploymentState, SessionInfo, SessionStore};
use hangar::ssh::SshSettings;
use hangar::test_support::{FakeProvider, ScriptedRunner};
use hangar::Orchestrator;

/// Stands in for `ssh-keygen`: writes both key files named by `-f`.
const FAKE_KEYGEN: &str = "#!/bin/sh\n\
for arg; do last=\"$arg\"; done\n\
printf 'PRIVATE\\n' > \"$last\"\n\
printf 'ssh-ed25519 AAAATEST hangar\\n' > \"$last.pub\"\n";

struct TestApp {
    _tmp: TempDir,
    app: Router,
    sessions: Arc<SessionStore>,
    ssh: ScriptedRunner,
}

fn test_app() -> TestApp {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 tempdir");
    let keygen = root.join("fake-keygen");
    std::fs::write(&keygen, FAKE_KEYGEN).expect("write keygen");
    make_executable(&keygen);

    let registry = ProviderRegistry::new().with(Arc::new(FakeProvider::new("digitalocean")));
    let ssh = ScriptedRunner::succeeding();
    let ssh_runner: Arc<dyn CommandRunner> = Arc::new(ssh.clone());
    let orchestrator = Orchestrator::new(
        registry.clone(),
        ssh_runner,
        SshSettings {
            ssh_bin: String::from("ssh"),
            control_dir: root.join("control"),
            connect_timeout: Duration::from_secs(1),
            control_persist: Duration::from_secs(60),
        },
        "root",
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
    .with_connect_backoff(Duration::from_millis(10), Duration::from_millis(20));

    let sessions = Arc::new(SessionStore::new());
    let state = AppState {
        catalog: Arc::new(Catalog::builtin().expect("builtin catalog")),
        registry,
        sessions: Arc::clone(&sessions),
        orchestrator,
        runner: Arc::new(ProcessCommandRunner),
        keys: KeySettings {
            ssh_keygen_bin: keygen.into_string(),
            key_dir: root.join("keys"),
        },
    };

    TestApp {
        _tmp: tmp,
        app: router(state),
        sessions,
        ssh,
    }
}

fn make_executable(path: &camino::Utf8Path) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod keygen");
}

impl TestApp {
    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let response = self.app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, bytes.to_vec())
    }

    async fn json(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, bytes) = self.send(method, uri, body).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    fn insert_session(&self) -> Arc<DeploymentSession> {
        let session = Arc::new(DeploymentSession::new(
            Uuid::new_v4(),
            SessionInfo {
                app: String::from("gitea"),
                provider: String::from("digitalocean"),
                region: String::from("test-1"),
                hostname: String::from("hangar-test"),
                domain: None,
            },
        ));
        self.sessions.insert(Arc::clone(&session));
        session
    }
}

#[tokio::test]
async fn lists_catalog_apps_and_providers() {
    let app = test_app();

    let (status, apps) = app.json(Method::GET, "/api/apps", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = apps
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|entry| entry.get("name").and_then(Value::as_str))
        .collect();
    assert!(names.contains(&"gitea"));
    assert!(names.contains(&"vaultwarden"));

    let (status, providers) = app.json(Method::GET, "/api/providers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(providers.as_array().is_some_and(|list| !list.is_empty()));
}

#[tokio::test]
async fn unknown_provider_lists_nothing() {
    let app = test_app();

    let (status, sizes) = app.json(Method::GET, "/api/sizes?provider=nowhere", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sizes, json!([]));

    let (status, regions) = app.json(Method::GET, "/api/regions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(regions, json!([]));
}

#[tokio::test]
async fn lists_sizes_and_regions_of_a_registered_provider() {
    let app = test_app();

    let (status, sizes) = app
        .json(Method::GET, "/api/sizes?provider=digitalocean&region=test-1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sizes.as_array().map(Vec::len), Some(3));

    let (status, regions) = app
        .json(Method::GET, "/api/regions?provider=digitalocean", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(regions.pointer("/0/slug"), Some(&json!("test-1")));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let app = test_app();
    let id = Uuid::new_v4();

    for uri in [
        format!("/api/deployments/{id}"),
        format!("/api/deployments/{id}/logs"),
        format!("/api/pty/output?sessionId={id}"),
    ] {
        let (status, body) = app.json(Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body.get("error"), Some(&json!("not_found")));
    }
}

#[tokio::test]
async fn rejects_invalid_submissions() {
    let app = test_app();

    let (status, body) = app
        .json(
            Method::POST,
            "/api/deployments",
            Some(json!({"app": "wordpress", "provider": "digitalocean", "region": "test-1"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body.get("message"), Some(&json!("unknown app 'wordpress'")));

    let (status, body) = app
        .json(
            Method::POST,
            "/api/deployments",
            Some(json!({"app": "gitea", "provider": "vultr", "region": "ewr"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body.get("message")
            .and_then(Value::as_str)
            .is_some_and(|message| message.contains("not configured"))
    );
    assert!(app.sessions.is_empty());
}

#[tokio::test]
async fn accepted_submission_runs_to_completion() {
    let app = test_app();

    let (status, body) = app
        .json(
            Method::POST,
            "/api/deployments",
            Some(json!({"app": "uptime-kuma", "provider": "digitalocean", "region": "test-1"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body
        .get("sessionId")
        .and_then(Value::as_str)
        .expect("session id")
        .to_owned();

    let mut snapshot = Value::Null;
    for _ in 0..200 {
        let (_, current) = app.json(Method::GET, &format!("/api/deployments/{id}"), None).await;
        snapshot = current;
        if snapshot.get("state") == Some(&json!("completed")) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(snapshot.get("state"), Some(&json!("completed")), "{snapshot}");
    assert_eq!(snapshot.get("app"), Some(&json!("uptime-kuma")));

    let (status, page) = app
        .json(Method::GET, &format!("/api/deployments/{id}/logs?offset=0"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        page.pointer("/lines/0/text")
            .and_then(Value::as_str)
            .is_some_and(|text| text.starts_with("accepted uptime-kuma on digitalocean"))
    );
    assert!(!app.ssh.commands_containing("uptime-kuma").is_empty());
}

#[tokio::test]
async fn log_pages_resume_from_offset() {
    let app = test_app();
    let session = app.insert_session();
    session.status("first");
    session.status("second");
    session.status("third");

    let (status, page) = app
        .json(
            Method::GET,
            &format!("/api/deployments/{}/logs?offset=1", session.id()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page.pointer("/lines/0/text"), Some(&json!("second")));
    assert_eq!(page.get("next"), Some(&json!(3)));

    let (_, empty) = app
        .json(
            Method::GET,
            &format!("/api/deployments/{}/logs?offset=9", session.id()),
            None,
        )
        .await;
    assert_eq!(empty.get("lines"), Some(&json!([])));
    assert_eq!(empty.get("next"), Some(&json!(9)));
}

#[tokio::test]
async fn cancel_is_accepted_once_running_and_refused_when_finished() {
    let app = test_app();
    let session = app.insert_session();
    let uri = format!("/api/deployments/{}/cancel", session.id());

    let (status, _) = app.send(Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(session.is_cancelled());

    session.set_state(DeploymentState::Completed);
    let (status, body) = app.json(Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body.get("error"), Some(&json!("conflict")));
}

#[tokio::test]
async fn terminal_input_before_ssh_is_a_conflict() {
    let app = test_app();
    let session = app.insert_session();

    let (status, _) = app
        .json(
            Method::POST,
            "/api/pty/input",
            Some(json!({"sessionId": session.id(), "dataB64": "bHMK"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .json(
            Method::POST,
            "/api/pty/input",
            Some(json!({"sessionId": session.id(), "dataB64": "not base64!"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn terminal_output_starts_empty() {
    let app = test_app();
    let session = app.insert_session();

    let (status, page) = app
        .json(
            Method::GET,
            &format!("/api/pty/output?sessionId={}&offset=0", session.id()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page, json!({"chunks": [], "next": 0}));
}

#[tokio::test]
async fn event_stream_replays_log_then_final_state() {
    let app = test_app();
    let session = app.insert_session();
    session.status("selecting a size");
    session.status("two\nlines");
    session.set_state(DeploymentState::Completed);

    let (status, bytes) = app
        .send(
            Method::GET,
            &format!("/api/deployments/{}/events", session.id()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let body = String::from_utf8(bytes).expect("utf-8 stream");
    let log_at = body.find("event: log").expect("log event");
    let state_at = body.find("event: state").expect("state event");
    assert!(log_at < state_at);
    assert!(body.contains(r#""text":"selecting a size\r\n""#));
    assert!(body.contains(r#""text":"two\r\nlines\r\n""#));
    assert!(body.contains(r#""state":"completed""#));
}
