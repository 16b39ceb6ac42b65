//! End-to-end dispatch tests
//!
//! A request enters through the router, lands on the in-memory queue, is
//! picked up by the queue consumer and delivered by the XMPP backend over a
//! mock chat connector. Nothing here needs a network, Redis or PostgreSQL.

use std::io::Read;
use std::iter;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use push_relay::config::Settings;
use push_relay::encryption::EncryptionType;
use push_relay::queue::{ConsumerConfig, ConsumerReport, MemoryTaskQueue, QueueConsumer, TaskQueue};
use push_relay::repository::{Repository, StaticRepository};
use push_relay::server::{create_app, AppState};
use push_relay::targets::xmpp::XmppSettings;
use push_relay::targets::{BackendError, ChatConnector, ChatSession, TargetRegistry};
use push_relay::tenant::{Application, Resolver, Target, User};
use push_relay::worker::DispatchWorker;

const USER_KEY: &str = "uQiRzpo4DXghDmr9QzzfQu27cmVRsG";
const APP_TOKEN: &str = "azGDORePK8gMaC0QOYAMyEEuzJnyUi";

/// What the fake XMPP server saw
#[derive(Default)]
struct Wire {
    connects: usize,
    sent: Vec<(String, String)>,
    broken: bool,
}

type SharedWire = Arc<Mutex<Wire>>;

struct MockConnector(SharedWire);

struct MockSession(SharedWire);

#[async_trait]
impl ChatConnector for MockConnector {
    async fn connect(&self, settings: &XmppSettings) -> Result<Box<dyn ChatSession>, BackendError> {
        assert_eq!(settings.jid, "relay@example.org");
        let mut wire = self.0.lock().unwrap();
        wire.connects += 1;
        wire.broken = false;
        Ok(Box::new(MockSession(self.0.clone())))
    }
}

#[async_trait]
impl ChatSession for MockSession {
    async fn ping(&mut self) -> Result<(), BackendError> {
        if self.0.lock().unwrap().broken {
            return Err(BackendError::Connection("stream closed".to_string()));
        }
        Ok(())
    }

    async fn send_chat(&mut self, to: &str, body: &str) -> Result<(), BackendError> {
        let mut wire = self.0.lock().unwrap();
        if wire.broken {
            return Err(BackendError::Connection("stream closed".to_string()));
        }
        wire.sent.push((to.to_string(), body.to_string()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

struct Relay {
    app: Router,
    queue: Arc<MemoryTaskQueue>,
    wire: SharedWire,
    shutdown_tx: broadcast::Sender<()>,
    consumer: JoinHandle<ConsumerReport>,
}

impl Relay {
    async fn stop(self) -> ConsumerReport {
        let _ = self.shutdown_tx.send(());
        self.consumer.await.unwrap()
    }
}

fn create_test_application() -> Application {
    Application {
        token: APP_TOKEN.to_string(),
        enable: true,
        name: "Backups".to_string(),
        target: "xmpp_main".to_string(),
        target_args: json!({"destination": "ops@example.org"})
            .as_object()
            .cloned()
            .unwrap(),
        ..Default::default()
    }
}

fn create_test_target(enable: bool) -> Target {
    Target {
        id: "xmpp_main".to_string(),
        enable,
        kind: "xmpp".to_string(),
        args: json!({
            "server": "example.org:5222",
            "username": "relay@example.org",
            "password": "secret"
        })
        .as_object()
        .cloned()
        .unwrap(),
    }
}

/// Start router, registry and consumer around one application
async fn start_relay(application: Application, target: Target) -> Relay {
    let user = User {
        key: USER_KEY.to_string(),
        enable: true,
        applications: vec![application],
    };
    let repository: Arc<dyn Repository> =
        Arc::new(StaticRepository::new(vec![user], vec![target.clone()]));

    let wire: SharedWire = Arc::default();
    let registry = TargetRegistry::from_targets_with(&[target], Arc::new(MockConnector(wire.clone())))
        .unwrap();
    registry.load_all().await.unwrap();
    registry.run_all().await.unwrap();

    let queue = Arc::new(MemoryTaskQueue::new());
    let worker = Arc::new(DispatchWorker::new(
        Resolver::new(repository.clone()),
        Arc::new(registry),
    ));
    let consumer = QueueConsumer::new(
        queue.clone(),
        worker,
        ConsumerConfig {
            poll_interval: Duration::from_millis(5),
            ..ConsumerConfig::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let consumer = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    let state = AppState::new(Settings::default(), repository, queue.clone());
    Relay {
        app: create_app(state),
        queue,
        wire,
        shutdown_tx,
        consumer,
    }
}

async fn post(app: &Router, uri: &str, body: Value) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap().status()
}

/// Wait until the queue holds no pending or in-flight task
async fn wait_for_idle(queue: &MemoryTaskQueue) {
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = queue.stats().await.unwrap();
        if stats.pending == 0 && stats.inflight == 0 && stats.scheduled == 0 {
            return;
        }
    }
    panic!("queue did not drain");
}

#[tokio::test]
async fn test_message_delivered_end_to_end() {
    let relay = start_relay(create_test_application(), create_test_target(true)).await;

    let status = post(
        &relay.app,
        "/1/messages.json",
        json!({
            "token": APP_TOKEN,
            "title": "Backup",
            "message": "Backup finished",
            "url": "https://backup.example.com/run/7",
            "url_title": "Run 7"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    wait_for_idle(&relay.queue).await;
    {
        let wire = relay.wire.lock().unwrap();
        assert_eq!(wire.connects, 1);
        assert_eq!(
            wire.sent,
            vec![(
                "ops@example.org".to_string(),
                "Backup\n\nBackup finished\n\nRun 7\nhttps://backup.example.com/run/7".to_string()
            )]
        );
    }

    let report = relay.stop().await;
    assert_eq!(report.started, 1);
}

#[tokio::test]
async fn test_dropped_session_reconnects_once() {
    let relay = start_relay(create_test_application(), create_test_target(true)).await;
    relay.wire.lock().unwrap().broken = true;

    let status = post(
        &relay.app,
        &format!("/{}", APP_TOKEN),
        json!({"message": "after the drop"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    wait_for_idle(&relay.queue).await;
    {
        let wire = relay.wire.lock().unwrap();
        assert_eq!(wire.connects, 2);
        assert_eq!(wire.sent.len(), 1);
        assert_eq!(wire.sent[0].1, "\n\nafter the drop\n");
    }
    assert!(relay.queue.dead_letters().await.is_empty());

    relay.stop().await;
}

#[tokio::test]
async fn test_encrypted_message_never_reaches_target_in_clear() {
    let identity = age::x25519::Identity::generate();
    let mut application = create_test_application();
    application.encryption_type = EncryptionType::Age;
    application.encryption_recipients = vec![identity.to_public().to_string()];
    application.encrypt_message = true;

    let relay = start_relay(application, create_test_target(true)).await;
    let status = post(
        &relay.app,
        "/1/messages.json",
        json!({"token": APP_TOKEN, "title": "Vault", "message": "the password is hunter2"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    wait_for_idle(&relay.queue).await;
    let body = relay.wire.lock().unwrap().sent[0].1.clone();
    assert!(body.starts_with("Vault\n\n-----BEGIN AGE ENCRYPTED FILE-----"));
    assert!(!body.contains("hunter2"));

    // to_text appends a newline after the armored block
    let armored = format!("{}\n", body.trim_start_matches("Vault\n\n").trim_end());
    let decryptor = match age::Decryptor::new(age::armor::ArmoredReader::new(armored.as_bytes()))
        .unwrap()
    {
        age::Decryptor::Recipients(d) => d,
        _ => panic!("expected recipients decryptor"),
    };
    let mut reader = decryptor
        .decrypt(iter::once(&identity as &dyn age::Identity))
        .unwrap();
    let mut plaintext = String::new();
    reader.read_to_string(&mut plaintext).unwrap();
    assert_eq!(plaintext, "the password is hunter2");

    relay.stop().await;
}

#[tokio::test]
async fn test_disabled_target_via_submit_is_skipped() {
    let relay = start_relay(create_test_application(), create_test_target(false)).await;

    let status = post(
        &relay.app,
        &format!("/_internal/submit/{}", APP_TOKEN),
        json!({"message": "nobody listens"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    wait_for_idle(&relay.queue).await;
    assert!(relay.wire.lock().unwrap().sent.is_empty());
    assert!(relay.queue.dead_letters().await.is_empty());
    assert_eq!(relay.queue.stats().await.unwrap().dead, 0);

    relay.stop().await;
}
