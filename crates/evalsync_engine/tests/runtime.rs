use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use evalsync_core::{
    ClientConfig, ConnectionOptions, EvaluationStatus, StatusSnapshot, StoreEvent,
};
use evalsync_engine::{
    ClientHandle, Connector, FailureKind, FetchError, StatusClient, Transport, TransportError,
};
use pretty_assertions::assert_eq;
use tokio::sync::{broadcast, mpsc};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(evalsync_logging::initialize_for_tests);
}

/// In-memory push server: tests write frames per url and observe closes.
#[derive(Default)]
struct FakeServer {
    refuse: bool,
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    connects: Mutex<Vec<String>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    fn push(&self, url: &str, frame: &str) {
        let peers = self.peers.lock().unwrap();
        peers[url].send(frame.to_string()).unwrap();
    }

    fn connected(&self, url: &str) -> bool {
        self.peers.lock().unwrap().contains_key(url)
    }

    fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

struct FakeTransport {
    url: String,
    frames: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Connector for FakeServer {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.connects.lock().unwrap().push(url.to_string());
        if self.refuse {
            return Err(TransportError::Connect("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().unwrap().insert(url.to_string(), tx);
        Ok(Box::new(FakeTransport {
            url: url.to_string(),
            frames: rx,
            sent: self.sent.clone(),
            closed: self.closed.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.frames.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.lock().unwrap().push(self.url.clone());
        Ok(())
    }
}

/// Serves canned snapshots; ids without one fail with 503.
#[derive(Default)]
struct FakeApi {
    snapshots: Mutex<HashMap<String, StatusSnapshot>>,
}

impl FakeApi {
    fn with(id: &str, status: EvaluationStatus, score: Option<f64>) -> Self {
        let api = Self::default();
        api.snapshots.lock().unwrap().insert(
            id.to_string(),
            StatusSnapshot {
                id: id.to_string(),
                status,
                overall_score: score,
                ..StatusSnapshot::default()
            },
        );
        api
    }
}

#[async_trait::async_trait]
impl StatusClient for FakeApi {
    async fn fetch_status(&self, evaluation_id: &str) -> Result<StatusSnapshot, FetchError> {
        self.snapshots
            .lock()
            .unwrap()
            .get(evaluation_id)
            .cloned()
            .ok_or_else(|| FetchError {
                kind: FailureKind::HttpStatus(503),
                message: "unavailable".into(),
            })
    }

    async fn fetch_list(&self) -> Result<Vec<StatusSnapshot>, FetchError> {
        Ok(self.snapshots.lock().unwrap().values().cloned().collect())
    }
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        poll_interval_ms: 20,
        terminal_grace_ms: 50,
        connection: ConnectionOptions {
            reconnect_delay_ms: 10,
            ..ConnectionOptions::default()
        },
        ..ClientConfig::default()
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<StoreEvent>, mut predicate: F) -> StoreEvent
where
    F: FnMut(&StoreEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("event arrives in time")
}

async fn until(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition holds in time");
}

const E1_URL: &str = "ws://localhost:8000/ws/evaluations/e1";

#[tokio::test]
async fn push_updates_flow_to_subscribers() {
    init_logging();
    let server = Arc::new(FakeServer::default());
    let api = Arc::new(FakeApi::default());
    let handle = ClientHandle::with_parts(fast_config(), server.clone(), api).unwrap();
    let mut events = handle.events();

    let guard = handle.track("e1");
    assert_eq!(guard.id(), "e1");
    until(|| server.connected(E1_URL)).await;

    server.push(E1_URL, r#"{"type":"progress","percent_complete":40}"#);
    wait_for(&mut events, |event| {
        matches!(event, StoreEvent::RecordChanged(record) if record.progress_percent == 40.0)
    })
    .await;
    assert_eq!(handle.get("e1").map(|r| r.status), Some(EvaluationStatus::Running));

    server.push(E1_URL, r#"{"type":"complete","overall_score":85}"#);
    wait_for(&mut events, |event| {
        matches!(event, StoreEvent::TrackingReleased(id) if id == "e1")
    })
    .await;

    let record = handle.get("e1").unwrap();
    assert_eq!(record.status, EvaluationStatus::Completed);
    assert_eq!(record.overall_score, Some(85.0));
    until(|| server.closed() == vec![E1_URL.to_string()]).await;

    drop(guard);
    handle.shutdown();
}

#[tokio::test]
async fn polling_covers_a_refused_push_channel() {
    init_logging();
    let server = Arc::new(FakeServer::refusing());
    let api = Arc::new(FakeApi::with("e1", EvaluationStatus::Completed, Some(72.0)));
    let mut config = fast_config();
    config.connection.reconnect = false;
    let handle = ClientHandle::with_parts(config, server.clone(), api).unwrap();
    let mut events = handle.events();

    let _guard = handle.track("e1");
    let event = wait_for(&mut events, |event| {
        matches!(event, StoreEvent::RecordChanged(record) if record.is_terminal())
    })
    .await;

    let StoreEvent::RecordChanged(record) = event else {
        unreachable!()
    };
    assert_eq!(record.overall_score, Some(72.0));
    assert_eq!(server.connects.lock().unwrap().len(), 1);
    handle.shutdown();
}

#[tokio::test]
async fn dropping_the_guard_releases_the_channel() {
    init_logging();
    let server = Arc::new(FakeServer::default());
    let handle =
        ClientHandle::with_parts(fast_config(), server.clone(), Arc::new(FakeApi::default()))
            .unwrap();
    let mut events = handle.events();

    let first = handle.track("e1");
    let second = handle.track("e1");
    until(|| server.connected(E1_URL)).await;

    drop(first);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(handle.snapshot().is_tracked("e1"));

    drop(second);
    wait_for(&mut events, |event| {
        matches!(event, StoreEvent::TrackingReleased(id) if id == "e1")
    })
    .await;
    until(|| server.closed().len() == 1).await;
    assert_eq!(server.connects.lock().unwrap().len(), 1);
    handle.shutdown();
}

#[tokio::test]
async fn shutdown_closes_everything_and_is_idempotent() {
    init_logging();
    let server = Arc::new(FakeServer::default());
    let handle =
        ClientHandle::with_parts(fast_config(), server.clone(), Arc::new(FakeApi::default()))
            .unwrap();

    let _a = handle.track("a");
    let _b = handle.track("b");
    handle.subscribe_broadcast();
    until(|| server.peers.lock().unwrap().len() == 3).await;

    handle.shutdown();
    handle.shutdown();

    let mut closed = server.closed();
    closed.sort();
    assert_eq!(
        closed,
        vec![
            "ws://localhost:8000/ws/broadcast".to_string(),
            "ws://localhost:8000/ws/evaluations/a".to_string(),
            "ws://localhost:8000/ws/evaluations/b".to_string(),
        ]
    );
    let snapshot = handle.snapshot();
    assert!(snapshot.tracked.is_empty());
}
