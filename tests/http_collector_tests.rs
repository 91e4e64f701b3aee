use axum::{
    Router,
    extract::{Query, State},
    routing::get,
};
use chrono::Utc;
use http::StatusCode;
use serde_json::{Value, json};
use stand_tracker::{
    AnonymousIdentity, Collector, CompletionPayload, DeliveryFailure, HttpCollector, MemoryStore,
    ReplayPolicy, StandTracker, TrackerConfig, TrackerError, Visit,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ack,
    StatusOk,
    Reject,
    ServerError,
    Garbage,
    Hang,
}

#[derive(Debug)]
struct FakeState {
    mode: Mode,
    next_id: i64,
    identity_calls: usize,
    reports: Vec<Value>,
}

#[derive(Clone)]
struct FakeCollector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCollector {
    fn new(next_id: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                mode: Mode::Ack,
                next_id,
                identity_calls: 0,
                reports: Vec::new(),
            })),
        }
    }

    fn set_mode(&self, mode: Mode) {
        self.state.lock().unwrap().mode = mode;
    }

    fn reports(&self) -> Vec<Value> {
        self.state.lock().unwrap().reports.clone()
    }

    fn identity_calls(&self) -> usize {
        self.state.lock().unwrap().identity_calls
    }
}

async fn handle_get(
    State(fake): State<FakeCollector>,
    Query(query): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    if query.get("action").map(String::as_str) != Some("newAnon") {
        return (StatusCode::OK, json!({"status": "alive"}).to_string());
    }
    let (mode, id) = {
        let mut state = fake.state.lock().unwrap();
        state.identity_calls += 1;
        (state.mode, state.next_id)
    };
    respond(mode, json!({ "id": id })).await
}

async fn handle_post(
    State(fake): State<FakeCollector>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> (StatusCode, String) {
    assert_eq!(query.get("action").map(String::as_str), Some("reportComplete"));
    let mode = {
        let mut state = fake.state.lock().unwrap();
        state.reports.push(serde_json::from_str(&body).unwrap());
        state.mode
    };
    respond(mode, json!({ "success": true })).await
}

async fn respond(mode: Mode, ok_body: Value) -> (StatusCode, String) {
    match mode {
        Mode::Ack => (StatusCode::OK, ok_body.to_string()),
        Mode::StatusOk => (StatusCode::OK, json!({"status": "ok"}).to_string()),
        Mode::Reject => (StatusCode::OK, json!({"success": false, "id": 0}).to_string()),
        Mode::ServerError => (StatusCode::INTERNAL_SERVER_ERROR, ok_body.to_string()),
        Mode::Garbage => (StatusCode::OK, "<html>quota exceeded</html>".to_string()),
        Mode::Hang => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            (StatusCode::OK, ok_body.to_string())
        }
    }
}

async fn spawn_fake(fake: FakeCollector) -> String {
    let app = Router::new()
        .route("/exec", get(handle_get).post(handle_post))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/exec", addr)
}

fn config(url: &str) -> TrackerConfig {
    TrackerConfig::new(url)
        .request_timeout(Duration::from_millis(300))
        .replay(ReplayPolicy::immediate())
}

fn payload() -> CompletionPayload {
    let now = Utc::now();
    CompletionPayload::new(
        AnonymousIdentity::new("8"),
        vec![Visit::new(1, now), Visit::new(2, now)],
        now,
    )
}

#[tokio::test]
async fn new_anon_returns_identity_string() {
    let fake = FakeCollector::new(31);
    let url = spawn_fake(fake.clone()).await;
    let collector = HttpCollector::new(&config(&url)).unwrap();

    let identity = collector.request_identity().await.unwrap();
    assert_eq!(identity.as_str(), "31");
    assert_eq!(fake.identity_calls(), 1);
}

#[tokio::test]
async fn new_anon_rejects_unusable_responses() {
    let fake = FakeCollector::new(0);
    let url = spawn_fake(fake.clone()).await;
    let collector = HttpCollector::new(&config(&url)).unwrap();

    for mode in [Mode::Ack, Mode::ServerError, Mode::Garbage, Mode::Hang] {
        fake.set_mode(mode);
        let err = collector.request_identity().await.unwrap_err();
        assert!(
            matches!(err, TrackerError::IdentityAssignment(_)),
            "{mode:?} gave {err:?}"
        );
    }
}

#[tokio::test]
async fn report_is_posted_with_wire_layout() {
    let fake = FakeCollector::new(1);
    let url = spawn_fake(fake.clone()).await;
    let collector = HttpCollector::new(&config(&url)).unwrap();

    collector.report_completion(&payload()).await.unwrap();
    fake.set_mode(Mode::StatusOk);
    collector.report_completion(&payload()).await.unwrap();

    let reports = fake.reports();
    assert_eq!(reports.len(), 2);
    let report = &reports[0];
    assert_eq!(report["action"], "reportComplete");
    assert_eq!(report["anonId"], "8");
    assert_eq!(report["visits"][1]["stand"], 2);
    assert!(report["visits"][0]["ts"].is_string());
    assert!(report["timestamp"].is_string());
}

#[tokio::test]
async fn report_failures_are_classified() {
    let fake = FakeCollector::new(1);
    let url = spawn_fake(fake.clone()).await;
    let collector = HttpCollector::new(&config(&url)).unwrap();

    fake.set_mode(Mode::Reject);
    assert_eq!(
        collector.report_completion(&payload()).await,
        Err(DeliveryFailure::Rejected)
    );

    fake.set_mode(Mode::ServerError);
    assert_eq!(
        collector.report_completion(&payload()).await,
        Err(DeliveryFailure::HttpStatus(500))
    );

    fake.set_mode(Mode::Garbage);
    assert!(matches!(
        collector.report_completion(&payload()).await,
        Err(DeliveryFailure::Malformed(_))
    ));

    fake.set_mode(Mode::Hang);
    assert!(matches!(
        collector.report_completion(&payload()).await,
        Err(DeliveryFailure::Network(_))
    ));
}

#[tokio::test]
async fn unreachable_collector_is_a_network_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/exec", listener.local_addr().unwrap());
    drop(listener);

    let collector = HttpCollector::new(&config(&url)).unwrap();
    assert!(!collector.probe().await);
    assert!(matches!(
        collector.report_completion(&payload()).await,
        Err(DeliveryFailure::Network(_))
    ));
}

#[tokio::test]
async fn tracker_over_http_queues_then_recovers() {
    let fake = FakeCollector::new(5);
    let url = spawn_fake(fake.clone()).await;
    let cfg = config(&url);
    let collector = Arc::new(HttpCollector::new(&cfg).unwrap());
    assert!(collector.probe().await);

    let mut tracker = StandTracker::new(
        Arc::new(MemoryStore::new()),
        collector,
        2,
        cfg.replay.clone(),
    )
    .unwrap();

    tracker.start(Some(1)).await.unwrap();
    fake.set_mode(Mode::ServerError);
    tracker.scan(2).await.unwrap();
    assert_eq!(tracker.pending_count().unwrap(), 1);
    assert!(!tracker.is_reported().unwrap());

    fake.set_mode(Mode::Ack);
    let summary = tracker.on_reconnect().await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert!(tracker.is_reported().unwrap());

    let reports = fake.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0]["visits"], reports[1]["visits"]);
    assert_eq!(reports[1]["anonId"], "5");
}
