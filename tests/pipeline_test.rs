//! End-to-end pipeline tests: a real WebSocket push server on a localhost
//! port feeds scripted frames through a real channel, and we assert on the
//! published snapshots, the notifications, and the channel state.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use deckd::auth::{StaticToken, TokenProvider};
use deckd::backend::{BackendError, TaskBackend};
use deckd::config::{ChannelConfig, SyncConfig};
use deckd::lifecycle::StepStatus;
use deckd::notify::{BroadcastSink, NotificationSink};
use deckd::pipeline::Pipeline;
use deckd::sync::ChannelState;
use deckd::Task;

const WAIT: Duration = Duration::from_secs(5);

// ─── Fixtures ────────────────────────────────────────────────────────────────

struct FixedBackend(Vec<Task>);

#[async_trait::async_trait]
impl TaskBackend for FixedBackend {
    async fn list_tasks(&self) -> Result<Vec<Task>, BackendError> {
        Ok(self.0.clone())
    }
}

fn test_config(addr: &str) -> SyncConfig {
    SyncConfig {
        stream_url: format!("ws://{addr}"),
        api_base_url: "http://127.0.0.1:1".to_string(),
        channel: ChannelConfig {
            initial_delay_ms: 20,
            max_delay_ms: 100,
            multiplier: 2.0,
            max_attempts: 5,
            queue_capacity: 64,
        },
        log: Default::default(),
    }
}

fn backend_task(id: i64, title: &str) -> Task {
    serde_json::from_value(json!({
        "id": id,
        "title": title,
        "updated_at": "2026-08-01T12:00:00Z",
    }))
    .unwrap()
}

/// Serve each script batch on one accepted connection, closing the
/// connection after the batch. Afterwards, keep accepting reconnects and
/// hold them open so the channel idles instead of cycling.
async fn run_push_server(listener: TcpListener, scripts: Vec<Vec<String>>) {
    for frames in scripts {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for frame in frames {
            ws.send(Message::Text(frame)).await.unwrap();
        }
        ws.close(None).await.ok();
    }
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            break;
        };
        tokio::spawn(async move {
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            while let Some(msg) = ws.next().await {
                if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
        });
    }
}

struct Harness {
    views: deckd::PipelineViews,
    stop: deckd::StopHandle,
    notif_rx: tokio::sync::broadcast::Receiver<String>,
    pipeline_task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn start_pipeline(config: &SyncConfig, backend: Arc<dyn TaskBackend>) -> Harness {
    let token: Arc<dyn TokenProvider> = Arc::new(StaticToken("test-token".to_string()));
    let sink = Arc::new(BroadcastSink::new());
    let notif_rx = sink.subscribe();
    let sink_dyn: Arc<dyn NotificationSink> = sink;
    let (pipeline, views, stop) = Pipeline::new(config, token, backend, sink_dyn);
    let pipeline_task = tokio::spawn(pipeline.run());
    Harness {
        views,
        stop,
        notif_rx,
        pipeline_task,
    }
}

async fn recv_notifications(
    rx: &mut tokio::sync::broadcast::Receiver<String>,
    n: usize,
) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    for _ in 0..n {
        let wire = timeout(WAIT, rx.recv())
            .await
            .expect("notification never arrived")
            .unwrap();
        out.push(serde_json::from_str(&wire).unwrap());
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_end_to_end_run_and_mutations() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let frames = vec![
        json!({"type": "agent_start", "agent": "Run"}).to_string(),
        json!({"type": "llm_start", "agent": "Run", "model": "gpt-4o"}).to_string(),
        json!({"type": "llm_end", "agent": "Run"}).to_string(),
        // Malformed and unknown frames must be skipped, not fatal.
        "{this is not json".to_string(),
        json!({"type": "telemetry_blip", "x": 1}).to_string(),
        json!({
            "type": "tool_call",
            "tool": "add_task",
            "call_id": "c-1",
            "arguments": {"title": "Buy milk"}
        })
        .to_string(),
        // Backend change feed shape, interleaved with the agent run.
        json!({
            "eventType": "task.created",
            "task": {"id": 1, "title": "Buy milk", "updated_at": "2026-08-01T10:00:00Z"},
            "serverTimestamp": "2026-08-01T10:00:00Z"
        })
        .to_string(),
        json!({"type": "tool_result", "tool": "add_task", "call_id": "c-1", "output": {"ok": true}})
            .to_string(),
        json!({"type": "agent_end", "agent": "Run"}).to_string(),
        json!({
            "eventType": "task.updated",
            "task": {"id": 1, "title": "Buy oat milk", "updated_at": "2026-08-01T10:00:20Z"},
            "serverTimestamp": "2026-08-01T10:00:20Z"
        })
        .to_string(),
        // Stale: older serverTimestamp than the update above — dropped.
        json!({
            "eventType": "task.updated",
            "task": {"id": 1, "title": "stale title", "updated_at": "2026-08-01T10:00:10Z"},
            "serverTimestamp": "2026-08-01T10:00:10Z"
        })
        .to_string(),
        // Sentinel: once visible, everything before it has been applied.
        json!({
            "eventType": "task.created",
            "task": {"id": 99, "title": "sentinel", "updated_at": "2026-08-01T10:00:30Z"},
            "serverTimestamp": "2026-08-01T10:00:30Z"
        })
        .to_string(),
    ];
    let server = tokio::spawn(run_push_server(listener, vec![frames]));

    let config = test_config(&addr);
    let mut h = start_pipeline(&config, Arc::new(FixedBackend(vec![])));

    let mut tasks = h.views.tasks.clone();
    timeout(WAIT, tasks.wait_for(|t| t.iter().any(|t| t.id == 99)))
        .await
        .expect("sentinel task never appeared")
        .unwrap();

    let snapshot = tasks.borrow().clone();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].id, 1);
    assert_eq!(snapshot[0].title, "Buy oat milk", "stale update must not win");

    let mut lifecycle = h.views.lifecycle.clone();
    timeout(
        WAIT,
        lifecycle.wait_for(|steps| {
            steps.len() == 5 && steps.iter().all(|s| s.status == StepStatus::Completed)
        }),
    )
    .await
    .expect("lifecycle never settled")
    .unwrap();

    let steps = lifecycle.borrow().clone();
    assert_eq!(steps[3].step_type, deckd::StepType::ToolRunning);

    // Exactly three acknowledgements: created, updated, sentinel created.
    // The stale update was dropped silently.
    let notifications = recv_notifications(&mut h.notif_rx, 3).await;
    assert_eq!(notifications[0]["params"]["severity"], "success");
    assert_eq!(notifications[0]["params"]["navigate_to"], 1);
    assert_eq!(notifications[1]["params"]["severity"], "default");
    assert_eq!(notifications[2]["params"]["navigate_to"], 99);

    h.stop.stop();
    h.pipeline_task.await.unwrap().unwrap();
    server.abort();
}

#[tokio::test]
async fn test_reconnect_applies_exactly_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let batch1 = vec![json!({
        "eventType": "task.created",
        "task": {"id": 1, "title": "Buy milk", "updated_at": "2026-08-01T10:00:00Z"},
        "serverTimestamp": "2026-08-01T10:00:00Z"
    })
    .to_string()];
    // The server redelivers the created event after the drop — the store
    // must not apply it twice.
    let batch2 = vec![
        json!({
            "eventType": "task.created",
            "task": {"id": 1, "title": "Buy milk", "updated_at": "2026-08-01T10:00:00Z"},
            "serverTimestamp": "2026-08-01T10:00:00Z"
        })
        .to_string(),
        json!({
            "eventType": "task.updated",
            "task": {"id": 1, "title": "Buy oat milk", "updated_at": "2026-08-01T10:00:20Z"},
            "serverTimestamp": "2026-08-01T10:00:20Z"
        })
        .to_string(),
        json!({
            "eventType": "task.created",
            "task": {"id": 99, "title": "sentinel", "updated_at": "2026-08-01T10:00:30Z"},
            "serverTimestamp": "2026-08-01T10:00:30Z"
        })
        .to_string(),
    ];
    let server = tokio::spawn(run_push_server(listener, vec![batch1, batch2]));

    let config = test_config(&addr);
    let mut h = start_pipeline(&config, Arc::new(FixedBackend(vec![])));

    let mut tasks = h.views.tasks.clone();
    timeout(WAIT, tasks.wait_for(|t| t.iter().any(|t| t.id == 99)))
        .await
        .expect("sentinel task never appeared")
        .unwrap();

    let snapshot = tasks.borrow().clone();
    assert_eq!(snapshot[0].title, "Buy oat milk");

    // created, updated, sentinel created — the redelivered create is silent.
    let notifications = recv_notifications(&mut h.notif_rx, 3).await;
    assert_eq!(notifications[0]["params"]["severity"], "success");
    assert_eq!(notifications[1]["params"]["severity"], "default");
    assert_eq!(notifications[2]["params"]["navigate_to"], 99);

    h.stop.stop();
    h.pipeline_task.await.unwrap().unwrap();
    server.abort();
}

#[tokio::test]
async fn test_token_expiry_without_refresh_ends_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // Server accepts, then immediately closes with the token-expired code.
    // StaticToken cannot refresh, so the channel must end the session.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.close(Some(CloseFrame {
            code: CloseCode::from(4401u16),
            reason: "token expired".into(),
        }))
        .await
        .ok();
    });

    let config = test_config(&addr);
    let h = start_pipeline(&config, Arc::new(FixedBackend(vec![])));

    let mut state = h.views.channel_state.clone();
    timeout(WAIT, state.wait_for(|s| *s == ChannelState::SessionEnded))
        .await
        .expect("session never ended")
        .unwrap();

    h.stop.stop();
    h.pipeline_task.await.unwrap().unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_offline_then_recovery_refreshes_cache() {
    // Reserve a port, then drop the listener so every connect fails.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = test_config(&addr.to_string());
    config.channel.max_attempts = 1; // go offline on the first failure

    let backend = Arc::new(FixedBackend(vec![backend_task(42, "from backend")]));
    let h = start_pipeline(&config, backend);

    let mut state = h.views.channel_state.clone();
    timeout(WAIT, state.wait_for(|s| *s == ChannelState::Offline))
        .await
        .expect("channel never reported offline")
        .unwrap();

    // Bring the server up on the same port; the channel is still probing.
    let listener = TcpListener::bind(addr).await.unwrap();
    let server = tokio::spawn(run_push_server(listener, vec![]));

    timeout(WAIT, state.wait_for(|s| *s == ChannelState::Online))
        .await
        .expect("channel never came back online")
        .unwrap();

    // Recovery path: full refresh from the authoritative backend.
    let mut tasks = h.views.tasks.clone();
    timeout(WAIT, tasks.wait_for(|t| t.iter().any(|t| t.id == 42)))
        .await
        .expect("refreshed cache never appeared")
        .unwrap();

    h.stop.stop();
    h.pipeline_task.await.unwrap().unwrap();
    server.abort();
}
