use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tabmux_agent::backoff::BackoffPolicy;
use tabmux_agent::{Agent, AgentConfig, BrowserEvent, Identity, MemoryBrowser};
use tabmux_core::clock::SystemClock;
use tabmux_core::sort::{Section, SortedEntry};
use tabmux_core::{SessionTab, Tab, TabChanges, Window, WindowType};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

type Companion = WebSocketStream<TcpStream>;

struct Harness {
    listener: TcpListener,
    browser: Arc<MemoryBrowser>,
    events: mpsc::UnboundedSender<BrowserEvent>,
    views: mpsc::UnboundedReceiver<Vec<SortedEntry>>,
    shutdown: oneshot::Sender<()>,
    agent: JoinHandle<()>,
}

fn tab(id: i64, window_id: i64, active: bool) -> Tab {
    Tab {
        id,
        window_id,
        index: id as u32,
        url: format!("https://example.com/{id}"),
        title: format!("Tab {id}"),
        fav_icon_url: None,
        pinned: false,
        active,
        audible: false,
        last_accessed: Some(1_000 + id),
    }
}

async fn start() -> Harness {
    start_with(Duration::from_secs(5)).await
}

async fn start_with(handshake_timeout: Duration) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let mut config = AgentConfig::new(Url::parse(&format!("ws://{addr}/ws")).expect("url"));
    config.transport.extension_version = "9.9.9".to_string();
    config.transport.keepalive_interval = Duration::from_secs(60);
    config.transport.handshake_timeout = handshake_timeout;
    config.transport.backoff = BackoffPolicy {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(200),
    };

    let browser = Arc::new(MemoryBrowser::with_state(
        vec![Window {
            id: 1,
            window_type: WindowType::Normal,
            focused: true,
        }],
        vec![tab(1, 1, true), tab(2, 1, false)],
    ));
    let identity = Identity {
        instance_id: "instance-test".to_string(),
        runtime_session_id: "runtime-test".to_string(),
    };
    let mut agent = Agent::new(&config, identity, browser.clone(), Arc::new(SystemClock));
    let (views_tx, views) = mpsc::unbounded_channel();
    agent.subscribe_view(Box::new(move |_, entries: &[SortedEntry]| {
        let _ = views_tx.send(entries.to_vec());
    }));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let agent = tokio::spawn(agent.run(events_rx, async move {
        let _ = shutdown_rx.await;
    }));

    Harness {
        listener,
        browser,
        events: events_tx,
        views,
        shutdown: shutdown_tx,
        agent,
    }
}

impl Harness {
    async fn accept(&self) -> Companion {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("agent connects in time")
            .expect("accept");
        accept_async(stream).await.expect("websocket handshake")
    }

    /// Accepts the agent and completes the protocol handshake.
    async fn establish(&self) -> Companion {
        let mut ws = self.accept().await;
        let connect = recv_json(&mut ws).await;
        assert_eq!(connect["type"], "connect");
        send_json(
            &mut ws,
            json!({"v": 1, "type": "connected", "payload": {"ok": true, "serverVersion": "test"}}),
        )
        .await;
        let snapshot = recv_json(&mut ws).await;
        assert_eq!(snapshot["type"], "snapshot");
        ws
    }

    async fn next_view(&mut self) -> Vec<SortedEntry> {
        timeout(WAIT, self.views.recv())
            .await
            .expect("view in time")
            .expect("view stream open")
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        timeout(WAIT, self.agent)
            .await
            .expect("agent stops in time")
            .expect("agent task");
    }
}

async fn recv_json(ws: &mut Companion) -> Value {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

async fn send_json(ws: &mut Companion, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send");
}

/// Collects text frames until the agent closes the socket.
async fn drain_until_closed(ws: &mut Companion) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        match timeout(WAIT, ws.next()).await.expect("close in time") {
            Some(Ok(Message::Text(text))) => {
                frames.push(serde_json::from_str(&text).expect("json frame"));
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return frames,
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn handshake_pushes_snapshot_then_streams_events() {
    let harness = start().await;
    let mut ws = harness.accept().await;

    let connect = recv_json(&mut ws).await;
    assert_eq!(connect["v"], 1);
    assert_eq!(connect["type"], "connect");
    assert_eq!(connect["seq"], 1);
    assert_eq!(connect["instanceId"], "instance-test");
    assert_eq!(connect["runtimeSessionId"], "runtime-test");
    assert_eq!(connect["payload"]["browserType"], "chrome");
    assert_eq!(connect["payload"]["extensionVersion"], "9.9.9");
    let connection_id = connect["connectionId"].as_str().expect("connection id").to_string();
    assert!(!connection_id.is_empty());

    send_json(
        &mut ws,
        json!({"v": 1, "type": "connected", "payload": {"ok": true, "serverVersion": "1.0.0"}}),
    )
    .await;

    let snapshot = recv_json(&mut ws).await;
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["seq"], 2);
    assert_eq!(snapshot["connectionId"], connection_id.as_str());
    assert_eq!(snapshot["payload"]["sessionTabs"].as_array().map(Vec::len), Some(2));
    assert_eq!(snapshot["payload"]["sessionWindows"].as_array().map(Vec::len), Some(1));
    assert_eq!(snapshot["payload"]["augmentation"], json!({}));

    harness
        .events
        .send(BrowserEvent::TabActivated {
            tab_id: 2,
            window_id: 1,
        })
        .expect("send event");
    let activated = recv_json(&mut ws).await;
    assert_eq!(activated["type"], "event");
    assert_eq!(activated["seq"], 3);
    assert_eq!(activated["payload"]["event"], "tab.activated");
    assert_eq!(activated["payload"]["tabId"], 2);
    assert_eq!(activated["payload"]["previousTabId"], 1);

    harness
        .events
        .send(BrowserEvent::TabUpdated {
            tab_id: 2,
            changes: TabChanges {
                title: Some("Inbox (4)".to_string()),
                ..TabChanges::default()
            },
        })
        .expect("send event");
    let updated = recv_json(&mut ws).await;
    assert_eq!(updated["seq"], 4);
    assert_eq!(updated["payload"]["event"], "tab.updated");
    assert_eq!(updated["payload"]["changes"], json!({"title": "Inbox (4)"}));

    harness.stop().await;
}

#[tokio::test]
async fn commands_drive_browser_and_bad_messages_are_dropped() {
    let harness = start().await;
    let mut ws = harness.establish().await;

    send_json(
        &mut ws,
        json!({"v": 1, "type": "command", "payload": {"command": "activateTab", "tabId": 2}}),
    )
    .await;
    timeout(WAIT, async {
        while harness.browser.calls() != vec!["activate:2", "focus:1"] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("activate and focus issued");

    send_json(
        &mut ws,
        json!({"v": 1, "type": "command", "payload": {"command": "requestSnapshot"}}),
    )
    .await;
    let snapshot = recv_json(&mut ws).await;
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["seq"], 3);

    send_json(
        &mut ws,
        json!({"v": 1, "type": "command", "payload": {"command": "closeTab", "tabId": "two"}}),
    )
    .await;
    send_json(&mut ws, json!({"v": 1, "type": "warp", "payload": {}})).await;
    ws.send(Message::Text("not json".to_string()))
        .await
        .expect("send garbage");
    send_json(&mut ws, json!({"v": 1, "type": "ping", "payload": {}})).await;

    let pong = recv_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["seq"], 4);
    assert_eq!(pong["payload"], json!({}));

    harness.stop().await;
}

#[tokio::test]
async fn rejected_handshake_reconnects_with_fresh_connection() {
    let harness = start().await;
    let mut first = harness.accept().await;
    let connect = recv_json(&mut first).await;
    let first_connection = connect["connectionId"].as_str().expect("id").to_string();

    send_json(
        &mut first,
        json!({"v": 1, "type": "connected", "payload": {"ok": false, "error": "busy"}}),
    )
    .await;
    let leftovers = drain_until_closed(&mut first).await;
    assert!(leftovers.iter().all(|frame| frame["type"] != "snapshot"));

    let mut second = harness.accept().await;
    let reconnect = recv_json(&mut second).await;
    assert_eq!(reconnect["type"], "connect");
    assert_eq!(reconnect["seq"], 1);
    assert_ne!(reconnect["connectionId"], first_connection.as_str());
    assert_eq!(reconnect["instanceId"], "instance-test");

    harness.stop().await;
}

#[tokio::test]
async fn dropped_companion_is_reconnected_and_resynced() {
    let harness = start().await;
    let ws = harness.establish().await;
    drop(ws);

    let mut ws = harness.accept().await;
    let connect = recv_json(&mut ws).await;
    assert_eq!(connect["seq"], 1);
    send_json(
        &mut ws,
        json!({"v": 1, "type": "connected", "payload": {"ok": true}}),
    )
    .await;
    let snapshot = recv_json(&mut ws).await;
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["seq"], 2);

    harness.stop().await;
}

#[tokio::test]
async fn closing_the_event_stream_stops_the_agent() {
    let harness = start().await;
    let mut ws = harness.establish().await;
    let Harness {
        events,
        agent,
        shutdown: _shutdown,
        ..
    } = harness;

    drop(events);
    timeout(WAIT, agent)
        .await
        .expect("agent stops in time")
        .expect("agent task");
    drain_until_closed(&mut ws).await;
}

#[tokio::test]
async fn silent_companion_is_abandoned_after_handshake_timeout() {
    let harness = start_with(Duration::from_millis(150)).await;
    let mut silent = harness.accept().await;
    let first = recv_json(&mut silent).await;
    assert_eq!(first["type"], "connect");

    let leftovers = drain_until_closed(&mut silent).await;
    assert!(leftovers.is_empty());

    let mut retry = harness.accept().await;
    let connect = recv_json(&mut retry).await;
    assert_eq!(connect["type"], "connect");
    assert_eq!(connect["seq"], 1);
    assert_ne!(connect["connectionId"], first["connectionId"]);

    harness.stop().await;
}

#[tokio::test]
async fn sessions_change_alone_republishes_the_view() {
    let mut harness = start().await;
    let initial = harness.next_view().await;
    assert!(initial
        .iter()
        .all(|entry| entry.section != Section::RecentlyClosed));

    harness
        .events
        .send(BrowserEvent::SessionsChanged {
            recently_closed: vec![SessionTab {
                session_id: Some("s-1".to_string()),
                window_id: None,
                url: "https://example.com/closed".to_string(),
                title: "Closed".to_string(),
                fav_icon_url: None,
                last_modified: 1_700_000_000,
            }],
            other_devices: Vec::new(),
        })
        .expect("send event");

    let view = harness.next_view().await;
    let closed: Vec<&SortedEntry> = view
        .iter()
        .filter(|entry| entry.section == Section::RecentlyClosed)
        .collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(view.len(), 3);

    harness.stop().await;
}
