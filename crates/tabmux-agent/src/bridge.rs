//! NDJSON bridge to the browser-side shim over a pair of byte streams
//! (stdin/stdout in the binary).
//!
//! Inbound lines are browser events or replies to calls; outbound lines are
//! browser API calls and rendered switcher views.

use crate::browser::{BrowserApi, BrowserApiError, BrowserEvent};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabmux_core::sort::{SortStrategy, SortedEntry};
use tabmux_core::wire::{encode_frame, FrameError, NdjsonFrameDecoder, MAX_BULK_FRAME_BYTES};
use tabmux_core::{DeviceSession, SessionTab, Tab, TabId, Window, WindowId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HostInbound {
    Event(BrowserEvent),
    Reply(Reply),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HostOutbound {
    Call { id: u64, call: BrowserCall },
    View {
        strategy: SortStrategy,
        entries: Vec<SortedEntry>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "method",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum BrowserCall {
    QueryTabs,
    QueryWindows,
    ActivateTab { tab_id: TabId },
    FocusWindow { window_id: WindowId },
    RemoveTab { tab_id: TabId },
    RecentlyClosed,
    OtherDevices,
}

impl BrowserCall {
    pub fn name(&self) -> &'static str {
        match self {
            BrowserCall::QueryTabs => "queryTabs",
            BrowserCall::QueryWindows => "queryWindows",
            BrowserCall::ActivateTab { .. } => "activateTab",
            BrowserCall::FocusWindow { .. } => "focusWindow",
            BrowserCall::RemoveTab { .. } => "removeTab",
            BrowserCall::RecentlyClosed => "recentlyClosed",
            BrowserCall::OtherDevices => "otherDevices",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub call_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            max_frame_bytes: MAX_BULK_FRAME_BYTES,
        }
    }
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// `BrowserApi` served by the shim on the other end of the bridge.
pub struct StdioBrowser {
    outbound: mpsc::UnboundedSender<HostOutbound>,
    pending: PendingCalls,
    next_id: AtomicU64,
    call_timeout: Duration,
}

impl StdioBrowser {
    async fn call<T: DeserializeOwned>(&self, call: BrowserCall) -> Result<T, BrowserApiError> {
        let name = call.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| BrowserApiError::BridgeClosed)?
            .insert(id, reply_tx);

        if self.outbound.send(HostOutbound::Call { id, call }).is_err() {
            self.forget(id);
            return Err(BrowserApiError::BridgeClosed);
        }

        let reply = match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(BrowserApiError::BridgeClosed),
            Err(_) => {
                self.forget(id);
                return Err(BrowserApiError::Timeout { call: name });
            }
        };
        if !reply.ok {
            return Err(BrowserApiError::Failed {
                call: name,
                message: reply.error.unwrap_or_default(),
            });
        }
        serde_json::from_value(reply.result).map_err(|err| BrowserApiError::Failed {
            call: name,
            message: format!("unexpected result: {err}"),
        })
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

#[async_trait]
impl BrowserApi for StdioBrowser {
    async fn query_tabs(&self) -> Result<Vec<Tab>, BrowserApiError> {
        self.call(BrowserCall::QueryTabs).await
    }

    async fn query_windows(&self) -> Result<Vec<Window>, BrowserApiError> {
        self.call(BrowserCall::QueryWindows).await
    }

    async fn activate_tab(&self, tab_id: TabId) -> Result<Tab, BrowserApiError> {
        self.call(BrowserCall::ActivateTab { tab_id }).await
    }

    async fn focus_window(&self, window_id: WindowId) -> Result<(), BrowserApiError> {
        let _: Value = self.call(BrowserCall::FocusWindow { window_id }).await?;
        Ok(())
    }

    async fn remove_tab(&self, tab_id: TabId) -> Result<(), BrowserApiError> {
        let _: Value = self.call(BrowserCall::RemoveTab { tab_id }).await?;
        Ok(())
    }

    async fn recently_closed(&self) -> Result<Vec<SessionTab>, BrowserApiError> {
        self.call(BrowserCall::RecentlyClosed).await
    }

    async fn other_devices(&self) -> Result<Vec<DeviceSession>, BrowserApiError> {
        self.call(BrowserCall::OtherDevices).await
    }
}

/// Both halves of a running bridge. `events` closes when the input stream
/// reaches EOF.
pub struct Bridge {
    pub browser: Arc<StdioBrowser>,
    pub events: mpsc::UnboundedReceiver<BrowserEvent>,
    pub outbound: mpsc::UnboundedSender<HostOutbound>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

pub fn spawn_bridge<R, W>(reader: R, writer: W, config: BridgeConfig) -> Bridge
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

    let browser = Arc::new(StdioBrowser {
        outbound: outbound_tx.clone(),
        pending: pending.clone(),
        next_id: AtomicU64::new(1),
        call_timeout: config.call_timeout,
    });

    let reader = tokio::spawn(read_loop(reader, events_tx, pending, config.max_frame_bytes));
    let writer = tokio::spawn(write_loop(writer, outbound_rx, config.max_frame_bytes));

    Bridge {
        browser,
        events: events_rx,
        outbound: outbound_tx,
        reader,
        writer,
    }
}

async fn read_loop<R>(
    mut reader: R,
    events: mpsc::UnboundedSender<BrowserEvent>,
    pending: PendingCalls,
    max_frame_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = NdjsonFrameDecoder::<HostInbound>::new(max_frame_bytes);
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(event = "bridge_read_failed", error = %err);
                break;
            }
        };
        for frame in decoder.push_chunk(&buf[..read]) {
            route_decoded(frame, &events, &pending);
        }
    }
    if let Some(frame) = decoder.finish() {
        route_decoded(frame, &events, &pending);
    }
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
    info!(event = "bridge_input_closed");
}

fn route_decoded(
    frame: Result<HostInbound, FrameError>,
    events: &mpsc::UnboundedSender<BrowserEvent>,
    pending: &PendingCalls,
) {
    let frame = match frame {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event = "bridge_frame_invalid", error = %err);
            return;
        }
    };
    match frame {
        HostInbound::Event(event) => {
            let _ = events.send(event);
        }
        HostInbound::Reply(reply) => {
            let waiter = pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&reply.id));
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(reply);
                }
                None => debug!(event = "bridge_reply_unmatched", id = reply.id),
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<HostOutbound>,
    max_frame_bytes: usize,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let frame = match encode_frame(&message, max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "bridge_encode_failed", error = %err);
                continue;
            }
        };
        if let Err(err) = writer.write_all(&frame).await {
            warn!(event = "bridge_write_failed", error = %err);
            break;
        }
        if let Err(err) = writer.flush().await {
            warn!(event = "bridge_write_failed", error = %err);
            break;
        }
    }
}
