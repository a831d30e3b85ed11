//! Companion session state machine.
//!
//! The machine performs no IO. Every input returns the list of actions the
//! driver has to carry out, in order, so the whole protocol can be exercised
//! without sockets or timers.

use crate::backoff::{Backoff, BackoffPolicy};
use crate::identity::{generate_connection_id, Identity};
use crate::tracker::SnapshotSource;
use std::sync::Arc;
use std::time::Duration;
use tabmux_core::clock::Clock;
use tabmux_core::wire::{
    decode_text, encode_text, Command, ConnectPayload, KeepalivePayload, ProtocolVersion,
    SnapshotPayload, TabEvent, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
    MAX_BULK_FRAME_BYTES,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Socket(String),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("connection closed: {0}")]
    Closed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub browser_type: String,
    pub extension_version: String,
    pub keepalive_interval: Duration,
    /// Budget for the socket to open and the companion to answer `connect`.
    pub handshake_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub max_inbound_frame_bytes: usize,
    pub max_outbound_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            browser_type: "chrome".to_string(),
            extension_version: env!("CARGO_PKG_VERSION").to_string(),
            keepalive_interval: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            max_inbound_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_outbound_frame_bytes: MAX_BULK_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    AwaitingHandshake,
    Connected,
    BackoffWait,
}

/// An envelope together with its encoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub envelope: WireEnvelope,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportAction {
    Open { connection_id: String },
    Send(OutboundFrame),
    Close { connection_id: String },
    ArmHandshakeTimeout(Duration),
    CancelHandshakeTimeout,
    StartKeepalive(Duration),
    StopKeepalive,
    ScheduleReconnect(Duration),
    CancelReconnect,
    Dispatch(Command),
}

pub struct Transport {
    config: TransportConfig,
    identity: Identity,
    clock: Arc<dyn Clock>,
    state: TransportState,
    connection_id: Option<String>,
    seq: u64,
    backoff: Backoff,
}

impl Transport {
    pub fn new(config: TransportConfig, identity: Identity, clock: Arc<dyn Clock>) -> Self {
        let backoff = Backoff::new(config.backoff);
        Self {
            config,
            identity,
            clock,
            state: TransportState::Idle,
            connection_id: None,
            seq: 0,
            backoff,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    /// Delay the next failure will wait before reconnecting.
    pub fn current_backoff(&self) -> Duration {
        self.backoff.current()
    }

    pub fn connect(&mut self) -> Vec<TransportAction> {
        match self.state {
            TransportState::Connecting
            | TransportState::AwaitingHandshake
            | TransportState::Connected => return Vec::new(),
            TransportState::Idle | TransportState::BackoffWait => {}
        }
        let mut actions = Vec::new();
        if self.state == TransportState::BackoffWait {
            actions.push(TransportAction::CancelReconnect);
        }
        let connection_id = generate_connection_id();
        self.connection_id = Some(connection_id.clone());
        self.seq = 0;
        self.state = TransportState::Connecting;
        info!(event = "transport_connecting", connection_id = %connection_id);
        actions.push(TransportAction::Open { connection_id });
        actions.push(TransportAction::ArmHandshakeTimeout(
            self.config.handshake_timeout,
        ));
        actions
    }

    pub fn on_open(&mut self, connection_id: &str) -> Vec<TransportAction> {
        if !self.is_current(connection_id) || self.state != TransportState::Connecting {
            debug!(event = "stale_socket_open", connection_id);
            return Vec::new();
        }
        self.state = TransportState::AwaitingHandshake;
        let connect = WireMsg::Connect(ConnectPayload {
            browser_type: self.config.browser_type.clone(),
            extension_version: self.config.extension_version.clone(),
        });
        self.send(connect)
    }

    pub fn on_frame(
        &mut self,
        connection_id: &str,
        text: &str,
        source: &dyn SnapshotSource,
    ) -> Vec<TransportAction> {
        if !self.is_current(connection_id) {
            debug!(event = "stale_socket_frame", connection_id);
            return Vec::new();
        }
        let envelope = match decode_text(text, self.config.max_inbound_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "protocol_message_dropped", connection_id, error = %err);
                return Vec::new();
            }
        };

        match envelope.msg {
            WireMsg::Connected(payload) => {
                if self.state != TransportState::AwaitingHandshake {
                    warn!(event = "unexpected_handshake", state = ?self.state);
                    return Vec::new();
                }
                if !payload.ok {
                    let reason = payload.error.unwrap_or_else(|| "unspecified".to_string());
                    warn!(event = "handshake_rejected", connection_id, reason = %reason);
                    return self.fail(TransportError::HandshakeRejected(reason));
                }
                self.state = TransportState::Connected;
                self.backoff.reset();
                info!(
                    event = "handshake_complete",
                    connection_id,
                    server_version = payload.server_version.as_deref().unwrap_or("")
                );
                let mut actions = vec![
                    TransportAction::CancelHandshakeTimeout,
                    TransportAction::StartKeepalive(self.config.keepalive_interval),
                ];
                actions.extend(self.send_snapshot(source));
                actions
            }
            WireMsg::Command(command) => {
                if self.state != TransportState::Connected {
                    warn!(event = "command_before_handshake", command = command.name());
                    return Vec::new();
                }
                debug!(event = "command_received", command = command.name());
                vec![TransportAction::Dispatch(command)]
            }
            WireMsg::Ping(_) => self.send(WireMsg::Pong(KeepalivePayload {})),
            WireMsg::Pong(_) => Vec::new(),
            other => {
                debug!(event = "unexpected_message", kind = other.kind());
                Vec::new()
            }
        }
    }

    /// Wraps a tracker event for the wire; nothing is buffered while the
    /// session is not established.
    pub fn on_tab_event(&mut self, event: &TabEvent) -> Vec<TransportAction> {
        if !self.is_connected() {
            return Vec::new();
        }
        self.send(WireMsg::Event(event.clone()))
    }

    pub fn send_snapshot(&mut self, source: &dyn SnapshotSource) -> Vec<TransportAction> {
        if !self.is_connected() {
            return Vec::new();
        }
        let payload = SnapshotPayload::from(source.snapshot());
        self.send(WireMsg::Snapshot(payload))
    }

    pub fn on_keepalive_tick(&mut self) -> Vec<TransportAction> {
        if !self.is_connected() {
            return Vec::new();
        }
        self.send(WireMsg::Ping(KeepalivePayload {}))
    }

    pub fn on_closed(&mut self, connection_id: &str, error: TransportError) -> Vec<TransportAction> {
        if !self.is_current(connection_id) {
            return Vec::new();
        }
        match self.state {
            TransportState::Connecting
            | TransportState::AwaitingHandshake
            | TransportState::Connected => {
                warn!(event = "transport_failed", connection_id, error = %error);
                self.fail(error)
            }
            TransportState::Idle | TransportState::BackoffWait => Vec::new(),
        }
    }

    /// Fires when the socket did not open, or the companion did not answer
    /// `connect`, within the handshake budget.
    pub fn on_handshake_timeout(&mut self) -> Vec<TransportAction> {
        if !self.is_handshaking() {
            return Vec::new();
        }
        warn!(
            event = "handshake_timed_out",
            connection_id = self.connection_id.as_deref().unwrap_or(""),
            state = ?self.state
        );
        self.fail(TransportError::Socket("handshake timed out".to_string()))
    }

    pub fn on_reconnect_due(&mut self) -> Vec<TransportAction> {
        if self.state != TransportState::BackoffWait {
            return Vec::new();
        }
        self.connect()
    }

    /// Tears the session down and stops any automatic reconnection.
    pub fn disconnect(&mut self) -> Vec<TransportAction> {
        let mut actions = vec![
            TransportAction::CancelReconnect,
            TransportAction::StopKeepalive,
        ];
        if self.is_handshaking() {
            actions.push(TransportAction::CancelHandshakeTimeout);
        }
        if let Some(connection_id) = self.connection_id.take() {
            actions.push(TransportAction::Close { connection_id });
        }
        if self.state != TransportState::Idle {
            info!(event = "transport_disconnected");
        }
        self.state = TransportState::Idle;
        actions
    }

    fn fail(&mut self, error: TransportError) -> Vec<TransportAction> {
        let mut actions = Vec::new();
        if self.state == TransportState::Connected {
            actions.push(TransportAction::StopKeepalive);
        }
        if self.is_handshaking() {
            actions.push(TransportAction::CancelHandshakeTimeout);
        }
        if let Some(connection_id) = self.connection_id.take() {
            actions.push(TransportAction::Close { connection_id });
        }
        let delay = self.backoff.on_failure();
        self.state = TransportState::BackoffWait;
        info!(
            event = "reconnect_scheduled",
            delay_ms = delay.as_millis() as u64,
            cause = %error
        );
        actions.push(TransportAction::ScheduleReconnect(delay));
        actions
    }

    fn is_current(&self, connection_id: &str) -> bool {
        self.connection_id.as_deref() == Some(connection_id)
    }

    fn is_handshaking(&self) -> bool {
        matches!(
            self.state,
            TransportState::Connecting | TransportState::AwaitingHandshake
        )
    }

    /// Stamps and encodes an outbound message. The sequence number is only
    /// consumed once the frame has encoded, so a dropped frame leaves no gap.
    fn send(&mut self, msg: WireMsg) -> Vec<TransportAction> {
        let envelope = WireEnvelope {
            v: ProtocolVersion::CURRENT,
            instance_id: self.identity.instance_id.clone(),
            runtime_session_id: self.identity.runtime_session_id.clone(),
            connection_id: self.connection_id.clone().unwrap_or_default(),
            seq: self.seq + 1,
            ts: self.clock.now_ms(),
            msg,
        };
        match encode_text(&envelope, self.config.max_outbound_frame_bytes) {
            Ok(text) => {
                self.seq = envelope.seq;
                vec![TransportAction::Send(OutboundFrame { envelope, text })]
            }
            Err(err) => {
                warn!(
                    event = "frame_encode_failed",
                    kind = envelope.msg.kind(),
                    seq = envelope.seq,
                    error = %err
                );
                Vec::new()
            }
        }
    }
}
