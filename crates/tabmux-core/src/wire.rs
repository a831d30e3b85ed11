use crate::sort::SortStrategy;
use crate::{
    Augmentation, DeviceSession, SessionTab, Snapshot, Tab, TabChanges, TabId, Window, WindowId,
};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Limit for frames the companion sends; those carry commands and keepalives.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
/// Limit for frames that carry a whole tab model (snapshots, views, API
/// replies). Same as tungstenite's default message size limit.
pub const MAX_BULK_FRAME_BYTES: usize = 64 << 20;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as integer or string")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

/// One logical message plus the identity and sequencing fields.
///
/// `seq` is scoped to `connection_id`; the sender restarts it at 1 on every
/// new connection. Identity fields default to empty on inbound frames since
/// the companion is not required to echo them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    #[serde(default)]
    pub v: ProtocolVersion,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub runtime_session_id: String,
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub ts: i64,
    #[serde(flatten)]
    pub msg: WireMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Connect(ConnectPayload),
    Connected(ConnectedPayload),
    Snapshot(SnapshotPayload),
    Event(TabEvent),
    Command(Command),
    Ping(KeepalivePayload),
    Pong(KeepalivePayload),
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMsg::Connect(_) => "connect",
            WireMsg::Connected(_) => "connected",
            WireMsg::Snapshot(_) => "snapshot",
            WireMsg::Event(_) => "event",
            WireMsg::Command(_) => "command",
            WireMsg::Ping(_) => "ping",
            WireMsg::Pong(_) => "pong",
        }
    }
}

const KNOWN_TYPES: [&str; 7] = [
    "connect",
    "connected",
    "snapshot",
    "event",
    "command",
    "ping",
    "pong",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    pub browser_type: String,
    pub extension_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeepalivePayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    #[serde(default)]
    pub session_tabs: Vec<Tab>,
    #[serde(default)]
    pub session_windows: Vec<Window>,
    #[serde(default)]
    pub augmentation: BTreeMap<TabId, Augmentation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recently_closed: Vec<SessionTab>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_devices: Vec<DeviceSession>,
}

impl From<Snapshot> for SnapshotPayload {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            session_tabs: snapshot.tabs,
            session_windows: snapshot.windows,
            augmentation: snapshot.augmentation,
            recently_closed: snapshot.recently_closed,
            other_devices: snapshot.other_devices,
        }
    }
}

/// Tracker mutation, carrying only the fields that changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum TabEvent {
    #[serde(rename = "tab.activated")]
    TabActivated {
        tab_id: TabId,
        window_id: WindowId,
        last_activated: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_tab_id: Option<TabId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_last_deactivated: Option<i64>,
    },
    #[serde(rename = "tab.created")]
    TabCreated { tab: Tab },
    #[serde(rename = "tab.removed")]
    TabRemoved { tab_id: TabId, window_id: WindowId },
    #[serde(rename = "tab.updated")]
    TabUpdated { tab_id: TabId, changes: TabChanges },
    #[serde(rename = "augmentation.updated")]
    AugmentationUpdated {
        tab_id: TabId,
        changes: Augmentation,
    },
    #[serde(rename = "window.focused")]
    WindowFocused { window_id: WindowId },
    #[serde(rename = "window.created")]
    WindowCreated { window: Window },
    #[serde(rename = "window.removed")]
    WindowRemoved { window_id: WindowId },
}

impl TabEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TabEvent::TabActivated { .. } => "tab.activated",
            TabEvent::TabCreated { .. } => "tab.created",
            TabEvent::TabRemoved { .. } => "tab.removed",
            TabEvent::TabUpdated { .. } => "tab.updated",
            TabEvent::AugmentationUpdated { .. } => "augmentation.updated",
            TabEvent::WindowFocused { .. } => "window.focused",
            TabEvent::WindowCreated { .. } => "window.created",
            TabEvent::WindowRemoved { .. } => "window.removed",
        }
    }
}

/// Companion-issued command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "command",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    ActivateTab { tab_id: TabId },
    CloseTab { tab_id: TabId },
    RequestSnapshot,
    Refresh,
    SetSortStrategy { strategy: SortStrategy },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ActivateTab { .. } => "activateTab",
            Command::CloseTab { .. } => "closeTab",
            Command::RequestSnapshot => "requestSnapshot",
            Command::Refresh => "refresh",
            Command::SetSortStrategy { .. } => "setSortStrategy",
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Command::ActivateTab { tab_id } | Command::CloseTab { tab_id } if *tab_id < 0 => {
                Err(ProtocolError::InvalidPayload {
                    kind: "command".to_string(),
                    reason: format!("{} with negative tab id {tab_id}", self.name()),
                })
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("unsupported protocol version {found}, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },
}

/// Encodes an envelope as a single WebSocket text frame.
pub fn encode_text(envelope: &WireEnvelope, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// Parses one inbound text frame, classifying the failure so the caller can
/// log it and drop just this message.
pub fn decode_text(text: &str, max_frame_bytes: usize) -> Result<WireEnvelope, ProtocolError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        }
        .into());
    }
    let raw: Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing type".to_string()))?
        .to_string();
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }
    let envelope: WireEnvelope =
        serde_json::from_value(raw).map_err(|err| ProtocolError::InvalidPayload {
            kind: kind.clone(),
            reason: err.to_string(),
        })?;
    if envelope.v != ProtocolVersion::CURRENT {
        return Err(ProtocolError::UnsupportedVersion {
            found: envelope.v.0,
            expected: CURRENT_PROTOCOL_VERSION,
        });
    }
    if let WireMsg::Command(command) = &envelope.msg {
        command.validate()?;
    }
    Ok(envelope)
}

/// Encodes one newline-terminated JSON line for the stdio bridge.
pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

/// Splits a byte stream into newline-delimited JSON values.
///
/// A line that grows past the limit is reported once and skipped up to its
/// terminating newline; the lines after it decode normally.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    skipping: bool,
    marker: PhantomData<T>,
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            skipping: false,
            marker: PhantomData,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Result<T, FrameError>> {
        let mut decoded = Vec::new();
        let mut rest = chunk;
        while let Some(newline_idx) = rest.iter().position(|byte| *byte == b'\n') {
            let (line, tail) = rest.split_at(newline_idx);
            rest = &tail[1..];
            if std::mem::take(&mut self.skipping) {
                continue;
            }
            if !self.extend_pending(line, &mut decoded) {
                self.skipping = false;
                continue;
            }
            let mut frame = std::mem::take(&mut self.pending);
            if frame.ends_with(b"\r") {
                frame.pop();
            }
            if !frame.is_empty() {
                decoded.push(decode_line(&frame));
            }
        }
        if !self.skipping {
            self.extend_pending(rest, &mut decoded);
        }
        decoded
    }

    /// Decodes whatever is left once the input stream has ended.
    pub fn finish(&mut self) -> Option<Result<T, FrameError>> {
        let remainder = std::mem::take(&mut self.pending);
        self.skipping = false;
        if remainder.iter().all(|byte| byte.is_ascii_whitespace()) {
            return None;
        }
        Some(decode_line(&remainder))
    }

    /// Appends to the pending line, switching to skip mode when it overflows.
    fn extend_pending(&mut self, bytes: &[u8], decoded: &mut Vec<Result<T, FrameError>>) -> bool {
        let size = self.pending.len() + bytes.len();
        if size > self.max_frame_bytes {
            decoded.push(Err(FrameError::OversizedFrame {
                size,
                max: self.max_frame_bytes,
            }));
            self.pending.clear();
            self.skipping = true;
            return false;
        }
        self.pending.extend_from_slice(bytes);
        true
    }
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(line).map_err(|err| FrameError::Decode(err.to_string()))
}
