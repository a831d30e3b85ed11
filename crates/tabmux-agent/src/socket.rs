use crate::transport::TransportError;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug)]
pub enum SocketEventKind {
    Opened,
    Frame(String),
    Closed(TransportError),
}

/// Socket activity, tagged with the connection it belongs to so a late
/// event from a replaced socket can be recognised and ignored.
#[derive(Debug)]
pub struct SocketEvent {
    pub connection_id: String,
    pub kind: SocketEventKind,
}

enum Outbound {
    Text(String),
    Close,
}

pub struct SocketHandle {
    connection_id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl SocketHandle {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn send(&self, text: String) -> bool {
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Opens a WebSocket on its own task. The task reports `Opened`, then each
/// text frame, and exactly one `Closed` unless it was closed locally.
pub fn spawn_socket(
    url: Url,
    connection_id: String,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> SocketHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let task_connection_id = connection_id.clone();
    tokio::spawn(async move {
        run_socket(url, task_connection_id, outbound_rx, events).await;
    });
    SocketHandle {
        connection_id,
        outbound: outbound_tx,
    }
}

async fn run_socket(
    url: Url,
    connection_id: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let report = |kind: SocketEventKind| {
        let _ = events.send(SocketEvent {
            connection_id: connection_id.clone(),
            kind,
        });
    };

    let mut ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(err) => {
            debug!(event = "socket_connect_failed", url = %url, error = %err);
            report(SocketEventKind::Closed(TransportError::Socket(err.to_string())));
            return;
        }
    };
    report(SocketEventKind::Opened);

    let reason = loop {
        tokio::select! {
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => report(SocketEventKind::Frame(text)),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .unwrap_or_else(|| "peer closed".to_string());
                        break Some(TransportError::Closed(reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Some(TransportError::Socket(err.to_string())),
                    None => break Some(TransportError::Closed("stream ended".to_string())),
                }
            }
            command = outbound.recv() => {
                match command {
                    Some(Outbound::Text(text)) => {
                        if let Err(err) = ws.send(Message::Text(text)).await {
                            break Some(TransportError::Socket(err.to_string()));
                        }
                    }
                    Some(Outbound::Close) | None => break None,
                }
            }
        }
    };

    match reason {
        Some(error) => report(SocketEventKind::Closed(error)),
        None => {
            if let Err(err) = ws.close(None).await {
                warn!(event = "socket_close_failed", connection_id = %connection_id, error = %err);
            }
        }
    }
}
