//! Single-owner event loop tying the tracker, transport, dispatcher and
//! broadcaster together.

use crate::broadcast::{Broadcaster, ViewSubscriber};
use crate::browser::{BrowserApi, BrowserEvent};
use crate::config::AgentConfig;
use crate::dispatch::{apply_completion, CommandDispatcher, Completion, DispatchOutcome};
use crate::identity::Identity;
use crate::schedule::{Deadline, Ticker};
use crate::socket::{spawn_socket, SocketEvent, SocketEventKind, SocketHandle};
use crate::tracker::TabTracker;
use crate::transport::{Transport, TransportAction};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tabmux_core::clock::Clock;
use tabmux_core::wire::{Command, TabEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

pub struct Agent {
    url: Url,
    clock: Arc<dyn Clock>,
    browser: Arc<dyn BrowserApi>,
    tracker: TabTracker,
    transport: Transport,
    broadcaster: Broadcaster,
    dispatcher: CommandDispatcher,
    tab_events: mpsc::UnboundedReceiver<TabEvent>,
    completions: mpsc::UnboundedReceiver<Completion>,
    socket_events_tx: mpsc::UnboundedSender<SocketEvent>,
    socket_events: mpsc::UnboundedReceiver<SocketEvent>,
    socket: Option<SocketHandle>,
    keepalive: Ticker,
    reconnect: Deadline,
    handshake: Deadline,
    broadcast_timer: Deadline,
    broadcast_armed_for: Option<i64>,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        identity: Identity,
        browser: Arc<dyn BrowserApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut tracker = TabTracker::new(clock.clone());
        let (tab_events_tx, tab_events) = mpsc::unbounded_channel();
        tracker.on_event(Box::new(move |event: &TabEvent| {
            let _ = tab_events_tx.send(event.clone());
        }));
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (socket_events_tx, socket_events) = mpsc::unbounded_channel();

        Self {
            url: config.url.clone(),
            transport: Transport::new(config.transport.clone(), identity, clock.clone()),
            broadcaster: Broadcaster::new(&config.broadcast),
            dispatcher: CommandDispatcher::new(browser.clone(), completions_tx),
            clock,
            browser,
            tracker,
            tab_events,
            completions,
            socket_events_tx,
            socket_events,
            socket: None,
            keepalive: Ticker::new(),
            reconnect: Deadline::new(),
            handshake: Deadline::new(),
            broadcast_timer: Deadline::new(),
            broadcast_armed_for: None,
        }
    }

    pub fn subscribe_view(&mut self, subscriber: ViewSubscriber) {
        self.broadcaster.subscribe(subscriber);
    }

    /// Runs until `shutdown` resolves or the browser event stream ends.
    pub async fn run<F>(mut self, mut browser_events: mpsc::UnboundedReceiver<BrowserEvent>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Err(err) = self.tracker.initialize(self.browser.as_ref()).await {
            warn!(event = "tracker_initialize_failed", error = %err);
        }
        self.broadcaster.mark_dirty(self.clock.now_ms());
        let actions = self.transport.connect();
        self.execute(actions).await;

        tokio::pin!(shutdown);
        loop {
            self.sync_broadcast_timer();
            tokio::select! {
                _ = &mut shutdown => {
                    info!(event = "agent_shutdown", reason = "signal");
                    break;
                }
                event = browser_events.recv() => match event {
                    Some(event) => {
                        self.tracker.apply(event);
                        // Session list changes emit no tab event but still alter the view.
                        self.broadcaster.mark_dirty(self.clock.now_ms());
                        self.after_mutation().await;
                    }
                    None => {
                        info!(event = "agent_shutdown", reason = "bridge_closed");
                        break;
                    }
                },
                Some(event) = self.socket_events.recv() => self.on_socket_event(event).await,
                Some(completion) = self.completions.recv() => {
                    apply_completion(&mut self.tracker, completion);
                    self.after_mutation().await;
                }
                _ = self.keepalive.tick() => {
                    let actions = self.transport.on_keepalive_tick();
                    self.execute(actions).await;
                }
                _ = self.reconnect.wait() => {
                    let actions = self.transport.on_reconnect_due();
                    self.execute(actions).await;
                }
                _ = self.handshake.wait() => {
                    let actions = self.transport.on_handshake_timeout();
                    self.execute(actions).await;
                }
                _ = self.broadcast_timer.wait() => {
                    self.broadcast_armed_for = None;
                    let now = self.clock.now_ms();
                    self.broadcaster.poll(now, &self.tracker);
                }
            }
        }

        let actions = self.transport.disconnect();
        self.execute(actions).await;
    }

    async fn on_socket_event(&mut self, event: SocketEvent) {
        let SocketEvent {
            connection_id,
            kind,
        } = event;
        let actions = match kind {
            SocketEventKind::Opened => self.transport.on_open(&connection_id),
            SocketEventKind::Frame(text) => {
                self.transport
                    .on_frame(&connection_id, &text, &self.tracker)
            }
            SocketEventKind::Closed(error) => {
                if self
                    .socket
                    .as_ref()
                    .is_some_and(|socket| socket.connection_id() == connection_id)
                {
                    self.socket = None;
                }
                self.transport.on_closed(&connection_id, error)
            }
        };
        self.execute(actions).await;
    }

    /// Forwards every event the tracker emitted since the last call.
    async fn after_mutation(&mut self) {
        let mut actions = Vec::new();
        let mut changed = false;
        while let Ok(event) = self.tab_events.try_recv() {
            changed = true;
            actions.extend(self.transport.on_tab_event(&event));
        }
        if changed {
            self.broadcaster.mark_dirty(self.clock.now_ms());
        }
        self.execute(actions).await;
    }

    async fn execute(&mut self, actions: Vec<TransportAction>) {
        let mut queue: VecDeque<TransportAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                TransportAction::Open { connection_id } => {
                    if let Some(previous) = self.socket.take() {
                        previous.close();
                    }
                    info!(event = "companion_connecting", url = %self.url, connection_id = %connection_id);
                    self.socket = Some(spawn_socket(
                        self.url.clone(),
                        connection_id,
                        self.socket_events_tx.clone(),
                    ));
                }
                TransportAction::Send(frame) => {
                    let kind = frame.envelope.msg.kind();
                    let seq = frame.envelope.seq;
                    let text = frame.text;
                    match &self.socket {
                        Some(socket) if socket.send(text) => {
                            debug!(event = "frame_sent", kind, seq);
                        }
                        _ => warn!(event = "frame_send_failed", kind, seq),
                    }
                }
                TransportAction::Close { connection_id } => {
                    if let Some(socket) = self.socket.take() {
                        debug!(event = "socket_closing", connection_id = %connection_id);
                        socket.close();
                    }
                }
                TransportAction::ArmHandshakeTimeout(budget) => self.handshake.arm(budget),
                TransportAction::CancelHandshakeTimeout => self.handshake.cancel(),
                TransportAction::StartKeepalive(period) => self.keepalive.start(period),
                TransportAction::StopKeepalive => self.keepalive.stop(),
                TransportAction::ScheduleReconnect(delay) => self.reconnect.arm(delay),
                TransportAction::CancelReconnect => self.reconnect.cancel(),
                TransportAction::Dispatch(command) => {
                    queue.extend(self.handle_command(command).await);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Vec<TransportAction> {
        match self.dispatcher.dispatch(command, &self.tracker) {
            DispatchOutcome::Spawned | DispatchOutcome::Ignored => Vec::new(),
            DispatchOutcome::SendSnapshot => self.transport.send_snapshot(&self.tracker),
            DispatchOutcome::Refresh => {
                if let Err(err) = self.tracker.refresh(self.browser.as_ref()).await {
                    warn!(event = "refresh_failed", error = %err);
                }
                let mut actions = Vec::new();
                while let Ok(event) = self.tab_events.try_recv() {
                    actions.extend(self.transport.on_tab_event(&event));
                }
                self.broadcaster.mark_dirty(self.clock.now_ms());
                actions.extend(self.transport.send_snapshot(&self.tracker));
                actions
            }
            DispatchOutcome::SetStrategy(strategy) => {
                self.broadcaster.set_strategy(strategy, self.clock.now_ms());
                Vec::new()
            }
        }
    }

    fn sync_broadcast_timer(&mut self) {
        match self.broadcaster.deadline() {
            Some(deadline) if self.broadcast_armed_for != Some(deadline) => {
                let wait = deadline.saturating_sub(self.clock.now_ms()).max(0);
                self.broadcast_timer
                    .arm(Duration::from_millis(u64::try_from(wait).unwrap_or(0)));
                self.broadcast_armed_for = Some(deadline);
            }
            Some(_) => {}
            None => {
                self.broadcast_timer.cancel();
                self.broadcast_armed_for = None;
            }
        }
    }
}
