use crate::tracker::SnapshotSource;
use std::time::Duration;
use tabmux_core::sort::{sort_tabs_with_sections, SortStrategy, SortedEntry};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastConfig {
    pub debounce: Duration,
    pub initial_strategy: SortStrategy,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            initial_strategy: SortStrategy::default(),
        }
    }
}

/// Trailing debounce driven by explicit timestamps (epoch ms).
#[derive(Debug, Clone)]
pub struct Debouncer {
    window_ms: i64,
    deadline: Option<i64>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            deadline: None,
        }
    }

    /// Records activity at `now`, pushing the deadline out by one window.
    pub fn touch(&mut self, now: i64) {
        self.deadline = Some(now.saturating_add(self.window_ms));
    }

    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    /// True (once) when the window has elapsed since the last touch.
    pub fn due(&mut self, now: i64) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

pub type ViewSubscriber = Box<dyn FnMut(SortStrategy, &[SortedEntry]) + Send>;

pub struct Broadcaster {
    strategy: SortStrategy,
    debouncer: Debouncer,
    subscribers: Vec<ViewSubscriber>,
}

impl Broadcaster {
    pub fn new(config: &BroadcastConfig) -> Self {
        Self {
            strategy: config.initial_strategy,
            debouncer: Debouncer::new(config.debounce),
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, subscriber: ViewSubscriber) {
        self.subscribers.push(subscriber);
    }

    pub fn strategy(&self) -> SortStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: SortStrategy, now: i64) {
        if self.strategy != strategy {
            debug!(event = "sort_strategy_changed", strategy = %strategy);
            self.strategy = strategy;
        }
        self.mark_dirty(now);
    }

    pub fn mark_dirty(&mut self, now: i64) {
        self.debouncer.touch(now);
    }

    pub fn deadline(&self) -> Option<i64> {
        self.debouncer.deadline()
    }

    /// Recomputes and publishes the view if the debounce window has closed.
    /// The view is built from the state current at publish time, so every
    /// mutation made during the window is reflected in it.
    pub fn poll(&mut self, now: i64, source: &dyn SnapshotSource) -> Option<Vec<SortedEntry>> {
        if !self.debouncer.due(now) {
            return None;
        }
        let view = sort_tabs_with_sections(&source.snapshot(), self.strategy);
        for subscriber in self.subscribers.iter_mut() {
            subscriber(self.strategy, &view);
        }
        debug!(event = "view_published", entries = view.len(), strategy = %self.strategy);
        Some(view)
    }
}
