//! Authoritative in-memory model of tabs and windows plus augmentation.
//!
//! Handlers run to completion, listeners included, before the next browser
//! event is applied. Nothing outside the tracker holds its maps: state only
//! leaves through [`TabTracker::get_snapshot`], which returns a copy.

use crate::browser::{BrowserApi, BrowserApiError, BrowserEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use tabmux_core::clock::Clock;
use tabmux_core::wire::TabEvent;
use tabmux_core::{
    Augmentation, DeviceSession, SessionTab, Snapshot, Tab, TabChanges, TabId, Window, WindowId,
    WINDOW_ID_NONE,
};
use tracing::{debug, warn};

pub type EventListener = Box<dyn FnMut(&TabEvent) + Send>;

/// Anything that can produce a full resynchronization payload.
pub trait SnapshotSource {
    fn snapshot(&self) -> Snapshot;
}

pub struct TabTracker {
    clock: Arc<dyn Clock>,
    tabs: BTreeMap<TabId, Tab>,
    windows: BTreeMap<WindowId, Window>,
    augmentation: BTreeMap<TabId, Augmentation>,
    recently_closed: Vec<SessionTab>,
    other_devices: Vec<DeviceSession>,
    active_tab: Option<TabId>,
    listeners: Vec<EventListener>,
}

impl TabTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tabs: BTreeMap::new(),
            windows: BTreeMap::new(),
            augmentation: BTreeMap::new(),
            recently_closed: Vec::new(),
            other_devices: Vec::new(),
            active_tab: None,
            listeners: Vec::new(),
        }
    }

    pub fn on_event(&mut self, listener: EventListener) {
        self.listeners.push(listener);
    }

    /// Builds the initial model from the browser with empty augmentation.
    pub async fn initialize(&mut self, browser: &dyn BrowserApi) -> Result<(), BrowserApiError> {
        let tabs = browser.query_tabs().await?;
        let windows = browser.query_windows().await?;
        self.augmentation.clear();
        self.replace_ground_truth(tabs, windows);
        self.load_sessions(browser).await;
        debug!(
            event = "tracker_initialized",
            tabs = self.tabs.len(),
            windows = self.windows.len()
        );
        Ok(())
    }

    /// Re-reads ground truth after a suspected missed-event window. Augmentation
    /// for surviving tabs is kept; entries for vanished tabs are pruned.
    pub async fn refresh(&mut self, browser: &dyn BrowserApi) -> Result<(), BrowserApiError> {
        let tabs = browser.query_tabs().await?;
        let windows = browser.query_windows().await?;
        self.replace_ground_truth(tabs, windows);
        self.load_sessions(browser).await;
        Ok(())
    }

    async fn load_sessions(&mut self, browser: &dyn BrowserApi) {
        let recently_closed = match browser.recently_closed().await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "sessions_query_failed", source = "recently_closed", error = %err);
                return;
            }
        };
        let other_devices = match browser.other_devices().await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "sessions_query_failed", source = "other_devices", error = %err);
                return;
            }
        };
        self.set_sessions(recently_closed, other_devices);
    }

    pub fn replace_ground_truth(&mut self, tabs: Vec<Tab>, windows: Vec<Window>) {
        self.tabs = tabs.into_iter().map(|tab| (tab.id, tab)).collect();
        self.windows = windows
            .into_iter()
            .map(|window| (window.id, window))
            .collect();
        let tabs = &self.tabs;
        let before = self.augmentation.len();
        self.augmentation.retain(|tab_id, _| tabs.contains_key(tab_id));
        let pruned = before - self.augmentation.len();
        if pruned > 0 {
            debug!(event = "augmentation_pruned", count = pruned);
        }
        self.active_tab = self.focused_active_tab();
    }

    fn focused_active_tab(&self) -> Option<TabId> {
        let focused = self.windows.values().find(|window| window.focused)?;
        self.active_tab_in(focused.id)
    }

    fn active_tab_in(&self, window_id: WindowId) -> Option<TabId> {
        self.tabs
            .values()
            .find(|tab| tab.window_id == window_id && tab.active)
            .map(|tab| tab.id)
    }

    pub fn apply(&mut self, event: BrowserEvent) {
        match event {
            BrowserEvent::TabActivated { tab_id, window_id } => {
                self.handle_tab_activated(tab_id, window_id)
            }
            BrowserEvent::TabCreated { tab } => self.handle_tab_created(tab),
            BrowserEvent::TabRemoved { tab_id, window_id } => {
                self.handle_tab_removed(tab_id, window_id)
            }
            BrowserEvent::TabUpdated { tab_id, changes } => {
                self.handle_tab_updated(tab_id, changes)
            }
            BrowserEvent::WindowCreated { window } => self.handle_window_created(window),
            BrowserEvent::WindowRemoved { window_id } => self.handle_window_removed(window_id),
            BrowserEvent::WindowFocused { window_id } => self.handle_window_focused(window_id),
            BrowserEvent::SessionsChanged {
                recently_closed,
                other_devices,
            } => self.set_sessions(recently_closed, other_devices),
            BrowserEvent::FaviconCached { tab_id, data_url } => self.set_favicon(tab_id, data_url),
        }
    }

    pub fn handle_tab_activated(&mut self, tab_id: TabId, window_id: WindowId) {
        if !self.tabs.contains_key(&tab_id) {
            debug!(event = "activate_unknown_tab", tab_id, window_id);
            return;
        }
        let now = self.clock.now_ms();

        let previous = self
            .active_tab
            .filter(|previous| *previous != tab_id && self.tabs.contains_key(previous));
        let previous_last_deactivated = previous.map(|previous_id| {
            self.augmentation
                .entry(previous_id)
                .or_default()
                .last_deactivated = Some(now);
            now
        });
        self.augmentation.entry(tab_id).or_default().last_activated = Some(now);

        for tab in self.tabs.values_mut() {
            if tab.window_id == window_id {
                tab.active = tab.id == tab_id;
            }
        }
        self.active_tab = Some(tab_id);

        self.emit(TabEvent::TabActivated {
            tab_id,
            window_id,
            last_activated: now,
            previous_tab_id: previous,
            previous_last_deactivated,
        });
    }

    pub fn handle_tab_created(&mut self, tab: Tab) {
        self.tabs.insert(tab.id, tab.clone());
        self.emit(TabEvent::TabCreated { tab });
    }

    pub fn handle_tab_removed(&mut self, tab_id: TabId, window_id: WindowId) {
        if self.tabs.remove(&tab_id).is_none() {
            return;
        }
        self.augmentation.remove(&tab_id);
        if self.active_tab == Some(tab_id) {
            self.active_tab = None;
        }
        self.emit(TabEvent::TabRemoved { tab_id, window_id });
    }

    pub fn handle_tab_updated(&mut self, tab_id: TabId, changes: TabChanges) {
        let Some(tab) = self.tabs.get_mut(&tab_id) else {
            debug!(event = "update_unknown_tab", tab_id);
            return;
        };
        let applied = tab.merge(&changes);
        if applied.is_empty() {
            return;
        }
        self.emit(TabEvent::TabUpdated {
            tab_id,
            changes: applied,
        });
    }

    pub fn handle_window_created(&mut self, window: Window) {
        self.windows.insert(window.id, window.clone());
        self.emit(TabEvent::WindowCreated { window });
    }

    pub fn handle_window_removed(&mut self, window_id: WindowId) {
        if self.windows.remove(&window_id).is_some() {
            self.emit(TabEvent::WindowRemoved { window_id });
        }
    }

    /// Focusing a window re-activates its foreground tab.
    pub fn handle_window_focused(&mut self, window_id: WindowId) {
        for window in self.windows.values_mut() {
            window.focused = window.id == window_id;
        }
        self.emit(TabEvent::WindowFocused { window_id });
        if window_id == WINDOW_ID_NONE {
            return;
        }
        if let Some(tab_id) = self.active_tab_in(window_id) {
            self.handle_tab_activated(tab_id, window_id);
        }
    }

    pub fn set_favicon(&mut self, tab_id: TabId, data_url: String) {
        if !self.tabs.contains_key(&tab_id) {
            debug!(event = "favicon_unknown_tab", tab_id);
            return;
        }
        let entry = self.augmentation.entry(tab_id).or_default();
        if entry.favicon_data_url.as_deref() == Some(data_url.as_str()) {
            return;
        }
        entry.favicon_data_url = Some(data_url.clone());
        self.emit(TabEvent::AugmentationUpdated {
            tab_id,
            changes: Augmentation {
                favicon_data_url: Some(data_url),
                ..Augmentation::default()
            },
        });
    }

    pub fn set_sessions(&mut self, recently_closed: Vec<SessionTab>, other_devices: Vec<DeviceSession>) {
        self.recently_closed = recently_closed;
        self.other_devices = other_devices;
    }

    /// Applies the result of an asynchronous browser call, but only if the tab
    /// is still tracked by the time it lands.
    pub fn apply_completion(&mut self, tab: Tab) -> bool {
        if !self.tabs.contains_key(&tab.id) {
            debug!(event = "completion_for_missing_tab", tab_id = tab.id);
            return false;
        }
        let changes = TabChanges::from_tab(&tab);
        self.handle_tab_updated(tab.id, changes);
        true
    }

    pub fn contains_tab(&self, tab_id: TabId) -> bool {
        self.tabs.contains_key(&tab_id)
    }

    pub fn window_of(&self, tab_id: TabId) -> Option<WindowId> {
        self.tabs.get(&tab_id).map(|tab| tab.window_id)
    }

    pub fn active_tab(&self) -> Option<TabId> {
        self.active_tab
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    pub fn get_snapshot(&self) -> Snapshot {
        Snapshot {
            tabs: self.tabs.values().cloned().collect(),
            windows: self.windows.values().cloned().collect(),
            augmentation: self.augmentation.clone(),
            recently_closed: self.recently_closed.clone(),
            other_devices: self.other_devices.clone(),
        }
    }

    fn emit(&mut self, event: TabEvent) {
        for listener in self.listeners.iter_mut() {
            listener(&event);
        }
    }
}

impl SnapshotSource for TabTracker {
    fn snapshot(&self) -> Snapshot {
        self.get_snapshot()
    }
}
