use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tabmux_core::{DeviceSession, SessionTab, Tab, TabChanges, TabId, Window, WindowId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrowserApiError {
    #[error("no tab with id {0}")]
    NoSuchTab(TabId),
    #[error("no window with id {0}")]
    NoSuchWindow(WindowId),
    #[error("browser call {call} timed out")]
    Timeout { call: &'static str },
    #[error("browser bridge closed")]
    BridgeClosed,
    #[error("browser call {call} failed: {message}")]
    Failed { call: &'static str, message: String },
}

/// Tabs, Windows and Sessions APIs, consumed as an injected capability.
#[async_trait]
pub trait BrowserApi: Send + Sync {
    async fn query_tabs(&self) -> Result<Vec<Tab>, BrowserApiError>;
    async fn query_windows(&self) -> Result<Vec<Window>, BrowserApiError>;
    /// `tabs.update(tabId, {active: true})`; returns the tab as updated.
    async fn activate_tab(&self, tab_id: TabId) -> Result<Tab, BrowserApiError>;
    /// `windows.update(windowId, {focused: true})`.
    async fn focus_window(&self, window_id: WindowId) -> Result<(), BrowserApiError>;
    async fn remove_tab(&self, tab_id: TabId) -> Result<(), BrowserApiError>;

    async fn recently_closed(&self) -> Result<Vec<SessionTab>, BrowserApiError> {
        Ok(Vec::new())
    }

    async fn other_devices(&self) -> Result<Vec<DeviceSession>, BrowserApiError> {
        Ok(Vec::new())
    }
}

/// Browser-fired notification, as delivered by the host shim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum BrowserEvent {
    TabActivated {
        tab_id: TabId,
        window_id: WindowId,
    },
    TabCreated {
        tab: Tab,
    },
    TabRemoved {
        tab_id: TabId,
        window_id: WindowId,
    },
    TabUpdated {
        tab_id: TabId,
        changes: TabChanges,
    },
    WindowCreated {
        window: Window,
    },
    WindowRemoved {
        window_id: WindowId,
    },
    WindowFocused {
        window_id: WindowId,
    },
    SessionsChanged {
        #[serde(default)]
        recently_closed: Vec<SessionTab>,
        #[serde(default)]
        other_devices: Vec<DeviceSession>,
    },
    FaviconCached {
        tab_id: TabId,
        data_url: String,
    },
}

#[derive(Default)]
struct MemoryBrowserState {
    tabs: BTreeMap<TabId, Tab>,
    windows: BTreeMap<WindowId, Window>,
    recently_closed: Vec<SessionTab>,
    other_devices: Vec<DeviceSession>,
    calls: Vec<String>,
}

/// In-process browser with the same observable behaviour as the real APIs.
#[derive(Default)]
pub struct MemoryBrowser {
    state: Mutex<MemoryBrowserState>,
}

impl MemoryBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(windows: Vec<Window>, tabs: Vec<Tab>) -> Self {
        let browser = Self::new();
        for window in windows {
            browser.put_window(window);
        }
        for tab in tabs {
            browser.put_tab(tab);
        }
        browser
    }

    pub fn put_tab(&self, tab: Tab) {
        if let Ok(mut state) = self.state.lock() {
            state.tabs.insert(tab.id, tab);
        }
    }

    pub fn drop_tab(&self, tab_id: TabId) {
        if let Ok(mut state) = self.state.lock() {
            state.tabs.remove(&tab_id);
        }
    }

    pub fn put_window(&self, window: Window) {
        if let Ok(mut state) = self.state.lock() {
            state.windows.insert(window.id, window);
        }
    }

    pub fn set_sessions(&self, recently_closed: Vec<SessionTab>, other_devices: Vec<DeviceSession>) {
        if let Ok(mut state) = self.state.lock() {
            state.recently_closed = recently_closed;
            state.other_devices = other_devices;
        }
    }

    /// Mutating calls received so far, e.g. `activate:4`.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryBrowserState>, BrowserApiError> {
        self.state.lock().map_err(|_| BrowserApiError::Failed {
            call: "lock",
            message: "memory browser poisoned".to_string(),
        })
    }
}

#[async_trait]
impl BrowserApi for MemoryBrowser {
    async fn query_tabs(&self) -> Result<Vec<Tab>, BrowserApiError> {
        Ok(self.lock()?.tabs.values().cloned().collect())
    }

    async fn query_windows(&self) -> Result<Vec<Window>, BrowserApiError> {
        Ok(self.lock()?.windows.values().cloned().collect())
    }

    async fn activate_tab(&self, tab_id: TabId) -> Result<Tab, BrowserApiError> {
        let mut state = self.lock()?;
        state.calls.push(format!("activate:{tab_id}"));
        let window_id = state
            .tabs
            .get(&tab_id)
            .map(|tab| tab.window_id)
            .ok_or(BrowserApiError::NoSuchTab(tab_id))?;
        for tab in state.tabs.values_mut() {
            if tab.window_id == window_id {
                tab.active = tab.id == tab_id;
            }
        }
        state
            .tabs
            .get(&tab_id)
            .cloned()
            .ok_or(BrowserApiError::NoSuchTab(tab_id))
    }

    async fn focus_window(&self, window_id: WindowId) -> Result<(), BrowserApiError> {
        let mut state = self.lock()?;
        state.calls.push(format!("focus:{window_id}"));
        if !state.windows.contains_key(&window_id) {
            return Err(BrowserApiError::NoSuchWindow(window_id));
        }
        for window in state.windows.values_mut() {
            window.focused = window.id == window_id;
        }
        Ok(())
    }

    async fn remove_tab(&self, tab_id: TabId) -> Result<(), BrowserApiError> {
        let mut state = self.lock()?;
        state.calls.push(format!("remove:{tab_id}"));
        state
            .tabs
            .remove(&tab_id)
            .map(|_| ())
            .ok_or(BrowserApiError::NoSuchTab(tab_id))
    }

    async fn recently_closed(&self) -> Result<Vec<SessionTab>, BrowserApiError> {
        Ok(self.lock()?.recently_closed.clone())
    }

    async fn other_devices(&self) -> Result<Vec<DeviceSession>, BrowserApiError> {
        Ok(self.lock()?.other_devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_events_parse_from_shim_json() {
        let event: BrowserEvent =
            serde_json::from_str(r#"{"type":"tabActivated","tabId":5,"windowId":2}"#)
                .expect("parse");
        assert_eq!(
            event,
            BrowserEvent::TabActivated {
                tab_id: 5,
                window_id: 2
            }
        );

        let sessions: BrowserEvent =
            serde_json::from_str(r#"{"type":"sessionsChanged"}"#).expect("parse");
        assert_eq!(
            sessions,
            BrowserEvent::SessionsChanged {
                recently_closed: Vec::new(),
                other_devices: Vec::new()
            }
        );
    }

    #[tokio::test]
    async fn memory_browser_remove_of_missing_tab_errors() {
        let browser = MemoryBrowser::new();
        assert_eq!(
            browser.remove_tab(3).await,
            Err(BrowserApiError::NoSuchTab(3))
        );
        assert_eq!(browser.calls(), vec!["remove:3".to_string()]);
    }
}
