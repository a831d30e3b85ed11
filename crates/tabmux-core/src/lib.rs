use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod clock;
pub mod sort;
pub mod wire;

pub type TabId = i64;
pub type WindowId = i64;

/// Window id the browser reports when no browser window has focus.
pub const WINDOW_ID_NONE: WindowId = -1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: TabId,
    pub window_id: WindowId,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub audible: bool,
    /// Browser-native last access time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<i64>,
}

impl Tab {
    /// Merges `changes` into the tab and returns only the fields whose value
    /// actually differed.
    pub fn merge(&mut self, changes: &TabChanges) -> TabChanges {
        let mut applied = TabChanges::default();
        merge_field(&mut self.window_id, &changes.window_id, &mut applied.window_id);
        merge_field(&mut self.index, &changes.index, &mut applied.index);
        merge_field(&mut self.url, &changes.url, &mut applied.url);
        merge_field(&mut self.title, &changes.title, &mut applied.title);
        if let Some(icon) = &changes.fav_icon_url {
            if self.fav_icon_url.as_ref() != Some(icon) {
                self.fav_icon_url = Some(icon.clone());
                applied.fav_icon_url = Some(icon.clone());
            }
        }
        merge_field(&mut self.pinned, &changes.pinned, &mut applied.pinned);
        merge_field(&mut self.audible, &changes.audible, &mut applied.audible);
        if let Some(accessed) = changes.last_accessed {
            if self.last_accessed != Some(accessed) {
                self.last_accessed = Some(accessed);
                applied.last_accessed = Some(accessed);
            }
        }
        applied
    }
}

fn merge_field<T: Clone + PartialEq>(current: &mut T, incoming: &Option<T>, applied: &mut Option<T>) {
    if let Some(value) = incoming {
        if current != value {
            *current = value.clone();
            *applied = Some(value.clone());
        }
    }
}

/// Partial tab diff. Only fields that are `Some` changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TabChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<WindowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<i64>,
}

impl TabChanges {
    /// Every mergeable field of `tab`, used to reconcile against a fresher copy.
    pub fn from_tab(tab: &Tab) -> Self {
        Self {
            window_id: Some(tab.window_id),
            index: Some(tab.index),
            url: Some(tab.url.clone()),
            title: Some(tab.title.clone()),
            fav_icon_url: tab.fav_icon_url.clone(),
            pinned: Some(tab.pinned),
            audible: Some(tab.audible),
            last_accessed: tab.last_accessed,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    #[default]
    Normal,
    Popup,
    Panel,
    App,
    Devtools,
    #[serde(other)]
    Other,
}

impl WindowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowType::Normal => "normal",
            WindowType::Popup => "popup",
            WindowType::Panel => "panel",
            WindowType::App => "app",
            WindowType::Devtools => "devtools",
            WindowType::Other => "other",
        }
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "normal" => Ok(WindowType::Normal),
            "popup" => Ok(WindowType::Popup),
            "panel" => Ok(WindowType::Panel),
            "app" => Ok(WindowType::App),
            "devtools" => Ok(WindowType::Devtools),
            other => Err(format!("Unknown window type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub id: WindowId,
    #[serde(default, rename = "type")]
    pub window_type: WindowType,
    #[serde(default)]
    pub focused: bool,
}

/// Tracker-local timing and favicon data the browser API does not expose.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Augmentation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deactivated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_data_url: Option<String>,
}

/// A recently-closed tab or a tab synced from another device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionTab {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<WindowId>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    /// Seconds since the epoch, as the sessions API reports it.
    #[serde(default)]
    pub last_modified: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub device_name: String,
    #[serde(default)]
    pub tabs: Vec<SessionTab>,
}

/// Full, independent copy of tracked state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub tabs: Vec<Tab>,
    pub windows: Vec<Window>,
    pub augmentation: BTreeMap<TabId, Augmentation>,
    #[serde(default)]
    pub recently_closed: Vec<SessionTab>,
    #[serde(default)]
    pub other_devices: Vec<DeviceSession>,
}
