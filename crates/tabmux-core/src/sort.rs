//! Deterministic ordering of tracked state into the sectioned switcher list.
//!
//! Output is always `tabs → apps → recentlyClosed → otherDevices`. Only the
//! order inside the `tabs` section depends on the requested strategy; apps
//! always use the activation order. Every sort is stable, so ties keep the
//! order in which tabs appear in the snapshot.

use crate::{Augmentation, Snapshot, Tab, TabId, WindowId, WindowType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum SortStrategy {
    #[default]
    LastActivated,
    WindowGrouped,
    LastAccessed,
    LastDeactivated,
}

impl SortStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortStrategy::LastActivated => "lastActivated",
            SortStrategy::WindowGrouped => "windowGrouped",
            SortStrategy::LastAccessed => "lastAccessed",
            SortStrategy::LastDeactivated => "lastDeactivated",
        }
    }
}

impl fmt::Display for SortStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortStrategy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace(['-', '_'], "");
        match normalized.as_str() {
            "lastactivated" => Ok(SortStrategy::LastActivated),
            "windowgrouped" => Ok(SortStrategy::WindowGrouped),
            "lastaccessed" => Ok(SortStrategy::LastAccessed),
            "lastdeactivated" => Ok(SortStrategy::LastDeactivated),
            other => Err(format!("Unknown sort strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Section {
    Tabs,
    Apps,
    RecentlyClosed,
    OtherDevices,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SortedEntry {
    pub section: Section,
    #[serde(flatten)]
    pub item: SortedItem,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SortedItem {
    Tab {
        tab: Tab,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_activated: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_deactivated: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        favicon_data_url: Option<String>,
    },
    Session {
        url: String,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fav_icon_url: Option<String>,
        /// Milliseconds; the sessions API reports seconds.
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },
}

impl SortedItem {
    pub fn tab_id(&self) -> Option<TabId> {
        match self {
            SortedItem::Tab { tab, .. } => Some(tab.id),
            SortedItem::Session { .. } => None,
        }
    }
}

pub fn sort_tabs_with_sections(snapshot: &Snapshot, strategy: SortStrategy) -> Vec<SortedEntry> {
    let app_windows: BTreeSet<WindowId> = snapshot
        .windows
        .iter()
        .filter(|window| window.window_type == WindowType::App)
        .map(|window| window.id)
        .collect();

    let (apps, regular): (Vec<&Tab>, Vec<&Tab>) = snapshot
        .tabs
        .iter()
        .partition(|tab| app_windows.contains(&tab.window_id));

    let augmentation = &snapshot.augmentation;
    let regular = sort_regular(regular, augmentation, strategy);
    let apps = sort_by_key_desc(apps, |tab| activation_key(tab, augmentation));

    let mut entries = Vec::with_capacity(
        snapshot.tabs.len()
            + snapshot.recently_closed.len()
            + snapshot
                .other_devices
                .iter()
                .map(|device| device.tabs.len())
                .sum::<usize>(),
    );
    entries.extend(
        regular
            .into_iter()
            .map(|tab| tab_entry(Section::Tabs, tab, augmentation)),
    );
    entries.extend(
        apps.into_iter()
            .map(|tab| tab_entry(Section::Apps, tab, augmentation)),
    );
    entries.extend(snapshot.recently_closed.iter().map(|closed| SortedEntry {
        section: Section::RecentlyClosed,
        item: SortedItem::Session {
            url: closed.url.clone(),
            title: closed.title.clone(),
            session_id: closed.session_id.clone(),
            fav_icon_url: closed.fav_icon_url.clone(),
            timestamp: closed.last_modified.saturating_mul(1_000),
            device_name: None,
        },
    }));
    for device in &snapshot.other_devices {
        entries.extend(device.tabs.iter().map(|remote| SortedEntry {
            section: Section::OtherDevices,
            item: SortedItem::Session {
                url: remote.url.clone(),
                title: remote.title.clone(),
                session_id: remote.session_id.clone(),
                fav_icon_url: remote.fav_icon_url.clone(),
                timestamp: remote.last_modified.saturating_mul(1_000),
                device_name: Some(device.device_name.clone()),
            },
        }));
    }
    entries
}

fn sort_regular<'a>(
    tabs: Vec<&'a Tab>,
    augmentation: &BTreeMap<TabId, Augmentation>,
    strategy: SortStrategy,
) -> Vec<&'a Tab> {
    match strategy {
        SortStrategy::LastActivated => {
            sort_by_key_desc(tabs, |tab| activation_key(tab, augmentation))
        }
        SortStrategy::LastAccessed => sort_by_key_desc(tabs, |tab| tab.last_accessed.unwrap_or(0)),
        SortStrategy::LastDeactivated => sort_by_key_desc(tabs, |tab| {
            augmentation
                .get(&tab.id)
                .and_then(|entry| entry.last_deactivated)
                .unwrap_or(0)
        }),
        SortStrategy::WindowGrouped => window_grouped(tabs, augmentation),
    }
}

fn window_grouped<'a>(
    tabs: Vec<&'a Tab>,
    augmentation: &BTreeMap<TabId, Augmentation>,
) -> Vec<&'a Tab> {
    // Groups keep first-appearance order so equal group timestamps stay stable.
    let mut groups: Vec<(WindowId, Vec<&'a Tab>)> = Vec::new();
    for tab in tabs {
        match groups.iter_mut().find(|(window_id, _)| *window_id == tab.window_id) {
            Some((_, members)) => members.push(tab),
            None => groups.push((tab.window_id, vec![tab])),
        }
    }

    let mut groups: Vec<(i64, Vec<&'a Tab>)> = groups
        .into_iter()
        .map(|(_, members)| {
            let members = sort_by_key_desc(members, |tab| activation_key(tab, augmentation));
            let newest = members
                .first()
                .map(|tab| activation_key(tab, augmentation))
                .unwrap_or(0);
            (newest, members)
        })
        .collect();
    groups.sort_by(|a, b| b.0.cmp(&a.0));
    groups.into_iter().flat_map(|(_, members)| members).collect()
}

fn sort_by_key_desc<'a, F>(mut tabs: Vec<&'a Tab>, key: F) -> Vec<&'a Tab>
where
    F: Fn(&Tab) -> i64,
{
    tabs.sort_by(|a, b| key(*b).cmp(&key(*a)));
    tabs
}

/// `lastActivated ?? browser lastAccessed ?? 0`.
pub fn activation_key(tab: &Tab, augmentation: &BTreeMap<TabId, Augmentation>) -> i64 {
    augmentation
        .get(&tab.id)
        .and_then(|entry| entry.last_activated)
        .or(tab.last_accessed)
        .unwrap_or(0)
}

fn tab_entry(
    section: Section,
    tab: &Tab,
    augmentation: &BTreeMap<TabId, Augmentation>,
) -> SortedEntry {
    let entry = augmentation.get(&tab.id);
    SortedEntry {
        section,
        item: SortedItem::Tab {
            tab: tab.clone(),
            last_activated: entry.and_then(|entry| entry.last_activated),
            last_deactivated: entry.and_then(|entry| entry.last_deactivated),
            favicon_data_url: entry.and_then(|entry| entry.favicon_data_url.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceSession, SessionTab, Window};

    fn tab(id: TabId, window_id: WindowId, last_accessed: Option<i64>) -> Tab {
        Tab {
            id,
            window_id,
            index: 0,
            url: format!("https://example.com/{id}"),
            title: format!("Tab {id}"),
            fav_icon_url: None,
            pinned: false,
            active: false,
            audible: false,
            last_accessed,
        }
    }

    fn window(id: WindowId, window_type: WindowType) -> Window {
        Window {
            id,
            window_type,
            focused: false,
        }
    }

    fn activated(snapshot: &mut Snapshot, id: TabId, at: i64) {
        snapshot.augmentation.entry(id).or_default().last_activated = Some(at);
    }

    fn ids(entries: &[SortedEntry]) -> Vec<TabId> {
        entries
            .iter()
            .filter_map(|entry| entry.item.tab_id())
            .collect()
    }

    fn closed(title: &str, last_modified: i64) -> SessionTab {
        SessionTab {
            session_id: Some(format!("s-{title}")),
            window_id: None,
            url: format!("https://closed.example/{title}"),
            title: title.to_string(),
            fav_icon_url: None,
            last_modified,
        }
    }

    #[test]
    fn last_activated_orders_most_recent_first() {
        let mut snapshot = Snapshot {
            tabs: vec![tab(1, 1, None), tab(2, 1, None), tab(3, 1, None)],
            windows: vec![window(1, WindowType::Normal)],
            ..Snapshot::default()
        };
        activated(&mut snapshot, 1, 100);
        activated(&mut snapshot, 2, 300);
        activated(&mut snapshot, 3, 200);

        let entries = sort_tabs_with_sections(&snapshot, SortStrategy::LastActivated);
        assert_eq!(ids(&entries), vec![2, 3, 1]);
    }

    #[test]
    fn last_activated_falls_back_to_browser_access_time_and_keeps_ties_stable() {
        let mut snapshot = Snapshot {
            tabs: vec![tab(1, 1, Some(50)), tab(2, 1, None), tab(3, 1, Some(400)), tab(4, 1, None)],
            ..Snapshot::default()
        };
        activated(&mut snapshot, 2, 300);

        let entries = sort_tabs_with_sections(&snapshot, SortStrategy::LastActivated);
        assert_eq!(ids(&entries), vec![3, 2, 1, 4]);
    }

    #[test]
    fn window_grouped_puts_most_recent_window_first() {
        let mut snapshot = Snapshot {
            tabs: vec![tab(1, 10, None), tab(2, 20, None), tab(3, 10, None), tab(4, 20, None)],
            windows: vec![window(10, WindowType::Normal), window(20, WindowType::Normal)],
            ..Snapshot::default()
        };
        activated(&mut snapshot, 1, 500);
        activated(&mut snapshot, 3, 100);
        activated(&mut snapshot, 2, 900);
        activated(&mut snapshot, 4, 200);

        let entries = sort_tabs_with_sections(&snapshot, SortStrategy::WindowGrouped);
        assert_eq!(ids(&entries), vec![2, 4, 1, 3]);
    }

    #[test]
    fn last_accessed_ignores_augmentation() {
        let mut snapshot = Snapshot {
            tabs: vec![tab(1, 1, Some(10)), tab(2, 1, Some(30)), tab(3, 1, Some(20))],
            ..Snapshot::default()
        };
        activated(&mut snapshot, 1, 10_000);

        let entries = sort_tabs_with_sections(&snapshot, SortStrategy::LastAccessed);
        assert_eq!(ids(&entries), vec![2, 3, 1]);
    }

    #[test]
    fn last_deactivated_orders_by_deactivation_time() {
        let mut snapshot = Snapshot {
            tabs: vec![tab(1, 1, None), tab(2, 1, None), tab(3, 1, None)],
            ..Snapshot::default()
        };
        snapshot.augmentation.entry(1).or_default().last_deactivated = Some(20);
        snapshot.augmentation.entry(3).or_default().last_deactivated = Some(70);

        let entries = sort_tabs_with_sections(&snapshot, SortStrategy::LastDeactivated);
        assert_eq!(ids(&entries), vec![3, 1, 2]);
    }

    #[test]
    fn sections_are_emitted_in_fixed_order() {
        let mut snapshot = Snapshot {
            tabs: vec![tab(1, 1, None), tab(2, 2, None), tab(3, 1, None)],
            windows: vec![window(1, WindowType::Normal), window(2, WindowType::App)],
            recently_closed: vec![closed("gone", 1_700_000_000)],
            other_devices: vec![DeviceSession {
                device_name: "laptop".to_string(),
                tabs: vec![closed("remote", 1_600_000_000)],
            }],
            ..Snapshot::default()
        };
        // The app tab is the most recent by far; it still lands after regular tabs.
        activated(&mut snapshot, 2, 9_999_999);
        activated(&mut snapshot, 1, 5);

        for strategy in [
            SortStrategy::LastActivated,
            SortStrategy::WindowGrouped,
            SortStrategy::LastAccessed,
            SortStrategy::LastDeactivated,
        ] {
            let entries = sort_tabs_with_sections(&snapshot, strategy);
            let sections: Vec<Section> = entries.iter().map(|entry| entry.section).collect();
            assert_eq!(
                sections,
                vec![
                    Section::Tabs,
                    Section::Tabs,
                    Section::Apps,
                    Section::RecentlyClosed,
                    Section::OtherDevices
                ],
                "strategy {strategy}"
            );
        }
    }

    #[test]
    fn apps_always_use_activation_order() {
        let mut snapshot = Snapshot {
            tabs: vec![tab(1, 2, Some(900)), tab(2, 2, Some(100))],
            windows: vec![window(2, WindowType::App)],
            ..Snapshot::default()
        };
        activated(&mut snapshot, 2, 1_000);

        let entries = sort_tabs_with_sections(&snapshot, SortStrategy::LastAccessed);
        assert_eq!(ids(&entries), vec![2, 1]);
        assert!(entries.iter().all(|entry| entry.section == Section::Apps));
    }

    #[test]
    fn session_entries_convert_seconds_and_keep_input_order() {
        let snapshot = Snapshot {
            recently_closed: vec![closed("older", 10), closed("newer", 20)],
            other_devices: vec![DeviceSession {
                device_name: "phone".to_string(),
                tabs: vec![closed("remote", 3)],
            }],
            ..Snapshot::default()
        };

        let entries = sort_tabs_with_sections(&snapshot, SortStrategy::LastActivated);
        let summary: Vec<(String, i64, Option<String>)> = entries
            .iter()
            .map(|entry| match &entry.item {
                SortedItem::Session {
                    title,
                    timestamp,
                    device_name,
                    ..
                } => (title.clone(), *timestamp, device_name.clone()),
                SortedItem::Tab { .. } => panic!("unexpected tab entry"),
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("older".to_string(), 10_000, None),
                ("newer".to_string(), 20_000, None),
                ("remote".to_string(), 3_000, Some("phone".to_string())),
            ]
        );
    }

    #[test]
    fn identical_input_yields_identical_output() {
        let mut snapshot = Snapshot {
            tabs: vec![tab(1, 1, Some(5)), tab(2, 2, Some(5)), tab(3, 1, Some(5))],
            windows: vec![window(1, WindowType::Normal), window(2, WindowType::Normal)],
            recently_closed: vec![closed("gone", 1)],
            ..Snapshot::default()
        };
        activated(&mut snapshot, 3, 5);

        for strategy in [SortStrategy::LastActivated, SortStrategy::WindowGrouped] {
            let first = serde_json::to_string(&sort_tabs_with_sections(&snapshot, strategy))
                .expect("encode");
            let second = serde_json::to_string(&sort_tabs_with_sections(&snapshot, strategy))
                .expect("encode");
            assert_eq!(first, second);
        }
    }

    #[test]
    fn strategy_parses_common_spellings() {
        assert_eq!(
            "windowGrouped".parse::<SortStrategy>(),
            Ok(SortStrategy::WindowGrouped)
        );
        assert_eq!(
            "last_deactivated".parse::<SortStrategy>(),
            Ok(SortStrategy::LastDeactivated)
        );
        assert!("recency".parse::<SortStrategy>().is_err());
        assert_eq!(
            serde_json::to_string(&SortStrategy::LastAccessed).expect("encode"),
            "\"lastAccessed\""
        );
    }
}
