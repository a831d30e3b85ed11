use crate::browser::{BrowserApi, BrowserApiError};
use crate::tracker::TabTracker;
use std::sync::Arc;
use tabmux_core::sort::SortStrategy;
use tabmux_core::wire::Command;
use tabmux_core::{Tab, TabId, WindowId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Result of a browser call issued for a command, returned to the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Activated {
        tab_id: TabId,
        result: Result<Tab, BrowserApiError>,
    },
    Closed {
        tab_id: TabId,
        window_id: WindowId,
        result: Result<(), BrowserApiError>,
    },
}

/// What the event loop still has to do after a command was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Spawned,
    SendSnapshot,
    Refresh,
    SetStrategy(SortStrategy),
    Ignored,
}

pub struct CommandDispatcher {
    browser: Arc<dyn BrowserApi>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl CommandDispatcher {
    pub fn new(browser: Arc<dyn BrowserApi>, completions: mpsc::UnboundedSender<Completion>) -> Self {
        Self {
            browser,
            completions,
        }
    }

    pub fn dispatch(&self, command: Command, tracker: &TabTracker) -> DispatchOutcome {
        match command {
            Command::ActivateTab { tab_id } => {
                if !tracker.contains_tab(tab_id) {
                    warn!(event = "command_unknown_tab", command = "activateTab", tab_id);
                    return DispatchOutcome::Ignored;
                }
                self.spawn_activate(tab_id);
                DispatchOutcome::Spawned
            }
            Command::CloseTab { tab_id } => {
                let Some(window_id) = tracker.window_of(tab_id) else {
                    warn!(event = "command_unknown_tab", command = "closeTab", tab_id);
                    return DispatchOutcome::Ignored;
                };
                self.spawn_close(tab_id, window_id);
                DispatchOutcome::Spawned
            }
            Command::RequestSnapshot => DispatchOutcome::SendSnapshot,
            Command::Refresh => DispatchOutcome::Refresh,
            Command::SetSortStrategy { strategy } => DispatchOutcome::SetStrategy(strategy),
        }
    }

    fn spawn_activate(&self, tab_id: TabId) {
        let browser = self.browser.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = browser.activate_tab(tab_id).await;
            if let Ok(tab) = &result {
                if let Err(err) = browser.focus_window(tab.window_id).await {
                    warn!(event = "focus_window_failed", window_id = tab.window_id, error = %err);
                }
            }
            let _ = completions.send(Completion::Activated { tab_id, result });
        });
    }

    fn spawn_close(&self, tab_id: TabId, window_id: WindowId) {
        let browser = self.browser.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = browser.remove_tab(tab_id).await;
            let _ = completions.send(Completion::Closed {
                tab_id,
                window_id,
                result,
            });
        });
    }
}

/// Folds a finished browser call into the tracker. The tab may have changed
/// or vanished while the call was in flight, so existence is re-checked and
/// applying the same completion twice has no further effect.
pub fn apply_completion(tracker: &mut TabTracker, completion: Completion) {
    match completion {
        Completion::Activated { tab_id, result } => match result {
            Ok(tab) => {
                tracker.apply_completion(tab);
            }
            Err(err) => log_call_failure("activateTab", tab_id, &err),
        },
        Completion::Closed {
            tab_id,
            window_id,
            result,
        } => match result {
            Ok(()) => {
                if tracker.contains_tab(tab_id) {
                    tracker.handle_tab_removed(tab_id, window_id);
                }
            }
            Err(err) => log_call_failure("closeTab", tab_id, &err),
        },
    }
}

fn log_call_failure(command: &'static str, tab_id: TabId, err: &BrowserApiError) {
    match err {
        BrowserApiError::NoSuchTab(_) => {
            debug!(event = "command_tab_gone", command, tab_id);
        }
        _ => {
            warn!(event = "browser_call_failed", command, tab_id, error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MemoryBrowser;
    use std::time::Duration;
    use tabmux_core::clock::ManualClock;
    use tabmux_core::{Window, WindowType};
    use tokio::time::timeout;

    fn tab(id: TabId, window_id: WindowId, active: bool) -> Tab {
        Tab {
            id,
            window_id,
            index: 0,
            url: format!("https://example.com/{id}"),
            title: format!("Tab {id}"),
            fav_icon_url: None,
            pinned: false,
            active,
            audible: false,
            last_accessed: None,
        }
    }

    fn window(id: WindowId, focused: bool) -> Window {
        Window {
            id,
            window_type: WindowType::Normal,
            focused,
        }
    }

    async fn setup() -> (
        Arc<MemoryBrowser>,
        TabTracker,
        CommandDispatcher,
        mpsc::UnboundedReceiver<Completion>,
    ) {
        let browser = Arc::new(MemoryBrowser::with_state(
            vec![window(1, true), window(2, false)],
            vec![tab(1, 1, true), tab(2, 2, true), tab(3, 2, false)],
        ));
        let mut tracker = TabTracker::new(Arc::new(ManualClock::new(0)));
        tracker
            .initialize(browser.as_ref())
            .await
            .expect("initialize");
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = CommandDispatcher::new(browser.clone(), tx);
        (browser, tracker, dispatcher, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Completion>) -> Completion {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("completion in time")
            .expect("completion")
    }

    #[tokio::test]
    async fn activate_updates_tab_then_focuses_its_window() {
        let (browser, tracker, dispatcher, mut rx) = setup().await;
        let outcome = dispatcher.dispatch(Command::ActivateTab { tab_id: 3 }, &tracker);
        assert_eq!(outcome, DispatchOutcome::Spawned);

        let completion = next(&mut rx).await;
        assert!(matches!(
            completion,
            Completion::Activated { tab_id: 3, result: Ok(_) }
        ));
        assert_eq!(browser.calls(), vec!["activate:3", "focus:2"]);
    }

    #[tokio::test]
    async fn unknown_tab_commands_are_ignored() {
        let (browser, tracker, dispatcher, _rx) = setup().await;
        assert_eq!(
            dispatcher.dispatch(Command::CloseTab { tab_id: 77 }, &tracker),
            DispatchOutcome::Ignored
        );
        assert_eq!(
            dispatcher.dispatch(Command::ActivateTab { tab_id: 77 }, &tracker),
            DispatchOutcome::Ignored
        );
        assert!(browser.calls().is_empty());
    }

    #[tokio::test]
    async fn non_browser_commands_map_to_outcomes() {
        let (_browser, tracker, dispatcher, _rx) = setup().await;
        assert_eq!(
            dispatcher.dispatch(Command::RequestSnapshot, &tracker),
            DispatchOutcome::SendSnapshot
        );
        assert_eq!(
            dispatcher.dispatch(Command::Refresh, &tracker),
            DispatchOutcome::Refresh
        );
        assert_eq!(
            dispatcher.dispatch(
                Command::SetSortStrategy {
                    strategy: SortStrategy::WindowGrouped
                },
                &tracker
            ),
            DispatchOutcome::SetStrategy(SortStrategy::WindowGrouped)
        );
    }

    #[tokio::test]
    async fn close_completion_is_idempotent_against_removed_event() {
        let (_browser, mut tracker, dispatcher, mut rx) = setup().await;
        dispatcher.dispatch(Command::CloseTab { tab_id: 3 }, &tracker);
        let completion = next(&mut rx).await;

        // The browser's own removal event beats the completion back.
        tracker.handle_tab_removed(3, 2);
        apply_completion(&mut tracker, completion.clone());
        apply_completion(&mut tracker, completion);

        assert!(!tracker.contains_tab(3));
        assert_eq!(tracker.tab_count(), 2);
    }

    #[tokio::test]
    async fn close_completion_removes_tab_when_no_event_arrived() {
        let (_browser, mut tracker, dispatcher, mut rx) = setup().await;
        dispatcher.dispatch(Command::CloseTab { tab_id: 1 }, &tracker);
        apply_completion(&mut tracker, next(&mut rx).await);
        assert!(!tracker.contains_tab(1));
    }

    #[tokio::test]
    async fn failed_call_leaves_tracker_untouched() {
        let (_browser, mut tracker, _dispatcher, _rx) = setup().await;
        let before = tracker.get_snapshot();
        apply_completion(
            &mut tracker,
            Completion::Activated {
                tab_id: 2,
                result: Err(BrowserApiError::NoSuchTab(2)),
            },
        );
        apply_completion(
            &mut tracker,
            Completion::Closed {
                tab_id: 2,
                window_id: 2,
                result: Err(BrowserApiError::Timeout { call: "removeTab" }),
            },
        );
        assert_eq!(tracker.get_snapshot(), before);
    }
}
