//! Focus and connectivity sources.
//!
//! The host application drives these flags; queries listen for false to
//! true transitions to refetch stale observed data.

use std::sync::Arc;
use tokio::sync::watch;

/// Observable focus/online state shared by every query of a client.
#[derive(Debug, Clone)]
pub struct Environment {
    focused: Arc<watch::Sender<bool>>,
    online: Arc<watch::Sender<bool>>,
}

impl Environment {
    /// Starts focused and online.
    pub fn new() -> Self {
        Self::with_state(true, true)
    }

    pub fn with_state(focused: bool, online: bool) -> Self {
        Self {
            focused: Arc::new(watch::channel(focused).0),
            online: Arc::new(watch::channel(online).0),
        }
    }

    /// Returns true if the value changed.
    pub fn set_focused(&self, focused: bool) -> bool {
        set_flag(&self.focused, focused)
    }

    /// Returns true if the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        set_flag(&self.online, online)
    }

    pub fn is_focused(&self) -> bool {
        *self.focused.borrow()
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn watch_focus(&self) -> watch::Receiver<bool> {
        self.focused.subscribe()
    }

    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

fn set_flag(tx: &watch::Sender<bool>, value: bool) -> bool {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_focused_and_online() {
        let env = Environment::new();
        assert!(env.is_focused());
        assert!(env.is_online());
    }

    #[test]
    fn test_setters_report_changes() {
        let env = Environment::new();
        assert!(!env.set_focused(true));
        assert!(env.set_focused(false));
        assert!(!env.is_focused());
        assert!(env.set_online(false));
        assert!(!env.is_online());
    }

    #[test]
    fn test_clones_share_state() {
        let env = Environment::new();
        let other = env.clone();
        other.set_online(false);
        assert!(!env.is_online());
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let env = Environment::with_state(false, true);
        let mut rx = env.watch_focus();
        assert!(!*rx.borrow_and_update());

        env.set_focused(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
