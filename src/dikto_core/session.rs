use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::dikto_core::domain::JobPatch;

/// Refresh hints published to the view layer. Queue and result lists render
/// independently, so they are invalidated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiEvent {
    QueueChanged,
    ResultsChanged,
}

/// Mutable state of one browser session. The progress listener mutates only
/// its own session; everything a session displays is otherwise derived from
/// the filesystem on demand.
#[derive(Debug)]
pub struct SessionState {
    pub user: String,
    /// Live-progress overlay for the job currently being worked on, if it
    /// belongs to this user.
    pub live: Option<JobPatch>,
    /// File the listener last saw in flight; used to detect completion.
    pub file_in_progress: Option<String>,
    /// Error entries this session has already rendered. A new name appearing
    /// here means the result list must refresh.
    pub known_errors: HashSet<String>,
    /// Job stem the server-side editor was last opened for.
    pub editor_file: Option<String>,
    events: broadcast::Sender<UiEvent>,
}

impl SessionState {
    pub fn new(user: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            user: user.into(),
            live: None,
            file_in_progress: None,
            known_errors: HashSet::new(),
            editor_file: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: UiEvent) {
        // Nobody listening is fine; the next subscriber re-reads everything.
        let _ = self.events.send(event);
    }
}

/// All sessions of the frontend process, keyed by user id.
#[derive(Debug, Default)]
pub struct Sessions {
    map: Mutex<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl Sessions {
    pub fn get_or_create(&self, user: &str) -> Arc<Mutex<SessionState>> {
        let mut map = self.map.lock().expect("sessions lock poisoned");
        map.entry(user.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(user))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_are_shared_per_user() {
        let sessions = Sessions::default();
        let a = sessions.get_or_create("u");
        let b = sessions.get_or_create("u");
        let other = sessions.get_or_create("v");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn publish_reaches_subscribers() {
        let session = SessionState::new("u");
        let mut rx = session.subscribe();
        session.publish(UiEvent::QueueChanged);
        assert_eq!(rx.try_recv().unwrap(), UiEvent::QueueChanged);
    }
}
