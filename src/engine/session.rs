//! Session id storage.
//!
//! Only ids and their last-access times are tracked; session attributes are
//! the handler's business.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::clock::TimeProvider;

pub const SESSION_COOKIE: &str = "JSESSIONID";
pub const SESSION_PATH_PARAM: &str = ";jsessionid=";

/// Idle time after which a session expires unless the descriptor says otherwise.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub trait SessionStore: Send + Sync {
    /// Starts a session and returns its id.
    fn create(&self) -> String;

    /// Refreshes a session's last-access time. False if unknown or expired.
    fn touch(&self, id: &str) -> bool;

    fn invalidate(&self, id: &str);

    fn set_timeout(&self, timeout: Duration);
}

pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Instant>>,
    timeout: Mutex<Duration>,
    clock: Arc<dyn TimeProvider>,
}

impl MemorySessionStore {
    pub fn new(clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout: Mutex::new(DEFAULT_SESSION_TIMEOUT),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every session idle for at least the timeout.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let timeout = *self.timeout.lock();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, last| now.saturating_duration_since(*last) < timeout);
        let purged = before - sessions.len();
        if purged > 0 {
            tracing::debug!(purged, "Expired sessions purged");
        }
        purged
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self) -> String {
        self.purge_expired();
        let id = Uuid::new_v4().simple().to_string();
        self.sessions.lock().insert(id.clone(), self.clock.now());
        id
    }

    fn touch(&self, id: &str) -> bool {
        let now = self.clock.now();
        let timeout = *self.timeout.lock();
        let mut sessions = self.sessions.lock();

        match sessions.get_mut(id) {
            Some(last) if now.saturating_duration_since(*last) < timeout => {
                *last = now;
                true
            }
            Some(_) => {
                sessions.remove(id);
                tracing::debug!(session = %id, "Session expired");
                false
            }
            None => false,
        }
    }

    fn invalidate(&self, id: &str) {
        self.sessions.lock().remove(id);
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockTimeProvider;

    #[test]
    fn test_ids_are_unique() {
        let store = MemorySessionStore::new(Arc::new(MockTimeProvider::default()));
        let a = store.create();
        let b = store.create();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sessions_expire_after_idle_timeout() {
        let clock = Arc::new(MockTimeProvider::default());
        let store = MemorySessionStore::new(clock.clone());
        store.set_timeout(Duration::from_secs(60));

        let id = store.create();
        clock.advance(Duration::from_secs(59));
        assert!(store.touch(&id));

        clock.advance(Duration::from_secs(59));
        assert!(store.touch(&id));

        clock.advance(Duration::from_secs(60));
        assert!(!store.touch(&id));
        assert!(store.is_empty());
    }

    #[test]
    fn test_create_sweeps_abandoned_sessions() {
        let clock = Arc::new(MockTimeProvider::default());
        let store = MemorySessionStore::new(clock.clone());
        store.set_timeout(Duration::from_secs(60));

        for _ in 0..5 {
            store.create();
        }
        assert_eq!(store.len(), 5);

        clock.advance(Duration::from_secs(61));
        let fresh = store.create();
        assert_eq!(store.len(), 1);
        assert!(store.touch(&fresh));
    }

    #[test]
    fn test_purge_keeps_active_sessions() {
        let clock = Arc::new(MockTimeProvider::default());
        let store = MemorySessionStore::new(clock.clone());
        store.set_timeout(Duration::from_secs(60));

        let idle = store.create();
        clock.advance(Duration::from_secs(30));
        let active = store.create();
        clock.advance(Duration::from_secs(30));

        assert_eq!(store.purge_expired(), 1);
        assert!(!store.touch(&idle));
        assert!(store.touch(&active));
    }

    #[test]
    fn test_unknown_and_invalidated_ids() {
        let store = MemorySessionStore::new(Arc::new(MockTimeProvider::default()));
        assert!(!store.touch("nope"));

        let id = store.create();
        store.invalidate(&id);
        assert!(!store.touch(&id));
    }
}
