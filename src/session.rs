//! Protocol session storage.
//!
//! A session is created on the first request without an `Mcp-Session-Id`
//! header and carries the routing table discovered for it, so later requests
//! in the same session are routed without discovering again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::vmcp::{RoutingTable, Tool};

#[derive(Debug, Default)]
struct SessionState {
    routing_table: Option<RoutingTable>,
    tools: Vec<Tool>,
}

/// One client session
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: Instant,
    last_access: RwLock<Instant>,
    state: RwLock<SessionState>,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_access: RwLock::new(now),
            state: RwLock::new(SessionState::default()),
        }
    }

    /// Session ID
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Store the routing table and tools discovered for this session
    pub fn set_capabilities(&self, routing_table: RoutingTable, tools: Vec<Tool>) {
        let mut state = self.state.write();
        state.routing_table = Some(routing_table);
        state.tools = tools;
    }

    /// Stored routing table, if discovery completed for this session
    #[must_use]
    pub fn routing_table(&self) -> Option<RoutingTable> {
        self.state.read().routing_table.clone()
    }

    /// Stored tools
    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.state.read().tools.clone()
    }

    fn touch(&self) {
        *self.last_access.write() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.read().elapsed()
    }
}

/// Owns all live sessions
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ttl: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }
}

impl SessionManager {
    /// Manager whose sessions expire after `ttl` without access
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Create a session with a fresh ID
    pub fn create(&self) -> Arc<Session> {
        let id = format!("vmcp-{}", Uuid::new_v4());
        let session = Arc::new(Session::new(id.clone()));
        self.sessions.write().insert(id.clone(), Arc::clone(&session));
        info!(session_id = %id, "Session created");
        session
    }

    /// Look up a live session and refresh its idle timer
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().get(id).cloned()?;
        if session.idle_for() >= self.ttl {
            debug!(session_id = %id, "Session expired");
            self.sessions.write().remove(id);
            return None;
        }
        session.touch();
        Some(session)
    }

    /// Existing session with `id`, or a session registered under that ID
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        if let Some(session) = self.get(id) {
            return session;
        }
        let mut sessions = self.sessions.write();
        Arc::clone(
            sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Session::new(id.to_string()))),
        )
    }

    /// End a session. Returns whether it existed.
    pub fn terminate(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            info!(session_id = %id, "Session terminated");
        }
        removed
    }

    /// Drop sessions idle past the TTL. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.idle_for() < self.ttl);
        before - sessions.len()
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether there are no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_session_is_retrievable() {
        let manager = SessionManager::default();
        let session = manager.create();
        assert!(session.id().starts_with("vmcp-"));
        assert!(manager.get(session.id()).is_some());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn capabilities_round_trip_through_session() {
        let manager = SessionManager::default();
        let session = manager.create();
        assert!(session.routing_table().is_none());

        session.set_capabilities(
            RoutingTable::default(),
            vec![Tool {
                name: "echo".into(),
                ..Tool::default()
            }],
        );
        let again = manager.get(session.id()).unwrap();
        assert!(again.routing_table().is_some());
        assert_eq!(again.tools()[0].name, "echo");
    }

    #[test]
    fn terminate_removes_session() {
        let manager = SessionManager::default();
        let id = manager.create().id().to_string();
        assert!(manager.terminate(&id));
        assert!(!manager.terminate(&id));
        assert!(manager.get(&id).is_none());
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let manager = SessionManager::new(Duration::ZERO);
        let id = manager.create().id().to_string();
        assert!(manager.get(&id).is_none());
        manager.create();
        assert_eq!(manager.remove_expired(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn get_or_create_uses_given_id() {
        let manager = SessionManager::default();
        let session = manager.get_or_create("client-chosen");
        assert_eq!(session.id(), "client-chosen");
        assert!(Arc::ptr_eq(&session, &manager.get_or_create("client-chosen")));
    }
}
