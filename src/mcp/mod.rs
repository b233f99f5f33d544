//! MCP Session Layer (C13). The spec's transport is a thin session-id
//! handshake with idle eviction, much simpler than a general JSON-RPC
//! tooling stack (`rmcp`/`schemars`/`garde`, as seen in the pack's
//! `optopsy-mcp` server) — implemented directly on `axum` instead of
//! pulling that stack in for a feature this small.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

const IDLE_TTL: Duration = Duration::from_secs(30 * 60);

struct McpSession {
    last_seen: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum McpSessionError {
    #[error("invalid session id")]
    InvalidSessionId,
}

pub struct McpSessionLayer {
    sessions: RwLock<HashMap<String, McpSession>>,
    idle_ttl: Duration,
}

impl Default for McpSessionLayer {
    fn default() -> Self {
        Self::new(IDLE_TTL)
    }
}

impl McpSessionLayer {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl,
        }
    }

    /// Provision a fresh session id (the first POST to `/mcp`).
    pub fn provision(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.write().insert(
            id.clone(),
            McpSession { last_seen: Utc::now() },
        );
        id
    }

    /// Touch an existing session, refreshing its idle clock. Returns
    /// `InvalidSessionId` if it doesn't exist or has already idled out.
    pub fn touch(&self, session_id: &str) -> Result<(), McpSessionError> {
        self.evict_idle();
        let mut sessions = self.sessions.write();
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.last_seen = Utc::now();
                Ok(())
            }
            None => Err(McpSessionError::InvalidSessionId),
        }
    }

    pub fn close(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    fn evict_idle(&self) {
        let now = Utc::now();
        let ttl = self.idle_ttl;
        self.sessions.write().retain(|_, session| {
            now.signed_duration_since(session.last_seen)
                .to_std()
                .map(|idle| idle < ttl)
                .unwrap_or(true)
        });
    }

    pub fn active_session_count(&self) -> usize {
        self.evict_idle();
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioned_session_can_be_touched() {
        let layer = McpSessionLayer::default();
        let id = layer.provision();
        assert!(layer.touch(&id).is_ok());
    }

    #[test]
    fn unknown_session_is_invalid() {
        let layer = McpSessionLayer::default();
        assert!(matches!(
            layer.touch("nonexistent"),
            Err(McpSessionError::InvalidSessionId)
        ));
    }

    #[test]
    fn idle_session_is_evicted() {
        let layer = McpSessionLayer::new(Duration::from_millis(1));
        let id = layer.provision();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            layer.touch(&id),
            Err(McpSessionError::InvalidSessionId)
        ));
    }

    #[test]
    fn closed_session_cannot_be_touched_again() {
        let layer = McpSessionLayer::default();
        let id = layer.provision();
        layer.close(&id);
        assert!(layer.touch(&id).is_err());
    }
}
