//! # Session Registry
//!
//! Maps carrier stream ids to live sessions. Entries are created when the
//! carrier sends `start` and removed on `closed` or transport error, so the
//! map cannot grow without bound and a stale stream id can never reach
//! another caller's session.

use crate::error::{RelayError, RelayResult};
use crate::session::session::StreamSession;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Registry of active call sessions.
///
/// ## Thread Safety:
/// RwLock allows concurrent lookups from many websocket actors; only
/// registration and removal take the write lock.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    max_concurrent_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
        }
    }

    /// Register a newly started session under its stream id.
    ///
    /// ## Errors:
    /// - capacity reached: the call is refused rather than degrading every
    ///   other active call
    /// - duplicate stream id: the carrier re-sent `start`; the existing
    ///   session stays authoritative
    pub fn register(&self, session: Arc<StreamSession>) -> RelayResult<()> {
        let mut sessions = self.sessions.write().unwrap();

        if sessions.len() >= self.max_concurrent_sessions {
            return Err(RelayError::Internal(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_concurrent_sessions
            )));
        }

        if sessions.contains_key(&session.stream_sid) {
            return Err(RelayError::BadRequest(format!(
                "Stream '{}' already has an active session",
                session.stream_sid
            )));
        }

        info!(
            "Registered session {} for stream {}",
            session.session_id, session.stream_sid
        );
        sessions.insert(session.stream_sid.clone(), session);
        Ok(())
    }

    pub fn get(&self, stream_sid: &str) -> Option<Arc<StreamSession>> {
        self.sessions.read().unwrap().get(stream_sid).cloned()
    }

    /// Remove and return a session. Idempotent: removing an unknown stream
    /// id returns None.
    pub fn remove(&self, stream_sid: &str) -> Option<Arc<StreamSession>> {
        let removed = self.sessions.write().unwrap().remove(stream_sid);
        if let Some(session) = &removed {
            info!(
                "Removed session {} for stream {}",
                session.session_id, stream_sid
            );
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Drop sessions idle longer than `max_idle_seconds`. Covers carriers
    /// that drop the transport without a `closed` event.
    pub fn cleanup_stale(&self, max_idle_seconds: u64) -> usize {
        let mut sessions = self.sessions.write().unwrap();

        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.idle_seconds() > max_idle_seconds as i64)
            .map(|(stream_sid, _)| stream_sid.clone())
            .collect();

        for stream_sid in &stale {
            if let Some(session) = sessions.remove(stream_sid) {
                warn!(
                    "Dropped stale session {} (idle {}s)",
                    session.session_id,
                    session.idle_seconds()
                );
                session.abort_outbound();
                session.buffer.clear();
            }
        }
        stale.len()
    }

    /// Summary rows for the diagnostics endpoints.
    pub fn summaries(&self) -> Vec<serde_json::Value> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .map(|session| session.summary())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn session(stream_sid: &str) -> Arc<StreamSession> {
        Arc::new(StreamSession::new(stream_sid, "CA-test", &AppConfig::default()))
    }

    #[test]
    fn test_register_get_remove() {
        let registry = SessionRegistry::new(10);
        registry.register(session("MZ1")).unwrap();

        assert_eq!(registry.active_count(), 1);
        assert!(registry.get("MZ1").is_some());
        assert!(registry.get("MZ2").is_none());

        assert!(registry.remove("MZ1").is_some());
        assert!(registry.remove("MZ1").is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_capacity_enforced() {
        let registry = SessionRegistry::new(2);
        registry.register(session("MZ1")).unwrap();
        registry.register(session("MZ2")).unwrap();
        assert!(registry.register(session("MZ3")).is_err());

        registry.remove("MZ1");
        assert!(registry.register(session("MZ3")).is_ok());
    }

    #[test]
    fn test_duplicate_stream_id_rejected() {
        let registry = SessionRegistry::new(10);
        registry.register(session("MZ1")).unwrap();
        assert!(registry.register(session("MZ1")).is_err());
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_cleanup_ignores_fresh_sessions() {
        let registry = SessionRegistry::new(10);
        registry.register(session("MZ1")).unwrap();
        assert_eq!(registry.cleanup_stale(300), 0);
        assert_eq!(registry.active_count(), 1);
    }
}
