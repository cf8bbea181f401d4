//! Session table keyed by generated id.
//!
//! Pure in-memory bookkeeping: no I/O and no locking. The owner wraps it in
//! whatever synchronisation it needs and is responsible for keeping record
//! membership in step with handle liveness.

use crate::ssh::types::SessionSummary;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// One registered session. `handle` is owned exclusively by the record.
#[derive(Debug)]
pub struct SessionRecord<H> {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub handle: H,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl<H> SessionRecord<H> {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
        }
    }
}

/// Ids are random UUID v4 values, so an id is not reissued after its
/// record is removed. Only live ids are checked for collisions.
#[derive(Debug)]
pub struct SessionRegistry<H> {
    sessions: HashMap<String, SessionRecord<H>>,
}

impl<H> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<H> SessionRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a fresh id.
    pub fn create(
        &mut self,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        handle: H,
    ) -> &SessionRecord<H> {
        let mut session_id = Uuid::new_v4().to_string();
        while self.sessions.contains_key(&session_id) {
            session_id = Uuid::new_v4().to_string();
        }

        let record = SessionRecord {
            session_id: session_id.clone(),
            host: host.into(),
            port,
            username: username.into(),
            handle,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.sessions.entry(session_id).or_insert(record)
    }

    pub fn get(&self, id: &str) -> Option<&SessionRecord<H>> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SessionRecord<H>> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Summaries of every record, in no particular order.
    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions.values().map(SessionRecord::summary).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Remove a record. Removing an unknown id is not an error.
    pub fn remove(&mut self, id: &str) -> Option<SessionRecord<H>> {
        self.sessions.remove(id)
    }

    /// Mark a session as used now. Unknown ids are ignored.
    pub fn touch(&mut self, id: &str) {
        if let Some(record) = self.sessions.get_mut(id) {
            record.last_used_at = Some(Utc::now());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn registry_with(n: usize) -> (SessionRegistry<u32>, Vec<String>) {
        let mut registry = SessionRegistry::new();
        let ids = (0..n)
            .map(|i| {
                registry
                    .create("host.example", 22, "deploy", i as u32)
                    .session_id
                    .clone()
            })
            .collect();
        (registry, ids)
    }

    #[test]
    fn create_stores_identity_and_timestamps() {
        let mut registry = SessionRegistry::new();
        let record = registry.create("10.0.0.5", 2222, "root", "handle");
        assert_eq!(record.host, "10.0.0.5");
        assert_eq!(record.port, 2222);
        assert_eq!(record.username, "root");
        assert!(record.last_used_at.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ids_are_unique() {
        let (registry, ids) = registry_with(200);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 200);
        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn removed_ids_are_not_reissued() {
        let (mut registry, ids) = registry_with(1);
        registry.remove(&ids[0]);
        for i in 0..100 {
            let id = registry.create("h", 22, "u", i).session_id.clone();
            assert_ne!(id, ids[0]);
        }
    }

    #[test]
    fn remove_is_idempotent() {
        let (mut registry, ids) = registry_with(2);
        assert!(registry.remove(&ids[0]).is_some());
        assert!(registry.get(&ids[0]).is_none());
        assert!(registry.remove(&ids[0]).is_none());
        assert!(registry.remove("never-issued").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn touch_sets_last_used() {
        let (mut registry, ids) = registry_with(1);
        registry.touch(&ids[0]);
        let record = registry.get(&ids[0]).unwrap();
        assert!(record.last_used_at.is_some());
        assert!(record.last_used_at.unwrap() >= record.created_at);

        // unknown id: no panic, nothing created
        registry.touch("missing");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_excludes_handles() {
        let (registry, ids) = registry_with(3);
        let mut listed: Vec<String> = registry.list().into_iter().map(|s| s.session_id).collect();
        let mut expected = ids.clone();
        listed.sort();
        expected.sort();
        assert_eq!(listed, expected);
    }
}
