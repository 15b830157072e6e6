//! The connection registry: all live sessions by participant identity.
//!
//! This is the single shared map in the process. Inserts and removals
//! are serialized by the map itself; snapshots handed to the clock and
//! dispatcher are valid as of the call only; the set can change between
//! snapshot and use, and callers tolerate that staleness.

use crate::error::{SessionError, SessionResult};
use crate::session::Session;
use auctd_core::{ParticipantId, Role};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Registry of live sessions keyed by participant identity.
pub struct ConnectionRegistry {
    sessions: DashMap<ParticipantId, Arc<Session>>,
    /// Connection counts per identity ever seen; used for the
    /// reconnect limit.
    connects: DashMap<ParticipantId, u32>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            connects: DashMap::new(),
        }
    }

    /// Bind an identity to a session.
    ///
    /// Fails if the identity is already bound to a live session. Returns
    /// the number of prior connections for this identity (0 on first
    /// contact), which the caller checks against the reconnect limit.
    pub fn bind(&self, id: ParticipantId, session: Arc<Session>) -> SessionResult<u32> {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => Err(SessionError::IdentityInUse(id)),
            Entry::Vacant(slot) => {
                slot.insert(session);
                let mut count = self.connects.entry(id.clone()).or_insert(0);
                let prior = *count;
                *count += 1;
                info!(participant = %id, prior_connections = prior, "Participant bound");
                Ok(prior)
            }
        }
    }

    /// Remove a session binding (called on session close).
    pub fn unbind(&self, id: &ParticipantId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Whether this identity has ever connected (live or not).
    #[must_use]
    pub fn is_known(&self, id: &ParticipantId) -> bool {
        self.connects.contains_key(id)
    }

    #[must_use]
    pub fn is_connected(&self, id: &ParticipantId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all live participant identities.
    #[must_use]
    pub fn active(&self) -> Vec<ParticipantId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of live identities with the given role.
    #[must_use]
    pub fn active_by_role(&self, role: Role) -> Vec<ParticipantId> {
        self.sessions
            .iter()
            .filter(|e| e.value().role() == Some(role))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Snapshot of live identities subscribed to market notifications.
    #[must_use]
    pub fn subscribers(&self) -> Vec<ParticipantId> {
        self.sessions
            .iter()
            .filter(|e| e.value().is_subscribed())
            .map(|e| e.key().clone())
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
