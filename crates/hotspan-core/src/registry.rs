//! Shared client registry.
//!
//! Tracks every client seen by the proxy alongside the set of blocked
//! identity keys. The registry is the only state shared across concurrent
//! proxy sessions, so every operation takes a short per-call lock and never
//! holds it across I/O. Blocking and seeing are deliberately disjoint: a
//! blocked key may or may not have a seen entry, and erasing a seen entry
//! does not unblock it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::{ClientIdentity, TetherClient};
use crate::report::ByteTransferReport;

#[derive(Debug, Default)]
struct RegistryInner {
    seen: RwLock<HashMap<String, TetherClient>>,
    blocked: RwLock<HashSet<String>>,
}

/// Thread-safe registry of seen and blocked clients.
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the client record for `identity` with a completed session's
    /// transfer report.
    ///
    /// Creates the record with the report as its initial cumulative value if
    /// the identity is unseen, otherwise merges the report and bumps the
    /// last-seen timestamp. Both counters land atomically with respect to
    /// readers. Never fails.
    pub fn record_session(
        &self,
        identity: &ClientIdentity,
        report: &ByteTransferReport,
        nickname: Option<&str>,
    ) {
        let mut seen = self.inner.seen.write();
        match seen.get_mut(&identity.key()) {
            Some(client) => {
                client.merge_report(report);
                if let Some(name) = nickname {
                    client.nickname = name.to_string();
                }
            }
            None => {
                let mut client = TetherClient::new(identity.clone(), *report);
                if let Some(name) = nickname {
                    client.nickname = name.to_string();
                }
                tracing::debug!("First session from client {}", identity);
                seen.insert(identity.key(), client);
            }
        }
    }

    /// Returns true if sessions from `identity` must be rejected.
    pub fn is_blocked(&self, identity: &ClientIdentity) -> bool {
        self.inner.blocked.read().contains(&identity.key())
    }

    /// Adds `identity` to the blocked set. Idempotent; the seen entry, if
    /// any, is left intact.
    pub fn block(&self, identity: &ClientIdentity) {
        if self.inner.blocked.write().insert(identity.key()) {
            tracing::info!("Blocked client {}", identity);
        }
    }

    /// Removes `identity` from the blocked set. Idempotent.
    pub fn unblock(&self, identity: &ClientIdentity) {
        if self.inner.blocked.write().remove(&identity.key()) {
            tracing::info!("Unblocked client {}", identity);
        }
    }

    /// Forgets the seen entry for `identity` entirely. Does not unblock.
    pub fn erase(&self, identity: &ClientIdentity) {
        self.inner.seen.write().remove(&identity.key());
    }

    /// Forgets every seen entry. The blocked set is untouched.
    pub fn clear(&self) {
        self.inner.seen.write().clear();
    }

    /// Renames the seen entry for `identity`, if present.
    pub fn set_nickname(&self, identity: &ClientIdentity, nickname: &str) {
        if let Some(client) = self.inner.seen.write().get_mut(&identity.key()) {
            client.nickname = nickname.to_string();
        }
    }

    /// Returns the seen entry for `identity`, if any.
    pub fn get(&self, identity: &ClientIdentity) -> Option<TetherClient> {
        self.inner.seen.read().get(&identity.key()).cloned()
    }

    /// Snapshot of all seen clients, most recently seen first.
    pub fn list_seen(&self) -> Vec<TetherClient> {
        let mut clients: Vec<TetherClient> = self.inner.seen.read().values().cloned().collect();
        clients.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        clients
    }

    /// Snapshot of all blocked identity keys.
    pub fn list_blocked(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.blocked.read().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of seen clients.
    pub fn seen_count(&self) -> usize {
        self.inner.seen.read().len()
    }
}
