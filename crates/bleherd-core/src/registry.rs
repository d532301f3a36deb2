//! Registry of tracked sessions.
//!
//! Peripherals are keyed by address. Once registered, a session stays for
//! the lifetime of the process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::Session;

/// Address-keyed session map.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session` unless its address is already tracked.
    ///
    /// Returns `true` if it was inserted. Calling this again with the same
    /// address leaves the registry unchanged.
    pub async fn register_if_absent(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.address()) {
            return false;
        }
        sessions.insert(session.address().to_string(), session);
        true
    }

    /// Whether an address is tracked.
    pub async fn contains(&self, address: &str) -> bool {
        self.sessions.read().await.contains_key(address)
    }

    /// Look up a session.
    pub async fn get(&self, address: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(address).cloned()
    }

    /// Snapshot of every session.
    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Number of tracked sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether nothing is tracked.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::events::EventDispatcher;
    use bleherd_types::{AddressKind, DeviceRole, PeripheralIdentity};

    fn session(address: &str) -> Arc<Session> {
        Session::new(
            PeripheralIdentity::new(address, AddressKind::Random, DeviceRole::LocatorTag),
            Arc::new(EventDispatcher::default()),
            Arc::new(TokioClock),
        )
        .0
    }

    #[tokio::test]
    async fn test_register_if_absent_is_idempotent() {
        let registry = Registry::new();
        let first = session("AA:BB:CC:DD:EE:01");

        assert!(registry.register_if_absent(Arc::clone(&first)).await);
        assert!(!registry.register_if_absent(session("AA:BB:CC:DD:EE:01")).await);
        assert!(!registry.register_if_absent(Arc::clone(&first)).await);

        assert_eq!(registry.len().await, 1);
        let tracked = registry.get("AA:BB:CC:DD:EE:01").await.unwrap();
        assert!(Arc::ptr_eq(&tracked, &first));
    }

    #[tokio::test]
    async fn test_lookup() {
        let registry = Registry::new();
        assert!(registry.is_empty().await);
        registry.register_if_absent(session("AA:BB:CC:DD:EE:01")).await;
        registry.register_if_absent(session("AA:BB:CC:DD:EE:02")).await;

        assert!(registry.contains("AA:BB:CC:DD:EE:02").await);
        assert!(registry.get("AA:BB:CC:DD:EE:03").await.is_none());
        assert_eq!(registry.all().await.len(), 2);
    }
}
