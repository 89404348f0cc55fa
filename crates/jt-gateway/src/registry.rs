//! Connection registry
//!
//! Maps live tunnel identifiers to whatever the owning gateway needs to
//! deliver inbound frames: a peer handle for stream connections, a response
//! sink for pending HTTP requests. The registry never owns the connection
//! itself.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use jt_core::RegistryError;
use jt_protocol::TunnelId;

/// Table of live identifiers
pub struct ConnectionRegistry<H> {
    entries: DashMap<TunnelId, H>,
}

impl<H> ConnectionRegistry<H> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Bind `id` to `handle`
    ///
    /// Fails if `id` is already bound; the existing entry is left untouched.
    pub fn register(&self, id: TunnelId, handle: H) -> Result<(), RegistryError> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(id)),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    /// Remove `id` if present
    ///
    /// Returns whether an entry was removed. Calling it again is a no-op.
    pub fn unregister(&self, id: TunnelId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Remove and return the entry for `id`
    ///
    /// Of several concurrent callers at most one receives the handle.
    pub fn take(&self, id: TunnelId) -> Option<H> {
        self.entries.remove(&id).map(|(_, handle)| handle)
    }

    /// Whether `id` is bound
    pub fn contains(&self, id: TunnelId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Snapshot of the bound identifiers
    pub fn ids(&self) -> Vec<TunnelId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<(TunnelId, H)> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: Clone> ConnectionRegistry<H> {
    /// Handle bound to `id`, without side effects
    pub fn lookup(&self, id: TunnelId) -> Option<H> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }
}

impl<H> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let id = TunnelId::generate();

        registry.register(id, "peer-a").unwrap();
        assert_eq!(registry.lookup(id), Some("peer-a"));
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        // Lookup has no side effects
        assert_eq!(registry.lookup(id), Some("peer-a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_occupied_id() {
        let registry = ConnectionRegistry::new();
        let id = TunnelId::generate();

        registry.register(id, 1).unwrap();
        assert_eq!(
            registry.register(id, 2),
            Err(RegistryError::AlreadyRegistered(id))
        );
        assert_eq!(registry.lookup(id), Some(1));
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        assert_eq!(registry.lookup(TunnelId::generate()), None);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let id = TunnelId::generate();
        registry.register(id, ()).unwrap();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());

        // Unregistering an id that never existed is harmless too
        assert!(!registry.unregister(TunnelId::generate()));
    }

    #[test]
    fn test_id_reusable_after_unregister() {
        let registry = ConnectionRegistry::new();
        let id = TunnelId::generate();
        registry.register(id, "old").unwrap();
        registry.unregister(id);
        registry.register(id, "new").unwrap();
        assert_eq!(registry.lookup(id), Some("new"));
    }

    #[test]
    fn test_take_has_single_winner() {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = TunnelId::generate();
        registry.register(id, 7u32).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.take(id))
            })
            .collect();

        let winners: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners, vec![7]);
    }

    #[test]
    fn test_drain_and_clear() {
        let registry = ConnectionRegistry::new();
        let ids: Vec<_> = (0..3).map(|_| TunnelId::generate()).collect();
        for (n, id) in ids.iter().enumerate() {
            registry.register(*id, n).unwrap();
        }

        let mut drained: Vec<_> = registry.drain().into_iter().map(|(_, n)| n).collect();
        drained.sort();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(registry.is_empty());

        registry.register(ids[0], 9).unwrap();
        registry.clear();
        assert!(registry.ids().is_empty());
    }
}
