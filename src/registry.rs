// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::HostError;
use crate::lifecycle::Lifecycle;
use crate::progress::FileProgressCache;
use crate::swarm::{InfoHash, SwarmTorrent, TorrentId};

/// Controller-assigned handle for a torrent. Opaque to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(pub String);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(key: &str) -> Self {
        SessionKey(key.to_string())
    }
}

pub struct TorrentEntry {
    pub key: SessionKey,
    pub handle: Arc<dyn SwarmTorrent>,
    pub lifecycle: Lifecycle,
    pub cache: FileProgressCache,
    /// Applied when the torrent becomes ready; `None` selects every file.
    pub pending_selections: Option<Vec<bool>>,
}

impl TorrentEntry {
    pub fn new(
        key: SessionKey,
        handle: Arc<dyn SwarmTorrent>,
        selections: Option<Vec<bool>>,
    ) -> Self {
        Self {
            key,
            handle,
            lifecycle: Lifecycle::default(),
            cache: FileProgressCache::default(),
            pending_selections: selections,
        }
    }
}

/// Live torrents by session key, in the order they were started.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<SessionKey, TorrentEntry>,
    order: Vec<SessionKey>,
}

impl Registry {
    pub fn insert(&mut self, entry: TorrentEntry) -> Result<(), HostError> {
        if self.entries.contains_key(&entry.key) {
            return Err(HostError::DuplicateSessionKey(entry.key));
        }
        self.order.push(entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    pub fn resolve(&self, key: &SessionKey) -> Result<&Arc<dyn SwarmTorrent>, HostError> {
        self.entries
            .get(key)
            .map(|entry| &entry.handle)
            .ok_or_else(|| HostError::SessionKeyNotFound(key.clone()))
    }

    pub fn resolve_hash(&self, info_hash: &InfoHash) -> Result<&TorrentEntry, HostError> {
        self.find_hash(info_hash)
            .and_then(|key| self.entries.get(key))
            .ok_or(HostError::InfoHashNotFound(*info_hash))
    }

    pub fn resolve_hash_mut(&mut self, info_hash: &InfoHash) -> Result<&mut TorrentEntry, HostError> {
        let key = self
            .find_hash(info_hash)
            .cloned()
            .ok_or(HostError::InfoHashNotFound(*info_hash))?;
        self.entries
            .get_mut(&key)
            .ok_or(HostError::InfoHashNotFound(*info_hash))
    }

    pub fn by_torrent_id(&mut self, id: TorrentId) -> Option<&mut TorrentEntry> {
        self.entries.values_mut().find(|entry| entry.handle.id() == id)
    }

    pub fn remove_by_hash(&mut self, info_hash: &InfoHash) -> Option<TorrentEntry> {
        let key = self.find_hash(info_hash)?.clone();
        self.order.retain(|k| *k != key);
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TorrentEntry> {
        let order = &self.order;
        let mut entries: Vec<&mut TorrentEntry> = self.entries.values_mut().collect();
        entries.sort_by_key(|entry| order.iter().position(|k| *k == entry.key));
        entries.into_iter()
    }

    pub fn drain(&mut self) -> Vec<TorrentEntry> {
        self.order.clear();
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    fn find_hash(&self, info_hash: &InfoHash) -> Option<&SessionKey> {
        self.order.iter().find(|key| {
            self.entries
                .get(*key)
                .and_then(|entry| entry.handle.info_hash())
                .as_ref()
                == Some(info_hash)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::testing::FakeTorrent;

    fn entry(key: &str, id: u64, hash: u8) -> TorrentEntry {
        let torrent = Arc::new(FakeTorrent::new(id, InfoHash([hash; 20]), &[("a", 10)], 16));
        TorrentEntry::new(key.into(), torrent, None)
    }

    #[test]
    fn test_resolve_unknown_key_fails() {
        let registry = Registry::default();
        let err = registry.resolve(&"missing".into()).err().unwrap();
        assert!(matches!(err, HostError::SessionKeyNotFound(ref k) if k.0 == "missing"));
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut registry = Registry::default();
        registry.insert(entry("k", 1, 1)).unwrap();
        assert!(matches!(
            registry.insert(entry("k", 2, 2)),
            Err(HostError::DuplicateSessionKey(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_by_hash_and_id() {
        let mut registry = Registry::default();
        registry.insert(entry("first", 1, 1)).unwrap();
        registry.insert(entry("second", 2, 2)).unwrap();

        assert_eq!(registry.resolve_hash(&InfoHash([2; 20])).unwrap().key.0, "second");
        assert_eq!(registry.by_torrent_id(TorrentId(1)).unwrap().key.0, "first");
        assert!(registry.resolve_hash(&InfoHash([9; 20])).is_err());
    }

    #[test]
    fn test_remove_by_hash_keeps_order() {
        let mut registry = Registry::default();
        registry.insert(entry("a", 1, 1)).unwrap();
        registry.insert(entry("b", 2, 2)).unwrap();
        registry.insert(entry("c", 3, 3)).unwrap();

        assert!(registry.remove_by_hash(&InfoHash([2; 20])).is_some());
        assert!(registry.remove_by_hash(&InfoHash([2; 20])).is_none());

        let keys: Vec<String> = registry.iter_mut().map(|e| e.key.0.clone()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }
}
