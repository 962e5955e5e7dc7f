use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use aya::maps::MapError;
use l4_redirect_common::{PolicyKey, PolicyLookup, PolicyValue, POLICY_MAP_CAPACITY};
use thiserror::Error;

pub const POLICY_SHARDS: usize = 16;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy table is full ({capacity} entries)")]
    Full { capacity: usize },
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Control-plane side of a policy table.
pub trait PolicyControl {
    /// Inserts or replaces the entry for `key`. Fails only when `key` is new
    /// and the table is at capacity.
    fn upsert(&mut self, key: PolicyKey, value: PolicyValue) -> Result<(), PolicyError>;

    /// Removes `key`. Removing an absent key is not an error.
    fn remove(&mut self, key: &PolicyKey) -> Result<(), PolicyError>;

    fn entries(&self) -> Result<Vec<(PolicyKey, PolicyValue)>, PolicyError>;
}

type Shard = HashMap<PolicyKey, PolicyValue>;

/// In-process policy table with read-copy-update semantics.
///
/// Readers load an immutable shard snapshot and never wait. Writers are
/// serialized by one mutex, copy the shard they touch and publish the copy.
pub struct PolicyTable {
    shards: Vec<ArcSwap<Shard>>,
    // Number of entries across all shards.
    writer: Mutex<usize>,
    capacity: usize,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::with_capacity(POLICY_MAP_CAPACITY as usize)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut shards = Vec::with_capacity(POLICY_SHARDS);
        for _ in 0..POLICY_SHARDS {
            shards.push(ArcSwap::from_pointee(Shard::new()));
        }
        Self {
            shards,
            writer: Mutex::new(0),
            capacity,
        }
    }

    fn shard(&self, key: &PolicyKey) -> &ArcSwap<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn get(&self, key: &PolicyKey) -> Option<PolicyValue> {
        self.shard(key).load().get(key).copied()
    }

    /// Returns the previous value for `key`, if any.
    pub fn insert(
        &self,
        key: PolicyKey,
        value: PolicyValue,
    ) -> Result<Option<PolicyValue>, PolicyError> {
        let mut len = self.writer.lock().expect("policy writer mutex poisoned");
        let shard = self.shard(&key);
        let current = shard.load_full();
        if !current.contains_key(&key) && *len >= self.capacity {
            return Err(PolicyError::Full {
                capacity: self.capacity,
            });
        }
        let mut next = Shard::clone(&current);
        let previous = next.insert(key, value);
        shard.store(Arc::new(next));
        if previous.is_none() {
            *len += 1;
        }
        Ok(previous)
    }

    pub fn remove(&self, key: &PolicyKey) -> Option<PolicyValue> {
        let mut len = self.writer.lock().expect("policy writer mutex poisoned");
        let shard = self.shard(key);
        let current = shard.load_full();
        if !current.contains_key(key) {
            return None;
        }
        let mut next = Shard::clone(&current);
        let previous = next.remove(key);
        shard.store(Arc::new(next));
        *len -= 1;
        previous
    }

    pub fn len(&self) -> usize {
        *self.writer.lock().expect("policy writer mutex poisoned")
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries of every shard. Shards are read one after the other, so a
    /// concurrent writer may be visible in some shards and not in others.
    pub fn snapshot(&self) -> Vec<(PolicyKey, PolicyValue)> {
        let mut entries = Vec::new();
        for shard in &self.shards {
            entries.extend(shard.load().iter().map(|(k, v)| (*k, *v)));
        }
        entries
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyLookup for PolicyTable {
    fn lookup(&self, key: &PolicyKey) -> Option<PolicyValue> {
        self.get(key)
    }
}

impl PolicyControl for PolicyTable {
    fn upsert(&mut self, key: PolicyKey, value: PolicyValue) -> Result<(), PolicyError> {
        self.insert(key, value).map(drop)
    }

    fn remove(&mut self, key: &PolicyKey) -> Result<(), PolicyError> {
        PolicyTable::remove(self, key);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(PolicyKey, PolicyValue)>, PolicyError> {
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        sync::atomic::{AtomicBool, Ordering},
        thread,
    };

    use l4_redirect_common::{IPPROTO_TCP, IPPROTO_UDP};

    use super::*;

    fn target(last: u8, port: u16) -> PolicyValue {
        PolicyValue::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn exact_key_lookup() {
        let table = PolicyTable::new();
        table
            .insert(PolicyKey::new(IPPROTO_TCP, 8080), target(5, 80))
            .unwrap();

        assert_eq!(
            table.lookup(&PolicyKey::new(IPPROTO_TCP, 8080)),
            Some(target(5, 80))
        );
        assert_eq!(table.lookup(&PolicyKey::new(IPPROTO_UDP, 8080)), None);
        assert_eq!(table.lookup(&PolicyKey::new(IPPROTO_TCP, 8081)), None);
    }

    #[test]
    fn insert_replaces_and_remove_deletes() {
        let table = PolicyTable::new();
        let key = PolicyKey::new(IPPROTO_UDP, 53);
        assert_eq!(table.insert(key, target(1, 53)).unwrap(), None);
        assert_eq!(table.insert(key, target(2, 53)).unwrap(), Some(target(1, 53)));
        assert_eq!(table.len(), 1);

        assert_eq!(table.remove(&key), Some(target(2, 53)));
        assert_eq!(table.remove(&key), None);
        assert!(table.is_empty());
    }

    #[test]
    fn capacity_rejects_new_keys_only() {
        let table = PolicyTable::with_capacity(2);
        table.insert(PolicyKey::new(IPPROTO_TCP, 1), target(1, 1)).unwrap();
        table.insert(PolicyKey::new(IPPROTO_TCP, 2), target(2, 2)).unwrap();

        assert!(matches!(
            table.insert(PolicyKey::new(IPPROTO_TCP, 3), target(3, 3)),
            Err(PolicyError::Full { capacity: 2 })
        ));
        // Updating an existing key at capacity is fine.
        table.insert(PolicyKey::new(IPPROTO_TCP, 2), target(9, 9)).unwrap();
        assert_eq!(table.len(), 2);

        table.remove(&PolicyKey::new(IPPROTO_TCP, 1));
        table.insert(PolicyKey::new(IPPROTO_TCP, 3), target(3, 3)).unwrap();
    }

    #[test]
    fn control_trait_removal_of_missing_key_is_ok() {
        let mut table = PolicyTable::new();
        assert!(PolicyControl::remove(&mut table, &PolicyKey::new(IPPROTO_TCP, 1)).is_ok());
        table
            .upsert(PolicyKey::new(IPPROTO_TCP, 1), target(1, 1))
            .unwrap();
        assert_eq!(table.entries().unwrap().len(), 1);
    }

    #[test]
    fn readers_run_alongside_writers() {
        let table = Arc::new(PolicyTable::new());
        let stable = PolicyKey::new(IPPROTO_TCP, 443);
        table.insert(stable, target(1, 8443)).unwrap();
        let running = Arc::new(AtomicBool::new(true));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                let running = running.clone();
                thread::spawn(move || {
                    let mut reads = 0u64;
                    while running.load(Ordering::Relaxed) || reads == 0 {
                        // The stable entry is never touched by the writer.
                        assert_eq!(table.lookup(&stable), Some(target(1, 8443)));
                        if let Some(v) = table.lookup(&PolicyKey::new(IPPROTO_UDP, 7)) {
                            assert_eq!(v.addr(), Ipv4Addr::new(10, 0, 0, 7));
                        }
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        for round in 0..500u16 {
            table
                .insert(PolicyKey::new(IPPROTO_UDP, 7), target(7, round))
                .unwrap();
            table.remove(&PolicyKey::new(IPPROTO_UDP, 7));
        }
        running.store(false, Ordering::Relaxed);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert_eq!(table.len(), 1);
    }
}
