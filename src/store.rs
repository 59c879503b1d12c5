use crate::config::Destination;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A payload that could not be delivered live, waiting for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Monotonic per store; iteration in key order is FIFO.
    pub key: u64,
    pub destination: Destination,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
}

/// Bounded, per-destination persistence for undeliverable payloads.
///
/// Implementations must keep destinations independent: work on one
/// destination never waits on another. When a destination is at capacity,
/// `persist` evicts that destination's oldest record. Methods may block on
/// disk I/O; the drain loops call them from the blocking pool.
pub trait OfflineStore: Send + Sync {
    fn persist(
        &self,
        destination: &Destination,
        payload: &[u8],
        attempt_count: u32,
    ) -> Result<StoredRecord, StoreError>;

    /// Up to `max` records of `destination`, oldest first.
    fn peek_oldest(&self, destination: &Destination, max: usize) -> Result<Vec<StoredRecord>, StoreError>;

    fn remove(&self, record: &StoredRecord) -> Result<(), StoreError>;

    fn update_attempts(&self, record: &StoredRecord, attempt_count: u32) -> Result<(), StoreError>;

    fn count(&self, destination: &Destination) -> Result<usize, StoreError>;

    /// Destinations that currently hold at least one record.
    fn destinations(&self) -> Result<Vec<Destination>, StoreError>;
}

type MemoryLane = Arc<Mutex<BTreeMap<u64, StoredRecord>>>;

/// Non-durable store: same semantics as the sled store, lost on exit.
pub struct MemoryOfflineStore {
    capacity: usize,
    next_key: AtomicU64,
    lanes: Mutex<HashMap<Destination, MemoryLane>>,
}

impl MemoryOfflineStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_key: AtomicU64::new(1),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn lane(&self, destination: &Destination) -> MemoryLane {
        let mut lanes = self.lanes.lock();
        Arc::clone(lanes.entry(destination.clone()).or_default())
    }
}

impl OfflineStore for MemoryOfflineStore {
    fn persist(
        &self,
        destination: &Destination,
        payload: &[u8],
        attempt_count: u32,
    ) -> Result<StoredRecord, StoreError> {
        let record = StoredRecord {
            key: self.next_key.fetch_add(1, Ordering::Relaxed),
            destination: destination.clone(),
            payload: payload.to_vec(),
            enqueued_at: Utc::now(),
            attempt_count,
        };
        let lane = self.lane(destination);
        let mut lane = lane.lock();
        lane.insert(record.key, record.clone());
        while lane.len() > self.capacity {
            lane.pop_first();
        }
        Ok(record)
    }

    fn peek_oldest(&self, destination: &Destination, max: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let lane = self.lane(destination);
        let lane = lane.lock();
        Ok(lane.values().take(max).cloned().collect())
    }

    fn remove(&self, record: &StoredRecord) -> Result<(), StoreError> {
        self.lane(&record.destination).lock().remove(&record.key);
        Ok(())
    }

    fn update_attempts(&self, record: &StoredRecord, attempt_count: u32) -> Result<(), StoreError> {
        if let Some(stored) = self.lane(&record.destination).lock().get_mut(&record.key) {
            stored.attempt_count = attempt_count;
        }
        Ok(())
    }

    fn count(&self, destination: &Destination) -> Result<usize, StoreError> {
        Ok(self.lane(destination).lock().len())
    }

    fn destinations(&self) -> Result<Vec<Destination>, StoreError> {
        let lanes = self.lanes.lock();
        Ok(lanes
            .iter()
            .filter(|(_, lane)| !lane.lock().is_empty())
            .map(|(dest, _)| dest.clone())
            .collect())
    }
}

#[cfg(feature = "offline-store")]
pub use sled_store::SledOfflineStore;

#[cfg(feature = "offline-store")]
mod sled_store {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    const TREE_SEPARATOR: char = '\u{1f}';

    #[derive(Serialize, Deserialize)]
    struct StoredValue {
        enqueued_at_ms: i64,
        attempt_count: u32,
        payload: Vec<u8>,
    }

    /// One destination's tree and its record count. `Tree::len` walks the
    /// whole tree, so the count is read once on open and tracked after that.
    struct Lane {
        tree: sled::Tree,
        len: AtomicUsize,
    }

    /// Durable store on top of sled: one tree per destination, keys from
    /// `Db::generate_id` in big-endian so tree order is insertion order.
    pub struct SledOfflineStore {
        db: sled::Db,
        capacity: usize,
        lanes: Mutex<HashMap<Destination, Arc<Lane>>>,
    }

    impl SledOfflineStore {
        pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
            let db = sled::open(path)?;
            Ok(Self {
                db,
                capacity: capacity.max(1),
                lanes: Mutex::new(HashMap::new()),
            })
        }

        fn lane(&self, destination: &Destination) -> Result<Arc<Lane>, StoreError> {
            let mut lanes = self.lanes.lock();
            if let Some(lane) = lanes.get(destination) {
                return Ok(Arc::clone(lane));
            }
            let tree = self.db.open_tree(destination.storage_key().as_bytes())?;
            let lane = Arc::new(Lane {
                len: AtomicUsize::new(tree.len()),
                tree,
            });
            lanes.insert(destination.clone(), Arc::clone(&lane));
            Ok(lane)
        }

        fn encode(value: &StoredValue) -> Result<Vec<u8>, StoreError> {
            bincode::serde::encode_to_vec(value, bincode::config::standard())
                .map_err(|e| StoreError::Encode(e.to_string()))
        }

        fn decode(
            destination: &Destination,
            key: &[u8],
            bytes: &[u8],
        ) -> Result<StoredRecord, StoreError> {
            let (value, _): (StoredValue, usize) =
                bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
            let key: [u8; 8] = key
                .try_into()
                .map_err(|_| StoreError::Decode(format!("bad key length {}", key.len())))?;
            Ok(StoredRecord {
                key: u64::from_be_bytes(key),
                destination: destination.clone(),
                payload: value.payload,
                enqueued_at: DateTime::from_timestamp_millis(value.enqueued_at_ms)
                    .unwrap_or_else(Utc::now),
                attempt_count: value.attempt_count,
            })
        }
    }

    impl OfflineStore for SledOfflineStore {
        fn persist(
            &self,
            destination: &Destination,
            payload: &[u8],
            attempt_count: u32,
        ) -> Result<StoredRecord, StoreError> {
            let lane = self.lane(destination)?;
            let key = self.db.generate_id()?;
            let enqueued_at = Utc::now();
            let value = StoredValue {
                enqueued_at_ms: enqueued_at.timestamp_millis(),
                attempt_count,
                payload: payload.to_vec(),
            };
            if lane.tree.insert(key.to_be_bytes(), Self::encode(&value)?)?.is_none() {
                lane.len.fetch_add(1, Ordering::SeqCst);
            }

            let mut evicted = 0usize;
            while lane.len.load(Ordering::SeqCst) > self.capacity {
                if lane.tree.pop_min()?.is_none() {
                    lane.len.store(0, Ordering::SeqCst);
                    break;
                }
                lane.len.fetch_sub(1, Ordering::SeqCst);
                evicted += 1;
            }
            lane.tree.flush()?;

            if evicted > 0 {
                tracing::debug!(destination = %destination, evicted, "offline store at capacity, evicted oldest");
            }

            Ok(StoredRecord {
                key,
                destination: destination.clone(),
                payload: value.payload,
                enqueued_at,
                attempt_count,
            })
        }

        fn peek_oldest(&self, destination: &Destination, max: usize) -> Result<Vec<StoredRecord>, StoreError> {
            let lane = self.lane(destination)?;
            let mut records = Vec::with_capacity(max.min(64));
            for entry in lane.tree.iter().take(max) {
                let (key, bytes) = entry?;
                records.push(Self::decode(destination, &key, &bytes)?);
            }
            Ok(records)
        }

        fn remove(&self, record: &StoredRecord) -> Result<(), StoreError> {
            let lane = self.lane(&record.destination)?;
            if lane.tree.remove(record.key.to_be_bytes())?.is_some() {
                lane.len.fetch_sub(1, Ordering::SeqCst);
            }
            lane.tree.flush()?;
            Ok(())
        }

        fn update_attempts(&self, record: &StoredRecord, attempt_count: u32) -> Result<(), StoreError> {
            let lane = self.lane(&record.destination)?;
            let key = record.key.to_be_bytes();
            let Some(bytes) = lane.tree.get(key)? else {
                return Ok(());
            };
            let mut current = Self::decode(&record.destination, &key, &bytes)?;
            current.attempt_count = attempt_count;
            let value = StoredValue {
                enqueued_at_ms: current.enqueued_at.timestamp_millis(),
                attempt_count,
                payload: current.payload,
            };
            lane.tree.insert(key, Self::encode(&value)?)?;
            Ok(())
        }

        fn count(&self, destination: &Destination) -> Result<usize, StoreError> {
            Ok(self.lane(destination)?.len.load(Ordering::SeqCst))
        }

        fn destinations(&self) -> Result<Vec<Destination>, StoreError> {
            let mut found = Vec::new();
            for name in self.db.tree_names() {
                let Ok(name) = std::str::from_utf8(&name) else {
                    continue;
                };
                let Some((token, environment)) = name.split_once(TREE_SEPARATOR) else {
                    continue;
                };
                let destination = Destination::new(token, environment);
                if self.lane(&destination)?.len.load(Ordering::SeqCst) > 0 {
                    found.push(destination);
                }
            }
            Ok(found)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(token: &str) -> Destination {
        Destination::new(token, "test")
    }

    fn exercise_fifo_and_capacity(store: &dyn OfflineStore) {
        let a = dest("a");
        for i in 0..5u8 {
            store.persist(&a, &[i], 1).unwrap();
        }
        // capacity is 3: the two oldest are gone
        let records = store.peek_oldest(&a, 10).unwrap();
        let payloads: Vec<u8> = records.iter().map(|r| r.payload[0]).collect();
        assert_eq!(payloads, vec![2, 3, 4]);
        assert_eq!(store.count(&a).unwrap(), 3);

        store.remove(&records[0]).unwrap();
        assert_eq!(store.count(&a).unwrap(), 2);
        assert_eq!(store.peek_oldest(&a, 1).unwrap()[0].payload, vec![3]);
    }

    fn exercise_isolation(store: &dyn OfflineStore) {
        let a = dest("a");
        let b = dest("b");
        store.persist(&a, b"one", 0).unwrap();
        store.persist(&b, b"two", 0).unwrap();
        assert_eq!(store.count(&a).unwrap(), 1);
        assert_eq!(store.count(&b).unwrap(), 1);
        let mut dests = store.destinations().unwrap();
        dests.sort_by(|x, y| x.access_token.cmp(&y.access_token));
        assert_eq!(dests, vec![a, b]);
    }

    fn exercise_attempt_update(store: &dyn OfflineStore) {
        let a = dest("a");
        let record = store.persist(&a, b"payload", 1).unwrap();
        store.update_attempts(&record, 3).unwrap();
        let reloaded = store.peek_oldest(&a, 1).unwrap().remove(0);
        assert_eq!(reloaded.attempt_count, 3);
        assert_eq!(reloaded.payload, b"payload".to_vec());
    }

    #[test]
    fn memory_store_fifo_and_capacity() {
        exercise_fifo_and_capacity(&MemoryOfflineStore::new(3));
    }

    #[test]
    fn memory_store_isolates_destinations() {
        exercise_isolation(&MemoryOfflineStore::new(3));
    }

    #[test]
    fn memory_store_updates_attempts() {
        exercise_attempt_update(&MemoryOfflineStore::new(3));
    }

    #[cfg(feature = "offline-store")]
    #[test]
    fn sled_store_fifo_and_capacity() {
        let dir = tempfile::tempdir().unwrap();
        exercise_fifo_and_capacity(&SledOfflineStore::open(dir.path(), 3).unwrap());
    }

    #[cfg(feature = "offline-store")]
    #[test]
    fn sled_store_isolates_destinations() {
        let dir = tempfile::tempdir().unwrap();
        exercise_isolation(&SledOfflineStore::open(dir.path(), 3).unwrap());
    }

    #[cfg(feature = "offline-store")]
    #[test]
    fn sled_store_updates_attempts() {
        let dir = tempfile::tempdir().unwrap();
        exercise_attempt_update(&SledOfflineStore::open(dir.path(), 3).unwrap());
    }

    #[cfg(feature = "offline-store")]
    #[test]
    fn sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = dest("durable");
        {
            let store = SledOfflineStore::open(dir.path(), 10).unwrap();
            store.persist(&a, b"first", 1).unwrap();
            store.persist(&a, b"second", 2).unwrap();
        }
        let store = SledOfflineStore::open(dir.path(), 10).unwrap();
        let records = store.peek_oldest(&a, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, b"first".to_vec());
        assert_eq!(records[1].attempt_count, 2);
        assert_eq!(store.destinations().unwrap(), vec![a]);
    }
}
