//! Partition state persisted in a snapshot store and periodically merged with sibling partitions.
//!
//! Each partition keeps its model under `key_txid_partition`. On commit it also writes
//! the pointer `key_partition` to its last committed transaction so that siblings read
//! a snapshot that was completely written.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{
    config::{MergeConfig, PartitionConfig},
    error::StoreError,
    model::now_millis,
};

/// Key of the snapshot written by a partition for a transaction.
pub fn snapshot_key(base_key: &str, tx_id: u64, partition_index: usize) -> String {
    format!("{}_{}_{}", base_key, tx_id, partition_index)
}

/// Key of the pointer to the last transaction committed by a partition.
pub fn latest_tx_key(base_key: &str, partition_index: usize) -> String {
    format!("{}_{}", base_key, partition_index)
}

/// Transaction of `key` when it is a snapshot key of `partition_index` under `base_key`.
fn parse_snapshot_tx(key: &str, base_key: &str, partition_index: usize) -> Option<u64> {
    key.strip_prefix(base_key)?
        .strip_prefix('_')?
        .strip_suffix(&format!("_{}", partition_index))?
        .parse()
        .ok()
}

/// External storage of partition snapshots.
pub trait SnapshotStore<T> {
    /// Reads a snapshot.
    ///
    /// A sibling partition (`is_self == false`) is read at the transaction its pointer
    /// designates, `tx_id` being used when it has committed nothing yet.
    fn get(
        &self,
        base_key: &str,
        tx_id: Option<u64>,
        partition_index: usize,
        is_self: bool,
    ) -> Result<Option<T>, StoreError>;

    fn put(
        &self,
        base_key: &str,
        tx_id: u64,
        partition_index: usize,
        model: &T,
    ) -> Result<(), StoreError>;

    /// Records the last transaction committed by a partition.
    ///
    /// Older snapshots of the partition are no longer read and may be dropped.
    fn put_latest_tx(
        &self,
        base_key: &str,
        partition_index: usize,
        tx_id: u64,
    ) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |t| t <= now)
    }
}

/// In process snapshot store. Clones share the same entries.
///
/// Values are stored JSON encoded and expire after the configured lifespan. Expired
/// entries are purged on every write.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    lifespan: Option<Duration>,
}

impl MemoryStore {
    /// A store whose entries expire after `lifespan_seconds`, never when `0`.
    pub fn new(lifespan_seconds: u64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            lifespan: (lifespan_seconds > 0).then(|| Duration::from_secs(lifespan_seconds)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut entries = self.lock()?;
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.is_expired(Instant::now()),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        match entries.get(key) {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize + ?Sized>(&self, key: String, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_string(value)?;
        let now = Instant::now();
        let expires_at = self.lifespan.map(|lifespan| now + lifespan);
        let mut entries = self.lock()?;
        entries.retain(|_, entry| !entry.is_expired(now));
        entries.insert(key, Entry { value, expires_at });
        Ok(())
    }
}

impl<T: Serialize + DeserializeOwned> SnapshotStore<T> for MemoryStore {
    fn get(
        &self,
        base_key: &str,
        tx_id: Option<u64>,
        partition_index: usize,
        is_self: bool,
    ) -> Result<Option<T>, StoreError> {
        let tx_id = if is_self {
            tx_id
        } else {
            self.read::<u64>(&latest_tx_key(base_key, partition_index))?
                .or(tx_id)
        };
        match tx_id {
            Some(tx_id) => self.read(&snapshot_key(base_key, tx_id, partition_index)),
            None => Ok(None),
        }
    }

    fn put(
        &self,
        base_key: &str,
        tx_id: u64,
        partition_index: usize,
        model: &T,
    ) -> Result<(), StoreError> {
        self.write(snapshot_key(base_key, tx_id, partition_index), model)
    }

    fn put_latest_tx(
        &self,
        base_key: &str,
        partition_index: usize,
        tx_id: u64,
    ) -> Result<(), StoreError> {
        self.write(latest_tx_key(base_key, partition_index), &tx_id)?;
        self.lock()?.retain(|key, _| {
            parse_snapshot_tx(key, base_key, partition_index).map_or(true, |t| t >= tx_id)
        });
        Ok(())
    }
}

type Clock = Box<dyn Fn() -> u64 + Send>;

/// Model state of one partition.
///
/// Calls follow the commit cycle `begin_commit`, `get`, `put`, `commit`, once per batch.
/// Store failures never interrupt the cycle: they are logged and the data is considered
/// unavailable. The last model put is also kept in memory and stands in for a local
/// snapshot that could not be saved or is no longer found.
pub struct PartitionedStateStore<T, S, M>
where
    S: SnapshotStore<T>,
    M: Fn(&T, &T, &MergeConfig) -> T,
{
    store: S,
    merge: M,
    merge_config: MergeConfig,
    partition_index: usize,
    partition_count: usize,
    merge_interval_millis: u64,
    tx_id: Option<u64>,
    last_committed_tx_id: Option<u64>,
    last_merge_millis: u64,
    /// last model put
    retained: Option<T>,
    /// whether `retained` reached the store
    saved: bool,
    clock: Clock,
}

impl<T, S, M> PartitionedStateStore<T, S, M>
where
    T: Default + Clone,
    S: SnapshotStore<T>,
    M: Fn(&T, &T, &MergeConfig) -> T,
{
    pub fn new(store: S, merge: M, merge_config: MergeConfig, partition: &PartitionConfig) -> Self {
        Self {
            store,
            merge,
            merge_config,
            partition_index: partition.partition_index,
            partition_count: partition.partition_count,
            merge_interval_millis: partition.merge_interval_seconds * 1000,
            tx_id: None,
            last_committed_tx_id: None,
            last_merge_millis: now_millis(),
            retained: None,
            saved: true,
            clock: Box::new(now_millis),
        }
    }

    /// Replaces the wall clock, in milliseconds, used to schedule merges.
    ///
    /// The first merge happens one merge interval after this call.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + 'static) -> Self {
        self.last_merge_millis = clock();
        self.clock = Box::new(clock);
        self
    }

    pub fn begin_commit(&mut self, tx_id: u64) {
        self.tx_id = Some(tx_id);
    }

    /// The transaction whose snapshot is read by `get`.
    pub fn snapshot_tx_id(&self) -> u64 {
        match (self.last_committed_tx_id, self.tx_id) {
            (Some(committed), _) => committed,
            (None, Some(active)) => active.saturating_sub(1),
            (None, None) => 0,
        }
    }

    /// Reads the partition model, merging sibling models in when the merge interval elapsed.
    ///
    /// An absent model reads as the default value of `T`. A model that could not be
    /// saved, or whose snapshot expired, is read back from memory.
    pub fn get(&mut self, base_key: &str) -> T {
        let tx_id = self.snapshot_tx_id();
        let stored = if self.saved {
            match self
                .store
                .get(base_key, Some(tx_id), self.partition_index, true)
            {
                Ok(model) => model,
                Err(reason) => {
                    warn!(key = base_key, tx_id, %reason, "local snapshot unavailable");
                    None
                }
            }
        } else {
            None
        };
        let mut model = match stored {
            Some(model) => Some(model),
            None => self.retained.clone(),
        };
        let now = (self.clock)();
        if now.saturating_sub(self.last_merge_millis) >= self.merge_interval_millis {
            for sibling_index in (0..self.partition_count).filter(|&j| j != self.partition_index) {
                match self.store.get(base_key, Some(tx_id), sibling_index, false) {
                    Ok(Some(sibling)) => {
                        debug!(key = base_key, tx_id, sibling_index, "merging sibling snapshot");
                        model = Some(match model {
                            Some(local) => (self.merge)(&local, &sibling, &self.merge_config),
                            None => sibling,
                        });
                    }
                    Ok(None) => {}
                    Err(reason) => warn!(
                        key = base_key,
                        sibling_index,
                        %reason,
                        "sibling snapshot unavailable"
                    ),
                }
            }
            self.last_merge_millis = now;
        }
        model.unwrap_or_default()
    }

    /// Persists the model for the active transaction.
    pub fn put(&mut self, base_key: &str, model: &T) {
        let tx_id = self.tx_id.unwrap_or_default();
        match self.store.put(base_key, tx_id, self.partition_index, model) {
            Ok(()) => {
                self.last_committed_tx_id = Some(tx_id);
                self.saved = true;
            }
            Err(reason) => {
                warn!(key = base_key, tx_id, %reason, "snapshot not saved");
                self.saved = false;
            }
        }
        self.retained = Some(model.clone());
    }

    /// Publishes the last committed transaction to the sibling partitions.
    pub fn commit(&mut self, base_key: &str) {
        if let Some(tx_id) = self.last_committed_tx_id {
            if let Err(reason) = self
                .store
                .put_latest_tx(base_key, self.partition_index, tx_id)
            {
                warn!(key = base_key, tx_id, %reason, "commit pointer not saved");
            }
        }
        self.tx_id = None;
    }

    pub fn last_committed_tx_id(&self) -> Option<u64> {
        self.last_committed_tx_id
    }

    pub fn last_merge_millis(&self) -> u64 {
        self.last_merge_millis
    }
}
