//! Staging area for data pushed ahead of a commit.
//!
//! A client (or a forwarding primary) deposits bytes here under a `DataId`;
//! the commit RPC that follows consumes the entry exactly once. Entries that
//! are never committed fall out after `download_buffer_expire`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::gfs::DataId;

/// Hashable form of the wire-level `DataId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataKey {
    pub handle: u64,
    pub nonce: u64,
}

impl From<&DataId> for DataKey {
    fn from(id: &DataId) -> Self {
        DataKey {
            handle: id.handle,
            nonce: id.nonce,
        }
    }
}

impl From<DataKey> for DataId {
    fn from(key: DataKey) -> Self {
        DataId {
            handle: key.handle,
            nonce: key.nonce,
        }
    }
}

struct Entry {
    data: Vec<u8>,
    deadline: Instant,
}

pub struct DownloadBuffer {
    expire: Duration,
    next_nonce: AtomicU64,
    entries: Mutex<HashMap<DataKey, Entry>>,
}

impl DownloadBuffer {
    pub fn new(expire: Duration) -> Self {
        DownloadBuffer {
            expire,
            next_nonce: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh id for data destined for `handle`.
    pub fn new_data_id(&self, handle: u64) -> DataKey {
        DataKey {
            handle,
            nonce: self.next_nonce.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn set(&self, id: DataKey, data: Vec<u8>) {
        let deadline = Instant::now() + self.expire;
        self.entries
            .lock()
            .expect("download buffer lock poisoned")
            .insert(id, Entry { data, deadline });
    }

    pub fn contains(&self, id: DataKey) -> bool {
        self.entries
            .lock()
            .expect("download buffer lock poisoned")
            .contains_key(&id)
    }

    pub fn get(&self, id: DataKey) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .expect("download buffer lock poisoned")
            .get(&id)
            .map(|e| e.data.clone())
    }

    /// Consume the entry: the commit path reads each staged buffer once.
    pub fn take(&self, id: DataKey) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .expect("download buffer lock poisoned")
            .remove(&id)
            .map(|e| e.data)
    }

    pub fn remove(&self, id: DataKey) {
        self.entries
            .lock()
            .expect("download buffer lock poisoned")
            .remove(&id);
    }

    /// Drop entries past their deadline, returning how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("download buffer lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.deadline > now);
        before - entries.len()
    }
}

/// Periodic sweep of expired entries.
pub async fn run_purge_loop(buffer: std::sync::Arc<DownloadBuffer>, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        let evicted = buffer.purge_expired();
        if evicted > 0 {
            tracing::debug!("download buffer evicted {} expired entries", evicted);
        }
    }
}
