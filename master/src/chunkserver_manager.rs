//! Liveness and placement tracking for chunkservers.
//!
//! One locked map, address to last-heartbeat plus the set of chunks the
//! server is intended to hold. Placement decisions (initial replica choice,
//! re-replication pairs) come out of this map.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;

use gfs_common::rpc::connect;
use gfs_common::GfsError;

use crate::gfs::chunk_server_service_client::ChunkServerServiceClient;
use crate::gfs::CreateChunkRequest;

#[derive(Debug)]
struct ChunkServerInfo {
    last_heartbeat: Instant,
    chunks: HashSet<u64>,
}

#[derive(Debug, Default)]
pub struct ChunkServerManager {
    servers: Mutex<HashMap<String, ChunkServerInfo>>,
}

impl ChunkServerManager {
    pub fn new() -> Self {
        ChunkServerManager::default()
    }

    /// Upsert a server entry and refresh its heartbeat time.
    pub fn heartbeat(&self, addr: &str) {
        let mut servers = self.servers.lock().expect("server map lock poisoned");
        match servers.get_mut(addr) {
            Some(info) => info.last_heartbeat = Instant::now(),
            None => {
                tracing::info!("new chunkserver {}", addr);
                servers.insert(
                    addr.to_string(),
                    ChunkServerInfo {
                        last_heartbeat: Instant::now(),
                        chunks: HashSet::new(),
                    },
                );
            }
        }
    }

    pub fn live_servers(&self) -> HashSet<String> {
        self.servers
            .lock()
            .expect("server map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Ask every address to create the chunk, recording membership whether
    /// or not the call succeeded (the chunk is *intended* at that server;
    /// the periodic scan reconciles the difference). Per-address errors are
    /// concatenated.
    pub async fn add_chunk(&self, addrs: &[String], handle: u64) -> Result<(), GfsError> {
        let mut err_list = String::new();
        for addr in addrs {
            let result = create_chunk_on(addr, handle).await;
            self.record_chunk(addr, handle);
            if let Err(e) = result {
                err_list.push_str(&format!("{};", e));
            }
        }

        if err_list.is_empty() {
            Ok(())
        } else {
            Err(GfsError::Rpc(err_list))
        }
    }

    /// Record that `addr` holds (or is intended to hold) `handle`.
    pub fn record_chunk(&self, addr: &str, handle: u64) {
        let mut servers = self.servers.lock().expect("server map lock poisoned");
        servers
            .entry(addr.to_string())
            .or_insert_with(|| ChunkServerInfo {
                last_heartbeat: Instant::now(),
                chunks: HashSet::new(),
            })
            .chunks
            .insert(handle);
    }

    /// Uniformly sample `n` distinct servers from the live set.
    pub fn choose_servers(&self, n: usize) -> Result<Vec<String>, GfsError> {
        let servers = self.servers.lock().expect("server map lock poisoned");
        if n > servers.len() {
            return Err(GfsError::NotEnoughServers {
                want: n,
                have: servers.len(),
            });
        }
        let mut rng = rand::thread_rng();
        Ok(servers.keys().cloned().choose_multiple(&mut rng, n))
    }

    /// Pick a `(from, to)` pair for re-replication: `from` holds the chunk,
    /// `to` does not.
    pub fn choose_re_replication(&self, handle: u64) -> Result<(String, String), GfsError> {
        let servers = self.servers.lock().expect("server map lock poisoned");
        let mut from = None;
        let mut to = None;
        for (addr, info) in servers.iter() {
            if info.chunks.contains(&handle) {
                from.get_or_insert_with(|| addr.clone());
            } else {
                to.get_or_insert_with(|| addr.clone());
            }
            if from.is_some() && to.is_some() {
                break;
            }
        }
        match (from, to) {
            (Some(from), Some(to)) => Ok((from, to)),
            _ => Err(GfsError::NoCandidates(handle)),
        }
    }

    /// Addresses that have missed heartbeats for longer than `timeout`.
    pub fn detect_dead_servers(&self, timeout: Duration) -> Vec<String> {
        let servers = self.servers.lock().expect("server map lock poisoned");
        let now = Instant::now();
        servers
            .iter()
            .filter(|(_, info)| now.duration_since(info.last_heartbeat) > timeout)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Drop a server and return the handles it held.
    pub fn remove_server(&self, addr: &str) -> Result<Vec<u64>, GfsError> {
        let mut servers = self.servers.lock().expect("server map lock poisoned");
        let info = servers
            .remove(addr)
            .ok_or_else(|| GfsError::Unknown(format!("cannot find chunkserver {}", addr)))?;
        Ok(info.chunks.into_iter().collect())
    }
}

async fn create_chunk_on(addr: &str, handle: u64) -> Result<(), GfsError> {
    let channel = connect(addr).await?;
    let mut client = ChunkServerServiceClient::new(channel);
    client
        .create_chunk(CreateChunkRequest { handle })
        .await
        .map_err(GfsError::rpc)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_registers_and_refreshes() {
        let csm = ChunkServerManager::new();
        csm.heartbeat("s1");
        csm.heartbeat("s2");
        csm.heartbeat("s1");
        assert_eq!(csm.live_servers().len(), 2);
    }

    #[test]
    fn choose_servers_returns_distinct_addresses() {
        let csm = ChunkServerManager::new();
        for i in 0..5 {
            csm.heartbeat(&format!("s{}", i));
        }
        let chosen = csm.choose_servers(3).unwrap();
        assert_eq!(chosen.len(), 3);
        let distinct: HashSet<_> = chosen.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn choose_servers_fails_when_too_few_live() {
        let csm = ChunkServerManager::new();
        csm.heartbeat("s1");
        let err = csm.choose_servers(3).unwrap_err();
        assert!(matches!(
            err,
            GfsError::NotEnoughServers { want: 3, have: 1 }
        ));
    }

    #[test]
    fn re_replication_pairs_holder_with_non_holder() {
        let csm = ChunkServerManager::new();
        csm.heartbeat("s1");
        csm.heartbeat("s2");
        csm.record_chunk("s1", 7);

        let (from, to) = csm.choose_re_replication(7).unwrap();
        assert_eq!(from, "s1");
        assert_eq!(to, "s2");
    }

    #[test]
    fn re_replication_fails_without_candidates() {
        let csm = ChunkServerManager::new();
        csm.heartbeat("s1");
        csm.record_chunk("s1", 7);
        // Every live server already holds the chunk.
        assert!(matches!(
            csm.choose_re_replication(7),
            Err(GfsError::NoCandidates(7))
        ));
        // No server holds it at all: nothing to copy from.
        assert!(matches!(
            csm.choose_re_replication(8),
            Err(GfsError::NoCandidates(8))
        ));
    }

    #[test]
    fn dead_servers_are_detected_and_removed() {
        let csm = ChunkServerManager::new();
        csm.heartbeat("s1");
        csm.record_chunk("s1", 1);
        csm.record_chunk("s1", 2);

        std::thread::sleep(Duration::from_millis(20));
        assert!(csm
            .detect_dead_servers(Duration::from_millis(5))
            .contains(&"s1".to_string()));
        assert!(csm.detect_dead_servers(Duration::from_secs(60)).is_empty());

        let mut handles = csm.remove_server("s1").unwrap();
        handles.sort_unstable();
        assert_eq!(handles, vec![1, 2]);
        assert!(csm.remove_server("s1").is_err());
    }
}
