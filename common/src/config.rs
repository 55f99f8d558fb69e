use std::time::Duration;

/// Cluster-wide tunables. Every component carries one of these; the chunk
/// geometry fields (`max_chunk_size`, `max_append_size`) must agree across
/// the whole deployment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on the byte length of a single chunk.
    pub max_chunk_size: u64,
    /// Upper bound on a single record append. Must stay at or below
    /// `max_chunk_size / 4` so an append either fits in the remainder of a
    /// chunk or pads it while leaving room on the next one.
    pub max_append_size: u64,
    /// Target replica count for every chunk.
    pub replication_factor: usize,
    /// Below this count the master schedules re-replication.
    pub min_replicas: usize,
    /// Lifetime of a staged download-buffer entry.
    pub download_buffer_expire: Duration,
    /// Sweep interval for expired download-buffer entries.
    pub download_buffer_tick: Duration,
    /// Interval between chunkserver heartbeats to the master.
    pub heartbeat_interval: Duration,
    /// A server missing heartbeats for this long is declared dead.
    pub server_timeout: Duration,
    /// Duration of a primary lease grant.
    pub lease_timeout: Duration,
    /// Interval of the master's dead-server / re-replication scan.
    pub server_check_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_chunk_size: 64 * 1024 * 1024,
            max_append_size: 16 * 1024 * 1024,
            replication_factor: 3,
            min_replicas: 2,
            download_buffer_expire: Duration::from_secs(60),
            download_buffer_tick: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(2),
            server_timeout: Duration::from_secs(10),
            lease_timeout: Duration::from_secs(30),
            server_check_interval: Duration::from_secs(5),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Defaults overridden by `GFS_*` environment variables where present.
    /// Durations are expressed in milliseconds.
    pub fn from_env() -> Self {
        let d = Config::default();
        Config {
            max_chunk_size: env_u64("GFS_MAX_CHUNK_SIZE", d.max_chunk_size),
            max_append_size: env_u64("GFS_MAX_APPEND_SIZE", d.max_append_size),
            replication_factor: env_u64(
                "GFS_REPLICATION_FACTOR",
                d.replication_factor as u64,
            ) as usize,
            min_replicas: env_u64("GFS_MIN_REPLICAS", d.min_replicas as u64) as usize,
            download_buffer_expire: Duration::from_millis(env_u64(
                "GFS_DOWNLOAD_BUFFER_EXPIRE_MS",
                d.download_buffer_expire.as_millis() as u64,
            )),
            download_buffer_tick: Duration::from_millis(env_u64(
                "GFS_DOWNLOAD_BUFFER_TICK_MS",
                d.download_buffer_tick.as_millis() as u64,
            )),
            heartbeat_interval: Duration::from_millis(env_u64(
                "GFS_HEARTBEAT_INTERVAL_MS",
                d.heartbeat_interval.as_millis() as u64,
            )),
            server_timeout: Duration::from_millis(env_u64(
                "GFS_SERVER_TIMEOUT_MS",
                d.server_timeout.as_millis() as u64,
            )),
            lease_timeout: Duration::from_millis(env_u64(
                "GFS_LEASE_TIMEOUT_MS",
                d.lease_timeout.as_millis() as u64,
            )),
            server_check_interval: Duration::from_millis(env_u64(
                "GFS_SERVER_CHECK_INTERVAL_MS",
                d.server_check_interval.as_millis() as u64,
            )),
        }
    }

    /// Zero-based chunk index covering a file offset.
    pub fn chunk_index(&self, file_offset: u64) -> u64 {
        file_offset / self.max_chunk_size
    }

    /// Intra-chunk offset for a file offset.
    pub fn chunk_offset(&self, file_offset: u64) -> u64 {
        file_offset % self.max_chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_append_within_quarter_chunk() {
        let c = Config::default();
        assert!(c.max_append_size <= c.max_chunk_size / 4);
        assert!(c.min_replicas <= c.replication_factor);
    }

    #[test]
    fn offset_arithmetic() {
        let c = Config {
            max_chunk_size: 64,
            ..Config::default()
        };
        assert_eq!(c.chunk_index(0), 0);
        assert_eq!(c.chunk_index(63), 0);
        assert_eq!(c.chunk_index(64), 1);
        assert_eq!(c.chunk_offset(64), 0);
        assert_eq!(c.chunk_offset(70), 6);
    }
}
