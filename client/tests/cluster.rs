// End-to-end tests against a real in-process cluster: one master plus a
// handful of chunkservers on ephemeral ports, driven through the client.

use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use gfs_chunkserver::chunkserver::{self, ChunkServer};
use gfs_chunkserver::download_buffer;
use gfs_chunkserver::gfs::chunk_server_service_server::ChunkServerServiceServer;
use gfs_client::Client;
use gfs_common::Config;
use gfs_master::gfs::master_service_server::MasterServiceServer;
use gfs_master::master::{self, Master};

fn test_config() -> Config {
    Config {
        max_chunk_size: 64,
        max_append_size: 16,
        replication_factor: 3,
        min_replicas: 2,
        download_buffer_expire: Duration::from_secs(5),
        download_buffer_tick: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(50),
        server_timeout: Duration::from_millis(300),
        lease_timeout: Duration::from_secs(2),
        server_check_interval: Duration::from_millis(100),
    }
}

struct ChunkServerHandle {
    addr: String,
    shutdown: Option<oneshot::Sender<()>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _root: TempDir,
}

struct TestCluster {
    master_addr: String,
    servers: Vec<ChunkServerHandle>,
    _master_shutdown: oneshot::Sender<()>,
    _master_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl TestCluster {
    async fn start(n: usize, config: &Config) -> TestCluster {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let master_addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

        let master = Master::new(config.clone());
        let check_task = tokio::spawn(master::run_server_check_loop(master.clone()));
        let (master_tx, master_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            Server::builder()
                .add_service(MasterServiceServer::new(master))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = master_rx.await;
                })
                .await
                .unwrap();
        });

        let mut servers = Vec::new();
        for _ in 0..n {
            servers.push(Self::start_chunkserver(&master_addr, config).await);
        }

        // Let the first heartbeats land before anyone asks for placement.
        tokio::time::sleep(config.heartbeat_interval * 4).await;

        TestCluster {
            master_addr,
            servers,
            _master_shutdown: master_tx,
            _master_tasks: vec![check_task],
        }
    }

    async fn start_chunkserver(master_addr: &str, config: &Config) -> ChunkServerHandle {
        let root = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

        let server = ChunkServer::new(
            addr.clone(),
            master_addr.to_string(),
            root.path().to_path_buf(),
            config.clone(),
        )
        .unwrap();

        let heartbeat_task = tokio::spawn(chunkserver::run_heartbeat_loop(server.clone()));
        let purge_task = tokio::spawn(download_buffer::run_purge_loop(
            server.download_buffer(),
            config.download_buffer_tick,
        ));

        let (tx, rx) = oneshot::channel::<()>();
        let service = server.clone();
        let serve_task = tokio::spawn(async move {
            Server::builder()
                .add_service(ChunkServerServiceServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        ChunkServerHandle {
            addr,
            shutdown: Some(tx),
            tasks: vec![heartbeat_task, purge_task, serve_task],
            _root: root,
        }
    }

    fn client(&self, config: &Config) -> Client {
        Client::new(self.master_addr.clone(), config.clone()).with_retry_config(8, 50)
    }

    /// Stop a chunkserver and its background loops, as a crash would.
    fn kill(&mut self, addr: &str) {
        for server in &mut self.servers {
            if server.addr == addr {
                if let Some(tx) = server.shutdown.take() {
                    let _ = tx.send(());
                }
                for task in &server.tasks {
                    task.abort();
                }
            }
        }
    }
}

#[tokio::test]
async fn single_file_write_read() {
    let config = test_config();
    let cluster = TestCluster::start(3, &config).await;
    let client = cluster.client(&config);

    client.create("/a").await.unwrap();
    client.write("/a", 0, b"hello").await.unwrap();

    let result = client.read("/a", 0, 5).await.unwrap();
    assert_eq!(result.data, b"hello");
    assert!(!result.eof);
}

#[tokio::test]
async fn cross_chunk_write() {
    let config = test_config();
    let cluster = TestCluster::start(3, &config).await;
    let client = cluster.client(&config);

    client.create("/b").await.unwrap();
    // Spans chunk 0 (bytes 60..64) and chunk 1 (bytes 0..4).
    client.write("/b", 60, b"ABCDEFGH").await.unwrap();

    let info = client.file_info("/b").await.unwrap();
    assert_eq!(info.chunk_count, 2);

    let result = client.read("/b", 60, 8).await.unwrap();
    assert_eq!(result.data, b"ABCDEFGH");
}

#[tokio::test]
async fn append_pads_full_chunk_and_retries_on_next() {
    let config = test_config();
    let cluster = TestCluster::start(3, &config).await;
    let client = cluster.client(&config);

    client.create("/c").await.unwrap();
    client.write("/c", 0, &[b'x'; 50]).await.unwrap();

    // 50 + 16 > 64: chunk 0 is padded and the record lands at the start of
    // chunk 1, i.e. file offset 64.
    let offset = client.append("/c", &[b'A'; 16]).await.unwrap();
    assert_eq!(offset, 64);

    let result = client.read("/c", 64, 16).await.unwrap();
    assert_eq!(result.data, vec![b'A'; 16]);

    let info = client.file_info("/c").await.unwrap();
    assert_eq!(info.chunk_count, 2);
}

#[tokio::test]
async fn re_replication_restores_replica_count() {
    // Replicate back up to the full factor when a holder dies.
    let config = Config {
        min_replicas: 3,
        ..test_config()
    };
    let mut cluster = TestCluster::start(4, &config).await;
    let client = cluster.client(&config);

    client.create("/d").await.unwrap();
    client.write("/d", 0, b"hello").await.unwrap();

    let handle = client.get_chunk_handle("/d", 0).await.unwrap();
    let before = client.get_replicas(handle).await.unwrap();
    assert_eq!(before.len(), 3);

    let victim = before[0].clone();
    cluster.kill(&victim);

    // Wait for the master to declare the victim dead and copy the chunk to
    // the spare server.
    let mut replicas = Vec::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        replicas = client.get_replicas(handle).await.unwrap();
        if replicas.len() == 3 && !replicas.contains(&victim) {
            break;
        }
    }
    assert_eq!(replicas.len(), 3, "replicas: {:?}", replicas);
    assert!(!replicas.contains(&victim));

    // The data survives; repeated reads cover the new replica too.
    for _ in 0..5 {
        let result = client.read("/d", 0, 5).await.unwrap();
        assert_eq!(result.data, b"hello");
    }
}

#[tokio::test]
async fn concurrent_appends_get_disjoint_offsets() {
    let config = test_config();
    let cluster = TestCluster::start(3, &config).await;
    let client_a = cluster.client(&config);
    let client_b = cluster.client(&config);

    client_a.create("/e").await.unwrap();

    let payload_a = [b'A'; 8];
    let payload_b = [b'B'; 8];
    let (offset_a, offset_b) = tokio::join!(
        client_a.append("/e", &payload_a),
        client_b.append("/e", &payload_b),
    );
    let offset_a = offset_a.unwrap();
    let offset_b = offset_b.unwrap();

    assert_ne!(offset_a, offset_b);
    let (first, second) = if offset_a < offset_b {
        (offset_a, offset_b)
    } else {
        (offset_b, offset_a)
    };
    assert!(first + 8 <= second, "records overlap: {} {}", first, second);

    let read_a = client_a.read("/e", offset_a, 8).await.unwrap();
    assert_eq!(read_a.data, payload_a);
    let read_b = client_b.read("/e", offset_b, 8).await.unwrap();
    assert_eq!(read_b.data, payload_b);
}

#[tokio::test]
async fn reads_past_end_of_file_report_eof() {
    let config = test_config();
    let cluster = TestCluster::start(3, &config).await;
    let client = cluster.client(&config);

    client.create("/f").await.unwrap();
    client.write("/f", 0, b"abc").await.unwrap();

    // One byte available before the end of the chunk.
    let result = client.read("/f", 2, 10).await.unwrap();
    assert_eq!(result.data, b"c");
    assert!(result.eof);

    // Nothing at all past the end.
    let result = client.read("/f", 3, 5).await.unwrap();
    assert!(result.data.is_empty());
    assert!(result.eof);

    let result = client.read("/f", 200, 5).await.unwrap();
    assert!(result.data.is_empty());
    assert!(result.eof);
}

#[tokio::test]
async fn namespace_operations_round_trip() {
    let config = test_config();
    let cluster = TestCluster::start(3, &config).await;
    let client = cluster.client(&config);

    client.mkdir("/dir").await.unwrap();
    client.create("/dir/file").await.unwrap();

    let entries = client.list("/dir").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "file");
    assert!(!entries[0].is_dir);

    let root = client.list("/").await.unwrap();
    assert!(root.iter().any(|e| e.name == "dir" && e.is_dir));

    client.delete("/dir/file").await.unwrap();
    assert!(client.file_info("/dir/file").await.is_err());
}
