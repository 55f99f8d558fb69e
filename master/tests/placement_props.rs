// Property tests for placement and handle allocation.

use std::time::Duration;

use proptest::prelude::*;

use gfs_master::chunk_directory::ChunkDirectory;
use gfs_master::chunkserver_manager::ChunkServerManager;

proptest! {
    // choose_servers either returns exactly k distinct live servers or
    // refuses because the live set is too small.
    #[test]
    fn placement_is_distinct_and_bounded(n in 0usize..12, k in 0usize..12) {
        let csm = ChunkServerManager::new();
        for i in 0..n {
            csm.heartbeat(&format!("s{}", i));
        }
        match csm.choose_servers(k) {
            Ok(chosen) => {
                prop_assert!(k <= n);
                prop_assert_eq!(chosen.len(), k);
                let distinct: std::collections::HashSet<_> = chosen.iter().collect();
                prop_assert_eq!(distinct.len(), k);
            }
            Err(_) => prop_assert!(k > n),
        }
    }
}

proptest! {
    // Handle allocation is dense and monotonic no matter how chunks are
    // spread across files.
    #[test]
    fn handles_stay_dense_across_files(chunks_per_file in proptest::collection::vec(0u64..5, 1..6)) {
        let dir = ChunkDirectory::new();
        let mut expected = 0u64;
        for (f, count) in chunks_per_file.iter().enumerate() {
            let path = format!("/f{}", f);
            dir.create_file(&path).unwrap();
            for index in 0..*count {
                let (handle, created) = dir
                    .allocate_chunk(&path, index, vec!["s1".to_string()], Duration::from_secs(30))
                    .unwrap();
                prop_assert!(created);
                prop_assert_eq!(handle, expected);
                expected += 1;
            }
        }
    }
}
