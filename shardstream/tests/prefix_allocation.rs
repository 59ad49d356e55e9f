//! Multi-rank prefix allocation.
//!
//! Ranks are tokio tasks. Each simulated machine gets its own shared memory
//! root, so ranks on different nodes never see each other's records.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use shardstream::prefix::{
    FileShm, LocalRendezvous, PrefixAllocator, PrefixError, Rendezvous, SharedPrefix,
    TcpRendezvous, World,
};
use tempfile::TempDir;

fn dirs(d: &[&str]) -> Vec<String> {
    d.iter().map(|s| s.to_string()).collect()
}

async fn allocate_on<R: Rendezvous>(
    shm_root: PathBuf,
    locals: Vec<String>,
    world: World,
    rendezvous: R,
) -> (World, Result<SharedPrefix, PrefixError>) {
    let allocator = PrefixAllocator::new(FileShm::new(shm_root));
    let result = allocator.allocate(&locals, world, &rendezvous).await;
    (world, result)
}

/// Run one job of `num_ranks` ranks over an in-process barrier.
async fn run_local_job(
    node_roots: &[PathBuf],
    locals: &[&str],
    ranks_per_node: usize,
) -> Vec<(World, Result<SharedPrefix, PrefixError>)> {
    let num_ranks = node_roots.len() * ranks_per_node;
    let mut handles = Vec::new();
    for (rank, rendezvous) in LocalRendezvous::group(num_ranks).into_iter().enumerate() {
        let world = World::new(rank, num_ranks, ranks_per_node).unwrap();
        let root = node_roots[world.node()].clone();
        handles.push(tokio::spawn(allocate_on(
            root,
            dirs(locals),
            world,
            rendezvous,
        )));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_rank_resolves_its_node_record() {
    let nodes = [TempDir::new().unwrap(), TempDir::new().unwrap()];
    let roots: Vec<PathBuf> = nodes.iter().map(|d| d.path().to_path_buf()).collect();

    let results = run_local_job(&roots, &["/data/a", "/data/b"], 2).await;
    assert_eq!(results.len(), 4);

    let expected: BTreeSet<String> = dirs(&["/data/a", "/data/b"]).into_iter().collect();
    for (world, result) in &results {
        let shared = result.as_ref().unwrap();
        assert_eq!(shared.prefix(), "000000", "rank {}", world.rank());
        assert_eq!(shared.locals().unwrap(), expected);
    }
    // One record per machine.
    for root in &roots {
        assert!(root.join("000000_locals").exists());
        assert!(!root.join("000001_locals").exists());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_jobs_on_one_machine() {
    let node = TempDir::new().unwrap();
    let roots = vec![node.path().to_path_buf()];

    let first = run_local_job(&roots, &["/a"], 2).await;
    let second = run_local_job(&roots, &["/b"], 2).await;

    let prefix_of = |results: &[(World, Result<SharedPrefix, PrefixError>)]| {
        let prefixes: BTreeSet<String> = results
            .iter()
            .map(|(_, r)| r.as_ref().unwrap().prefix().to_string())
            .collect();
        assert_eq!(prefixes.len(), 1);
        prefixes.into_iter().next().unwrap()
    };
    let a = prefix_of(&first);
    let b = prefix_of(&second);
    assert_ne!(a, b);

    // A third job claiming "/a" again is rejected by its leader before it
    // reaches the barrier. Its peer never shows up, so crossing the barrier
    // would hang.
    let mut group = LocalRendezvous::group(2);
    let leader = group.remove(0);
    let world = World::new(0, 2, 2).unwrap();
    let (_, result) = tokio::time::timeout(
        Duration::from_secs(5),
        allocate_on(roots[0].clone(), dirs(&["/a"]), world, leader),
    )
    .await
    .expect("leader should fail without waiting on its peers");

    let err = result.unwrap_err();
    assert!(err.is_configuration());
    assert!(matches!(err, PrefixError::LocalDirInUse { ref prefix, .. } if *prefix == a));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allocation_over_tcp() {
    let node = TempDir::new().unwrap();
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let num_ranks = 3;
    let mut handles = Vec::new();
    for rank in 0..num_ranks {
        let world = World::new(rank, num_ranks, num_ranks).unwrap();
        let rendezvous =
            TcpRendezvous::new(addr.clone()).with_connect_timeout(Duration::from_secs(10));
        handles.push(tokio::spawn(allocate_on(
            node.path().to_path_buf(),
            dirs(&["/scratch/ds"]),
            world,
            rendezvous,
        )));
    }

    let mut prefixes = BTreeSet::new();
    for handle in handles {
        let (_, result) = handle.await.unwrap();
        prefixes.insert(result.unwrap().prefix().to_string());
    }
    assert_eq!(prefixes, BTreeSet::from(["000000".to_string()]));
}
