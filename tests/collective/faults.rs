//! Failure handling: stalled nodes, abandoned calls, misuse.

use std::sync::Arc;
use std::time::Duration;

use arbor::{bootstrap_local, ArborConfig, ArborError, Communicator, ReduceOp};

use super::helpers::run_collective;

fn short_timeouts() -> ArborConfig {
    ArborConfig {
        collective_timeout: Duration::from_millis(400),
        ..ArborConfig::default()
    }
}

async fn world(n: u32, config: ArborConfig) -> Vec<Arc<Communicator>> {
    bootstrap_local(n, config)
        .await
        .expect("bootstrap failed")
        .into_iter()
        .map(Arc::new)
        .collect()
}

// Ids [0,1,2,3]: node 1 waits on its child 3, node 0 on its first child
// 1, and leaf 2 (whose partial went through) on its parent 0 for the
// broadcast. Each timeout names the edge it actually stalled on.
#[tokio::test]
async fn test_silent_node_times_out_naming_stalled_edge() {
    let comms = world(4, short_timeouts()).await;

    // Node 3 never makes the call.
    let mut tasks = Vec::new();
    for comm in comms.iter().take(3).cloned() {
        tasks.push(tokio::spawn(async move {
            comm.allreduce(&ReduceOp::Sum, &[1i64], true).await
        }));
    }

    let mut stalled_on = Vec::new();
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        match err {
            ArborError::CollectiveTimeout { peer, .. } => stalled_on.push(peer),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
    assert_eq!(stalled_on, vec![1, 3, 0]);
}

#[tokio::test]
async fn test_world_recovers_after_abandon() {
    let comms = world(4, short_timeouts()).await;

    // First call fails: node 3 sits out.
    let mut tasks = Vec::new();
    for comm in comms.iter().take(3).cloned() {
        tasks.push(tokio::spawn(async move {
            comm.allreduce(&ReduceOp::Sum, &[1i64], true).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }

    // Root abandons the failed call; the reset realigns node 3, which
    // never participated and would otherwise reuse id 0.
    comms[0].abandon(0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    for comm in &comms {
        assert_eq!(comm.next_call_id(), 1, "node {}", comm.id());
    }

    // A fresh call over the same fabric succeeds everywhere.
    let mut tasks = Vec::new();
    for comm in comms.iter().cloned() {
        tasks.push(tokio::spawn(async move {
            comm.allreduce(&ReduceOp::Sum, &[comm.id() as i64 + 1], true).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), vec![10]);
    }
}

#[tokio::test]
async fn test_abandon_releases_blocked_waiter_before_timeout() {
    // Default 30s collective timeout: only the reset can release node 1
    // within the test budget.
    let comms = world(2, ArborConfig::default()).await;

    let blocked = {
        let comm = Arc::clone(&comms[1]);
        tokio::spawn(async move { comm.allreduce(&ReduceOp::Sum, &[1i64], true).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    comms[0].abandon(0).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("abandon should release the waiter")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ArborError::CallAbandoned { call: 0 }), "got: {err:?}");
}

#[tokio::test]
async fn test_concurrent_calls_on_one_communicator_rejected() {
    let comms = world(2, ArborConfig::default()).await;

    let first = {
        let comm = Arc::clone(&comms[0]);
        tokio::spawn(async move { comm.allreduce(&ReduceOp::Sum, &[1i64], true).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The root is mid-call; a second call on the same communicator is
    // refused without consuming a call id.
    let err = comms[0].reduce(&ReduceOp::Sum, &[1i64], true).await.unwrap_err();
    assert!(matches!(err, ArborError::Protocol { .. }), "got: {err:?}");

    // The world is intact: node 1 joins in and the first call finishes.
    let second = {
        let comm = Arc::clone(&comms[1]);
        tokio::spawn(async move { comm.allreduce(&ReduceOp::Sum, &[1i64], true).await })
    };
    assert_eq!(first.await.unwrap().unwrap(), vec![2]);
    assert_eq!(second.await.unwrap().unwrap(), vec![2]);
}

#[tokio::test]
async fn test_mismatched_buffer_lengths_fail_at_the_combiner() {
    let comms = world(2, short_timeouts()).await;

    let root = {
        let comm = Arc::clone(&comms[0]);
        tokio::spawn(async move { comm.reduce(&ReduceOp::Sum, &[1i32, 2], true).await })
    };
    let leaf = {
        let comm = Arc::clone(&comms[1]);
        tokio::spawn(async move { comm.reduce(&ReduceOp::Sum, &[1i32, 2, 3], true).await })
    };

    // The leaf's send completes; the root rejects the oversized partial.
    let err = root.await.unwrap().unwrap_err();
    assert!(matches!(err, ArborError::Protocol { .. }), "got: {err:?}");
    assert_eq!(leaf.await.unwrap().unwrap(), None);
}

#[tokio::test]
async fn test_empty_value_rejected() {
    let results = run_collective(2, |comm| async move {
        comm.allreduce(&ReduceOp::Sum, &[] as &[i64], true).await
    })
    .await;
    for r in results {
        assert!(matches!(r.unwrap_err(), ArborError::Configuration { .. }));
    }
}
