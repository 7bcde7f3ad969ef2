//! Formation through a standalone coordinator, the way separate processes
//! would use it.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor::{build_tree, join, ArborConfig, Communicator, Coordinator, ReduceOp};

#[tokio::test]
async fn test_coordinator_forms_overlay_and_world_computes() {
    let config = ArborConfig::default();
    let coordinator = Coordinator::bind("127.0.0.1:0", 5, config.clone())
        .await
        .unwrap();
    let addr = coordinator.local_addr().unwrap().to_string();

    let form = tokio::spawn(coordinator.form_overlay());
    let joins: Vec<_> = (0..5)
        .map(|_| {
            let addr = addr.clone();
            let config = config.clone();
            tokio::spawn(async move { join(&addr, config).await })
        })
        .collect();

    let tree = form.await.unwrap().unwrap();
    assert_eq!(tree.len(), 5);
    assert_eq!(tree.root().id, 0);
    // Implicit array tree over ids 0..5.
    assert_eq!(tree.root().children, vec![1, 2]);
    assert_eq!(tree.node(1).unwrap().children, vec![3, 4]);

    let mut comms = Vec::new();
    for task in joins {
        comms.push(task.await.unwrap().unwrap());
    }
    comms.sort_by_key(|c| c.id());

    let tasks: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            tokio::spawn(async move { comm.allreduce(&ReduceOp::Sum, &[1u32], true).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), vec![5]);
    }
}

#[tokio::test]
async fn test_reconnect_is_a_noop() {
    // Manual wiring, no coordinator: two nodes exchange address cards
    // out of band.
    let config = ArborConfig::default();
    let c0 = Arc::new(Communicator::new(0, true, config.clone()).await.unwrap());
    let c1 = Arc::new(Communicator::new(1, false, config).await.unwrap());
    let tree = Arc::new(build_tree(&[0, 1]).unwrap());
    let peers = Arc::new(BTreeMap::from([(0, c0.info()), (1, c1.info())]));
    let pub_addr = c0.pub_addr().unwrap();

    let tasks: Vec<_> = [Arc::clone(&c0), Arc::clone(&c1)]
        .into_iter()
        .map(|comm| {
            let tree = Arc::clone(&tree);
            let peers = Arc::clone(&peers);
            let pub_addr = pub_addr.clone();
            tokio::spawn(async move { comm.connect(&peers, &tree, &pub_addr, 0).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // A second connect on a connected communicator is a no-op.
    c0.connect(&peers, &tree, &pub_addr, 0).await.unwrap();
    c1.connect(&peers, &tree, &pub_addr, 0).await.unwrap();

    // The fabric still carries collectives afterwards.
    let t0 = {
        let comm = Arc::clone(&c0);
        tokio::spawn(async move { comm.allreduce(&ReduceOp::Sum, &[1i64], true).await })
    };
    let t1 = {
        let comm = Arc::clone(&c1);
        tokio::spawn(async move { comm.allreduce(&ReduceOp::Sum, &[2i64], true).await })
    };
    assert_eq!(t0.await.unwrap().unwrap(), vec![3]);
    assert_eq!(t1.await.unwrap().unwrap(), vec![3]);
}

#[tokio::test]
async fn test_overlay_matches_locally_rebuilt_tree() {
    // Every node derives the same tree the coordinator returns.
    let config = ArborConfig::default();
    let coordinator = Coordinator::bind("127.0.0.1:0", 6, config.clone())
        .await
        .unwrap();
    let addr = coordinator.local_addr().unwrap().to_string();

    let form = tokio::spawn(coordinator.form_overlay());
    let joins: Vec<_> = (0..6)
        .map(|_| {
            let addr = addr.clone();
            let config = config.clone();
            tokio::spawn(async move { join(&addr, config).await })
        })
        .collect();

    let tree = form.await.unwrap().unwrap();
    let local = arbor::build_tree(&(0..6).collect::<Vec<_>>()).unwrap();
    assert_eq!(tree, local);

    for task in joins {
        task.await.unwrap().unwrap();
    }
}
