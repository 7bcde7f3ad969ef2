//! Shared harness: form an in-process world and run one closure per node
//! concurrently.

use std::future::Future;
use std::sync::Arc;

use arbor::{bootstrap_local, ArborConfig, Communicator, Result};

/// Run `f` once per node, all nodes concurrently, and return the per-node
/// outcomes in id order.
pub async fn run_collective_with<F, Fut, T>(
    world: u32,
    config: ArborConfig,
    f: F,
) -> Vec<Result<T>>
where
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let comms = bootstrap_local(world, config).await.expect("bootstrap failed");
    let f = Arc::new(f);
    let tasks: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f(Arc::new(comm)).await })
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.expect("node task panicked"));
    }
    results
}

pub async fn run_collective<F, Fut, T>(world: u32, f: F) -> Vec<Result<T>>
where
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    run_collective_with(world, ArborConfig::default(), f).await
}

/// Unwrap every node's outcome, panicking on the first failure.
pub fn expect_ok<T>(results: Vec<Result<T>>) -> Vec<T> {
    results
        .into_iter()
        .enumerate()
        .map(|(node, r)| match r {
            Ok(v) => v,
            Err(e) => panic!("node {node} failed: {e}"),
        })
        .collect()
}
