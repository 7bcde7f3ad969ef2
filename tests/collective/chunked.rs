//! Chunked (`flat = false`) calls must agree exactly with whole-buffer
//! calls.

use super::helpers::{expect_ok, run_collective_with};
use arbor::{ArborConfig, ReduceOp};

fn small_chunks(chunk_elems: usize) -> ArborConfig {
    ArborConfig {
        chunk_elems,
        ..ArborConfig::default()
    }
}

fn node_values(id: u32, len: usize) -> Vec<i64> {
    (0..len).map(|i| (id as i64 + 1) * (i as i64 + 1)).collect()
}

fn expected_sum(world: u32, len: usize) -> Vec<i64> {
    let mut acc = vec![0i64; len];
    for id in 0..world {
        for (a, v) in acc.iter_mut().zip(node_values(id, len)) {
            *a += v;
        }
    }
    acc
}

#[tokio::test]
async fn test_ragged_buffer_pipelines_across_chunks() {
    // 10 elements over 3-element chunks: 3 + 3 + 3 + 1.
    let results = expect_ok(
        run_collective_with(4, small_chunks(3), |comm| async move {
            let value = node_values(comm.id(), 10);
            comm.allreduce(&ReduceOp::Sum, &value, false).await
        })
        .await,
    );
    for r in &results {
        assert_eq!(*r, expected_sum(4, 10));
    }
}

#[tokio::test]
async fn test_exact_multiple_of_chunk_size() {
    let results = expect_ok(
        run_collective_with(3, small_chunks(4), |comm| async move {
            let value = node_values(comm.id(), 8);
            comm.allreduce(&ReduceOp::Sum, &value, false).await
        })
        .await,
    );
    for r in &results {
        assert_eq!(*r, expected_sum(3, 8));
    }
}

#[tokio::test]
async fn test_single_element_chunks() {
    let results = expect_ok(
        run_collective_with(4, small_chunks(1), |comm| async move {
            let value = node_values(comm.id(), 5);
            comm.allreduce(&ReduceOp::Sum, &value, false).await
        })
        .await,
    );
    for r in &results {
        assert_eq!(*r, expected_sum(4, 5));
    }
}

#[tokio::test]
async fn test_chunked_reduce_matches_flat() {
    let results = expect_ok(
        run_collective_with(5, small_chunks(7), |comm| async move {
            let value = node_values(comm.id(), 100);
            let chunked = comm.reduce(&ReduceOp::Sum, &value, false).await?;
            let flat = comm.reduce(&ReduceOp::Sum, &value, true).await?;
            Ok((chunked, flat))
        })
        .await,
    );
    let expected = expected_sum(5, 100);
    assert_eq!(results[0], (Some(expected.clone()), Some(expected)));
    for r in &results[1..] {
        assert_eq!(*r, (None, None));
    }
}

#[tokio::test]
async fn test_buffer_smaller_than_chunk() {
    let results = expect_ok(
        run_collective_with(2, small_chunks(1000), |comm| async move {
            comm.allreduce(&ReduceOp::Sum, &[comm.id() as i64, 1], false).await
        })
        .await,
    );
    for r in &results {
        assert_eq!(*r, vec![1, 2]);
    }
}
