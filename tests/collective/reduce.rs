use super::helpers::{expect_ok, run_collective};
use arbor::ReduceOp;

#[tokio::test]
async fn test_four_node_sum_lands_only_at_root() {
    // Node i contributes i + 1; 1 + 2 + 3 + 4 = 10.
    let results = expect_ok(
        run_collective(4, |comm| async move {
            let value = [comm.id() as i64 + 1];
            comm.reduce(&ReduceOp::Sum, &value, true).await
        })
        .await,
    );

    assert_eq!(results[0], Some(vec![10]));
    for r in &results[1..] {
        assert_eq!(*r, None);
    }
}

#[tokio::test]
async fn test_single_node_reduce_returns_own_value() {
    let results = expect_ok(
        run_collective(1, |comm| async move {
            comm.reduce(&ReduceOp::Sum, &[5i32], true).await
        })
        .await,
    );
    assert_eq!(results, vec![Some(vec![5])]);
}

#[tokio::test]
async fn test_vector_sum_is_elementwise() {
    let results = expect_ok(
        run_collective(3, |comm| async move {
            let id = comm.id() as f64;
            comm.reduce(&ReduceOp::Sum, &[id, 2.0 * id, -id], true).await
        })
        .await,
    );
    assert_eq!(results[0], Some(vec![3.0, 6.0, -3.0]));
}

#[tokio::test]
async fn test_seven_node_min_and_max() {
    let mins = expect_ok(
        run_collective(7, |comm| async move {
            comm.reduce(&ReduceOp::Min, &[comm.id() as i32 - 3], true).await
        })
        .await,
    );
    assert_eq!(mins[0], Some(vec![-3]));

    let maxs = expect_ok(
        run_collective(7, |comm| async move {
            comm.reduce(&ReduceOp::Max, &[comm.id() as i32 - 3], true).await
        })
        .await,
    );
    assert_eq!(maxs[0], Some(vec![3]));
}

#[tokio::test]
async fn test_two_node_prod() {
    let results = expect_ok(
        run_collective(2, |comm| async move {
            comm.reduce(&ReduceOp::Prod, &[comm.id() as u64 + 2], true).await
        })
        .await,
    );
    // 2 * 3.
    assert_eq!(results[0], Some(vec![6]));
}

#[tokio::test]
async fn test_sequential_reduces_on_one_world() {
    // The fabric is reused across calls; call ids advance in lockstep.
    let results = expect_ok(
        run_collective(4, |comm| async move {
            let first = comm.reduce(&ReduceOp::Sum, &[1i32], true).await?;
            let second = comm.reduce(&ReduceOp::Sum, &[2i32], true).await?;
            Ok((first, second))
        })
        .await,
    );
    assert_eq!(results[0], (Some(vec![4]), Some(vec![8])));
    assert_eq!(results[1], (None, None));
}
