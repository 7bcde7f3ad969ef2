use super::helpers::{expect_ok, run_collective};
use arbor::{FnOp, ReduceOp};

#[tokio::test]
async fn test_four_node_sum_everywhere() {
    let results = expect_ok(
        run_collective(4, |comm| async move {
            let value = [comm.id() as i64 + 1];
            comm.allreduce(&ReduceOp::Sum, &value, true).await
        })
        .await,
    );
    for r in &results {
        assert_eq!(*r, vec![10]);
    }
}

#[tokio::test]
async fn test_single_node_allreduce_returns_own_value() {
    let results = expect_ok(
        run_collective(1, |comm| async move {
            comm.allreduce(&ReduceOp::Sum, &[5i32, -5], true).await
        })
        .await,
    );
    assert_eq!(results, vec![vec![5, -5]]);
}

#[tokio::test]
async fn test_seven_node_vector_sum() {
    let results = expect_ok(
        run_collective(7, |comm| async move {
            let id = comm.id() as f64;
            comm.allreduce(&ReduceOp::Sum, &[id, 1.0], true).await
        })
        .await,
    );
    // 0 + 1 + ... + 6 = 21; seven ones.
    for r in &results {
        assert_eq!(*r, vec![21.0, 7.0]);
    }
}

#[tokio::test]
async fn test_five_node_prod() {
    let results = expect_ok(
        run_collective(5, |comm| async move {
            comm.allreduce(&ReduceOp::Prod, &[comm.id() as i64 + 1], true).await
        })
        .await,
    );
    for r in &results {
        assert_eq!(*r, vec![120]);
    }
}

// Left projection is associative but not commutative: the result is the
// first operand in the canonical order op(op(child_0, child_1), own).
// For ids [0,1,2,3] that chain bottoms out at node 3's value on every
// path, so the combination order is observable end to end.
#[tokio::test]
async fn test_non_commutative_left_projection_order() {
    let results = expect_ok(
        run_collective(4, |comm| async move {
            let op = FnOp::new(|a: i32, _b: i32| a);
            comm.allreduce(&op, &[comm.id() as i32], true).await
        })
        .await,
    );
    for r in &results {
        assert_eq!(*r, vec![3]);
    }
}

// Right projection keeps the last operand, which under the canonical
// order is always the root's own value.
#[tokio::test]
async fn test_non_commutative_right_projection_order() {
    let results = expect_ok(
        run_collective(4, |comm| async move {
            let op = FnOp::new(|_a: i32, b: i32| b);
            comm.allreduce(&op, &[comm.id() as i32 + 100], true).await
        })
        .await,
    );
    for r in &results {
        assert_eq!(*r, vec![100]);
    }
}

#[tokio::test]
async fn test_custom_op_from_registry() {
    let results = expect_ok(
        run_collective(3, |comm| async move {
            let mut reg = arbor::OpRegistry::new();
            reg.register("xor", std::sync::Arc::new(FnOp::new(|a: u32, b: u32| a ^ b)));
            let op = reg.resolve("xor").expect("registered op");
            comm.allreduce(op.as_ref(), &[1u32 << comm.id()], true).await
        })
        .await,
    );
    for r in &results {
        assert_eq!(*r, vec![0b111]);
    }
}

#[tokio::test]
async fn test_allreduce_then_reduce_share_fabric() {
    let results = expect_ok(
        run_collective(4, |comm| async move {
            let all = comm.allreduce(&ReduceOp::Sum, &[1i64], true).await?;
            let rooted = comm.reduce(&ReduceOp::Max, &[comm.id() as i64], true).await?;
            Ok((all, rooted))
        })
        .await,
    );
    for (i, (all, rooted)) in results.iter().enumerate() {
        assert_eq!(*all, vec![4]);
        if i == 0 {
            assert_eq!(*rooted, Some(vec![3]));
        } else {
            assert_eq!(*rooted, None);
        }
    }
}
