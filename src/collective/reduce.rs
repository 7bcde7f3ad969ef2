//! Upward combine phase.

use std::sync::Arc;

use crate::collective::helpers::{edge_recv, edge_send, AbortTable};
use crate::collective::CallCtx;
use crate::error::{ArborError, Result};
use crate::op::ElementOp;
use crate::protocol::TreeMessage;
use crate::transport::Link;

/// Combine this node's subtree, chunk by chunk.
///
/// For each chunk, partials from the children are received in fixed tree
/// order and folded left-to-right, then the node's own chunk is folded in
/// last. An interior node forwards each combined chunk to its parent as
/// soon as it is ready; the root keeps them. Returns the combined chunks
/// in order.
pub(crate) async fn combine_up(
    ctx: &CallCtx,
    op: &dyn ElementOp,
    own: &[u8],
    parent: Option<&Arc<Link>>,
    children: &[Arc<Link>],
    abort: &AbortTable,
    operation: &'static str,
) -> Result<Vec<Vec<u8>>> {
    let esize = ctx.dtype.size_in_bytes();
    let nchunks = ctx.total_chunks();
    let mut combined = Vec::with_capacity(ctx.chunks.len());
    let mut offset = 0usize;

    for (ci, &celems) in ctx.chunks.iter().enumerate() {
        let cbytes = celems * esize;
        let own_chunk = &own[offset..offset + cbytes];
        offset += cbytes;

        let mut acc: Option<Vec<u8>> = None;
        for child in children {
            let msg = edge_recv(abort, child, ctx.call, operation, ctx.timeout).await?;
            let payload = expect_partial(msg, child.peer(), ctx, ci as u32, cbytes)?;
            match acc.as_mut() {
                None => acc = Some(payload),
                Some(acc) => op.combine(acc, &payload, celems, ctx.dtype)?,
            }
        }

        // Children first, own value last.
        let chunk = match acc {
            None => own_chunk.to_vec(),
            Some(mut acc) => {
                op.combine(&mut acc, own_chunk, celems, ctx.dtype)?;
                acc
            }
        };

        if let Some(parent) = parent {
            let msg = TreeMessage::Partial {
                call: ctx.call,
                chunk: ci as u32,
                chunks: nchunks,
                dtype: ctx.dtype as u8,
                payload: chunk.clone(),
            };
            edge_send(parent, &msg, operation, ctx.timeout).await?;
        }
        combined.push(chunk);
    }

    Ok(combined)
}

/// Validate one received partial against the call's parameters.
fn expect_partial(
    msg: TreeMessage,
    from: crate::types::NodeId,
    ctx: &CallCtx,
    expect_chunk: u32,
    expect_bytes: usize,
) -> Result<Vec<u8>> {
    match msg {
        TreeMessage::Partial {
            chunk,
            chunks,
            dtype,
            payload,
            ..
        } => {
            if chunk != expect_chunk || chunks != ctx.total_chunks() {
                return Err(ArborError::protocol(format!(
                    "node {from}: partial chunk {chunk}/{chunks}, expected {expect_chunk}/{}",
                    ctx.total_chunks()
                )));
            }
            if dtype != ctx.dtype as u8 {
                let got = crate::types::DataType::from_u8(dtype)
                    .map(|d| d.name())
                    .unwrap_or("unknown");
                return Err(ArborError::protocol(format!(
                    "node {from}: partial dtype {got}, expected {}",
                    ctx.dtype
                )));
            }
            if payload.len() != expect_bytes {
                return Err(ArborError::protocol(format!(
                    "node {from}: partial of {} bytes, expected {expect_bytes}",
                    payload.len()
                )));
            }
            Ok(payload)
        }
        other => Err(ArborError::protocol(format!(
            "node {from}: expected partial, got {}",
            other.kind_name()
        ))),
    }
}
