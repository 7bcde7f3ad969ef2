//! Downward broadcast phase of `allreduce`.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::collective::helpers::{edge_recv, edge_send, AbortTable};
use crate::collective::CallCtx;
use crate::error::{ArborError, Result};
use crate::protocol::TreeMessage;
use crate::transport::Link;

/// Fan the final result back down the tree, chunk by chunk.
///
/// The root seeds the phase from its combined chunks; every other node
/// receives each chunk from its parent and forwards it to both children
/// before waiting for the next, so each hop fans out at most two copies.
/// Returns the reassembled result buffer.
pub(crate) async fn broadcast_down(
    ctx: &CallCtx,
    combined: Vec<Vec<u8>>,
    parent: Option<&Arc<Link>>,
    children: &[Arc<Link>],
    abort: &AbortTable,
) -> Result<Vec<u8>> {
    let esize = ctx.dtype.size_in_bytes();
    let nchunks = ctx.total_chunks();
    let mut result = Vec::with_capacity(ctx.total_bytes());

    match parent {
        None => {
            for (ci, chunk) in combined.into_iter().enumerate() {
                let msg = TreeMessage::Bcast {
                    call: ctx.call,
                    chunk: ci as u32,
                    chunks: nchunks,
                    dtype: ctx.dtype as u8,
                    payload: chunk.clone(),
                };
                try_join_all(
                    children
                        .iter()
                        .map(|c| edge_send(c, &msg, "allreduce", ctx.timeout)),
                )
                .await?;
                result.extend_from_slice(&chunk);
            }
        }
        Some(parent) => {
            for (ci, &celems) in ctx.chunks.iter().enumerate() {
                let msg = edge_recv(abort, parent, ctx.call, "allreduce", ctx.timeout).await?;
                let payload = expect_bcast(msg, parent.peer(), ctx, ci as u32, celems * esize)?;

                let fwd = TreeMessage::Bcast {
                    call: ctx.call,
                    chunk: ci as u32,
                    chunks: nchunks,
                    dtype: ctx.dtype as u8,
                    payload: payload.clone(),
                };
                try_join_all(
                    children
                        .iter()
                        .map(|c| edge_send(c, &fwd, "allreduce", ctx.timeout)),
                )
                .await?;
                result.extend_from_slice(&payload);
            }
        }
    }

    Ok(result)
}

fn expect_bcast(
    msg: TreeMessage,
    from: crate::types::NodeId,
    ctx: &CallCtx,
    expect_chunk: u32,
    expect_bytes: usize,
) -> Result<Vec<u8>> {
    match msg {
        TreeMessage::Bcast {
            chunk,
            chunks,
            dtype,
            payload,
            ..
        } => {
            if chunk != expect_chunk || chunks != ctx.total_chunks() {
                return Err(ArborError::protocol(format!(
                    "node {from}: bcast chunk {chunk}/{chunks}, expected {expect_chunk}/{}",
                    ctx.total_chunks()
                )));
            }
            if dtype != ctx.dtype as u8 {
                let got = crate::types::DataType::from_u8(dtype)
                    .map(|d| d.name())
                    .unwrap_or("unknown");
                return Err(ArborError::protocol(format!(
                    "node {from}: bcast dtype {got}, expected {}",
                    ctx.dtype
                )));
            }
            if payload.len() != expect_bytes {
                return Err(ArborError::protocol(format!(
                    "node {from}: bcast of {} bytes, expected {expect_bytes}",
                    payload.len()
                )));
            }
            Ok(payload)
        }
        other => Err(ArborError::protocol(format!(
            "node {from}: expected bcast, got {}",
            other.kind_name()
        ))),
    }
}
