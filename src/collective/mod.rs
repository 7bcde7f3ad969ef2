//! The two-phase tree collective engine.
//!
//! `reduce` runs the upward combine phase only; `allreduce` follows it
//! with the downward broadcast phase. Both phases walk the payload
//! chunk-by-chunk, so later chunks of a large buffer pipeline through the
//! tree while earlier ones are still in flight.

pub(crate) mod broadcast;
pub(crate) mod helpers;
pub(crate) mod reduce;

pub(crate) use broadcast::broadcast_down;
pub(crate) use helpers::{chunk_counts, AbortTable};
pub(crate) use reduce::combine_up;

use std::time::Duration;

use crate::types::DataType;

/// Shared parameters of one collective call, fixed before either phase
/// starts.
pub(crate) struct CallCtx {
    pub call: u64,
    pub dtype: DataType,
    /// Element count of each chunk, in transmission order. Sums to the
    /// call's total element count.
    pub chunks: Vec<usize>,
    pub timeout: Duration,
}

impl CallCtx {
    pub(crate) fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub(crate) fn total_bytes(&self) -> usize {
        let per = self.dtype.size_in_bytes();
        self.chunks.iter().map(|c| c * per).sum()
    }
}
