//! Binary-tree collective communication over TCP.
//!
//! Every participant derives the same binary tree from an ordered id
//! list, connects to its parent and children, and then runs `reduce` and
//! `allreduce` over those edges: partial results combine up toward the
//! root in a canonical order, and `allreduce` fans the final value back
//! down. Payloads are combined element-wise with built-in or user-defined
//! associative ops, either whole (`flat = true`) or pipelined in
//! fixed-size chunks.
//!
//! ```no_run
//! use arbor::{bootstrap_local, ArborConfig, ReduceOp};
//!
//! # async fn demo() -> arbor::Result<()> {
//! let comms = bootstrap_local(4, ArborConfig::default()).await?;
//! let mut totals = Vec::new();
//! for comm in &comms {
//!     totals.push(async move { comm.allreduce(&ReduceOp::Sum, &[comm.id() as i64], true).await });
//! }
//! for total in futures::future::try_join_all(totals).await? {
//!     assert_eq!(total, vec![6]);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
mod collective;
pub mod comm;
pub mod config;
pub mod error;
pub mod op;
pub mod protocol;
pub mod topology;
mod transport;
pub mod types;

pub use bootstrap::{bootstrap_local, join, Coordinator};
pub use comm::{Communicator, PeerInfo};
pub use config::ArborConfig;
pub use error::{ArborError, Result};
pub use op::{Element, ElementOp, FnOp, OpRegistry};
pub use protocol::TreeMessage;
pub use topology::{build_tree, Tree, TreeNode};
pub use types::{DataType, NodeId, ReduceOp};
