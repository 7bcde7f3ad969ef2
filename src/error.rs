use crate::types::{DataType, NodeId};

pub type Result<T> = std::result::Result<T, ArborError>;

#[derive(Debug, thiserror::Error)]
pub enum ArborError {
    /// Invalid setup input: empty or duplicate id list, tree/peer-info
    /// cardinality mismatch, communicator not connected, and similar.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// A required tree edge could not be established. Setup is
    /// all-or-nothing per node: this aborts the node's participation.
    #[error("connection to node {node} failed: {reason}")]
    Connection { node: NodeId, reason: String },

    /// An expected message did not arrive within the configured budget.
    /// Names the stalled edge. Never retried automatically.
    #[error("{operation} timed out after {timeout_ms}ms waiting on node {peer}")]
    CollectiveTimeout {
        operation: &'static str,
        peer: NodeId,
        timeout_ms: u64,
    },

    /// A message arrived for an unrecognized call, out of phase, or with
    /// a malformed chunk; also raised for concurrent collective calls on
    /// one communicator.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// A waiter was released because the call was explicitly reset.
    #[error("collective call {call} abandoned")]
    CallAbandoned { call: u64 },

    /// Publish/abandon attempted from a node that does not own the
    /// publish endpoint.
    #[error("node {node} is not the root")]
    NotRoot { node: NodeId },

    /// Overlay formation did not complete within the formation timeout.
    #[error("overlay formation timed out: {joined}/{expected} nodes joined")]
    FormationTimeout { joined: u32, expected: u32 },

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u8, remote: u8 },

    #[error("unsupported data type: {dtype} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArborError {
    /// Create a `Configuration` error from anything stringy.
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        ArborError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a `Protocol` error from anything stringy.
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        ArborError::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a `Connection` error naming the offending peer.
    pub(crate) fn connection(node: NodeId, reason: impl Into<String>) -> Self {
        ArborError::Connection {
            node,
            reason: reason.into(),
        }
    }
}
