use crate::types::NodeId;

/// Messages exchanged between arbor nodes.
///
/// `Partial` and `Bcast` carry collective payloads and are routed by call
/// id; everything else is handshake, bootstrap, or control traffic.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum TreeMessage {
    /// First frame on every edge and subscription link: identifies the
    /// dialing node and guards against version skew.
    Hello { protocol_version: u8, node: NodeId },

    /// Bootstrap round 1, node → coordinator.
    Join { protocol_version: u8 },

    /// Bootstrap round 1 response: id assignment in join order.
    /// The node assigned id 0 is the root.
    Assign { node: NodeId, world_size: u32 },

    /// Bootstrap round 2, node → coordinator: this node's edge listener
    /// address, plus the publish address if it is the root.
    Register {
        node: NodeId,
        addr: String,
        pub_addr: Option<String>,
    },

    /// Bootstrap round 2 response: the ordered id list (from which every
    /// node rebuilds the identical tree locally), the peer address table,
    /// and the root's identity and publish address.
    Overlay {
        ids: Vec<NodeId>,
        /// `(node, edge_listener_addr)` for each participant.
        peers: Vec<(NodeId, String)>,
        root: NodeId,
        root_pub_addr: String,
    },

    /// Upward combine phase: one chunk of a subtree's combined value,
    /// child → parent.
    Partial {
        call: u64,
        chunk: u32,
        chunks: u32,
        dtype: u8,
        payload: Vec<u8>,
    },

    /// Downward broadcast phase: one chunk of the final result,
    /// parent → child.
    Bcast {
        call: u64,
        chunk: u32,
        chunks: u32,
        dtype: u8,
        payload: Vec<u8>,
    },

    /// Root-published control message releasing every node still waiting
    /// on an abandoned call.
    Reset { call: u64 },
}

impl TreeMessage {
    /// Call id for messages that demultiplex by call, `None` for
    /// handshake/bootstrap/control traffic.
    pub(crate) fn call(&self) -> Option<u64> {
        match self {
            TreeMessage::Partial { call, .. } | TreeMessage::Bcast { call, .. } => Some(*call),
            _ => None,
        }
    }

    /// Short name for logging.
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            TreeMessage::Hello { .. } => "hello",
            TreeMessage::Join { .. } => "join",
            TreeMessage::Assign { .. } => "assign",
            TreeMessage::Register { .. } => "register",
            TreeMessage::Overlay { .. } => "overlay",
            TreeMessage::Partial { .. } => "partial",
            TreeMessage::Bcast { .. } => "bcast",
            TreeMessage::Reset { .. } => "reset",
        }
    }
}
