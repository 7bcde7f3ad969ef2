/// Unique identifier for a node in the tree overlay.
///
/// Ordering is significant: the tree shape is a pure function of the
/// ordered id list handed to [`crate::topology::build_tree`], so every
/// node must be given the same list in the same order.
pub type NodeId = u32;

/// Data types supported by arbor for collective operations.
///
/// arbor defines its own type enum so it remains a standalone library
/// usable by any Rust project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    I8 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 5,
    U32 = 6,
    U64 = 7,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DataType::F32),
            1 => Some(DataType::F64),
            2 => Some(DataType::I8),
            3 => Some(DataType::I32),
            4 => Some(DataType::I64),
            5 => Some(DataType::U8),
            6 => Some(DataType::U32),
            7 => Some(DataType::U64),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Built-in reduction operations.
///
/// All four are associative (required for tree combination). User-defined
/// operations go through [`crate::op::FnOp`] or [`crate::op::OpRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across nodes.
    Sum,
    /// Element-wise product across nodes.
    Prod,
    /// Element-wise minimum across nodes.
    Min,
    /// Element-wise maximum across nodes.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Current protocol version, carried in every frame header and in the
/// edge handshake.
pub const PROTOCOL_VERSION: u8 = 1;
