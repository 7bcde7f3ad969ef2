//! Reduction operations and element encoding.
//!
//! The engine combines values element-wise on little-endian byte buffers.
//! Built-in ops ([`ReduceOp`]) cover sum/prod/min/max; arbitrary
//! associative functions plug in through [`FnOp`] or a per-node
//! [`OpRegistry`] of named ops. Associativity is required for tree
//! combination; commutativity is not — the engine fixes a canonical
//! combination order, so non-commutative ops still give reproducible
//! results.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{ArborError, Result};
use crate::types::{DataType, ReduceOp};

/// A binary, associative combination step over typed byte buffers.
///
/// `combine` must apply `acc[i] = f(acc[i], src[i])` for each of the
/// `count` elements, where `f` is associative. Every node in a collective
/// call must use the same op.
pub trait ElementOp: Send + Sync {
    fn combine(&self, acc: &mut [u8], src: &[u8], count: usize, dtype: DataType) -> Result<()>;
}

/// Fixed-width element types that can cross the wire.
///
/// Sealed: implemented for the numeric types listed in [`DataType`].
pub trait Element: sealed::Sealed + Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const DTYPE: DataType = $dtype;

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(
                        bytes.try_into().expect("slice length matches type size"),
                    )
                }

                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element!(
    f32 => DataType::F32,
    f64 => DataType::F64,
    i8 => DataType::I8,
    i32 => DataType::I32,
    i64 => DataType::I64,
    u8 => DataType::U8,
    u32 => DataType::U32,
    u64 => DataType::U64,
);

/// Encode a typed slice as little-endian bytes.
pub(crate) fn encode_slice<T: Element>(values: &[T]) -> Vec<u8> {
    let size = T::DTYPE.size_in_bytes();
    let mut buf = vec![0u8; values.len() * size];
    for (i, v) in values.iter().enumerate() {
        v.write_le(&mut buf[i * size..(i + 1) * size]);
    }
    buf
}

/// Decode little-endian bytes back into a typed vector.
pub(crate) fn decode_slice<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    let size = T::DTYPE.size_in_bytes();
    if bytes.len() % size != 0 {
        return Err(ArborError::BufferSizeMismatch {
            expected: (bytes.len() / size + 1) * size,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(size)
        .map(|c| T::read_le(c))
        .collect())
}

/// Trait for element types supporting the four built-in reductions.
trait Reducible: Element {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Element-wise built-in reduce on byte slices interpreted as `dtype`.
///
/// `dst` and `src` must both contain exactly `count * dtype.size_in_bytes()`
/// bytes.
pub(crate) fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    check_len(dst.len(), count, dtype)?;
    check_len(src.len(), count, dtype)?;
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, count, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, count, op),
        DataType::I8 => reduce_slice_typed::<i8>(dst, src, count, op),
        DataType::I32 => reduce_slice_typed::<i32>(dst, src, count, op),
        DataType::I64 => reduce_slice_typed::<i64>(dst, src, count, op),
        DataType::U8 => reduce_slice_typed::<u8>(dst, src, count, op),
        DataType::U32 => reduce_slice_typed::<u32>(dst, src, count, op),
        DataType::U64 => reduce_slice_typed::<u64>(dst, src, count, op),
    }
    Ok(())
}

fn check_len(actual: usize, count: usize, dtype: DataType) -> Result<()> {
    let expected = count * dtype.size_in_bytes();
    if actual != expected {
        return Err(ArborError::BufferSizeMismatch { expected, actual });
    }
    Ok(())
}

fn reduce_slice_typed<T: Reducible>(dst: &mut [u8], src: &[u8], count: usize, op: ReduceOp) {
    let size = T::DTYPE.size_in_bytes();
    for i in 0..count {
        let off = i * size;
        let a = T::read_le(&dst[off..off + size]);
        let b = T::read_le(&src[off..off + size]);
        T::reduce(a, b, op).write_le(&mut dst[off..off + size]);
    }
}

impl ElementOp for ReduceOp {
    fn combine(&self, acc: &mut [u8], src: &[u8], count: usize, dtype: DataType) -> Result<()> {
        reduce_slice(acc, src, count, dtype, *self)
    }
}

/// Adapter turning a plain `Fn(T, T) -> T` closure into an [`ElementOp`]
/// for one element type.
///
/// The function must be associative; it is applied as
/// `acc[i] = f(acc[i], src[i])`, so under the engine's canonical order the
/// left argument always holds the earlier-position operand.
pub struct FnOp<T, F> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> FnOp<T, F>
where
    T: Element,
    F: Fn(T, T) -> T + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<T, F> ElementOp for FnOp<T, F>
where
    T: Element,
    F: Fn(T, T) -> T + Send + Sync,
{
    fn combine(&self, acc: &mut [u8], src: &[u8], count: usize, dtype: DataType) -> Result<()> {
        if dtype != T::DTYPE {
            return Err(ArborError::UnsupportedDType {
                dtype,
                op: "user-defined combine",
            });
        }
        check_len(acc.len(), count, dtype)?;
        check_len(src.len(), count, dtype)?;
        let size = T::DTYPE.size_in_bytes();
        for i in 0..count {
            let off = i * size;
            let a = T::read_le(&acc[off..off + size]);
            let b = T::read_le(&src[off..off + size]);
            (self.f)(a, b).write_le(&mut acc[off..off + size]);
        }
        Ok(())
    }
}

/// Per-node table of named reduction ops.
///
/// Instead of shipping code between processes, every node registers the
/// same op under the same name locally and collective callers resolve it
/// by identifier. The four built-ins are pre-registered.
pub struct OpRegistry {
    ops: HashMap<&'static str, Arc<dyn ElementOp>>,
}

impl OpRegistry {
    /// Registry with `sum`, `prod`, `min`, `max` pre-registered.
    pub fn new() -> Self {
        let mut ops: HashMap<&'static str, Arc<dyn ElementOp>> = HashMap::new();
        ops.insert("sum", Arc::new(ReduceOp::Sum));
        ops.insert("prod", Arc::new(ReduceOp::Prod));
        ops.insert("min", Arc::new(ReduceOp::Min));
        ops.insert("max", Arc::new(ReduceOp::Max));
        Self { ops }
    }

    /// Register an op under a name. Overwrites any previous registration.
    pub fn register(&mut self, name: &'static str, op: Arc<dyn ElementOp>) {
        self.ops.insert(name, op);
    }

    /// Look up an op by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ElementOp>> {
        self.ops.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}
