//! Kernel configuration structures.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Elements per quantization block along the last dimension.
pub const QK: usize = 32;

/// Rows grouped into one tile by the packed INT4 layout.
pub const PACK_SIZE: usize = 8;

/// Bytes of one `Int8` block: f16 scale + 32 x i8.
pub const INT8_BLOCK_BYTES: usize = 2 + QK;

/// Bytes of one `Int4` block: f16 scale + 16 bytes of nibbles.
pub const INT4_BLOCK_BYTES: usize = 2 + QK / 2;

/// Bytes of one packed tile: `PACK_SIZE` scales followed by `PACK_SIZE` nibble payloads.
pub const INT4_PACKED_TILE_BYTES: usize = PACK_SIZE * INT4_BLOCK_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F16,
    Int8,
    Int4,
    /// INT4 reordered into `PACK_SIZE`-row tiles. Stored shape is `{N / PACK_SIZE, K}`.
    Int4Packed,
    /// Token ids.
    Int32,
}

impl DType {
    /// Byte size of a single element, `None` for block-quantized types.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DType::F32 | DType::Int32 => Some(4),
            DType::F16 => Some(2),
            DType::Int8 | DType::Int4 | DType::Int4Packed => None,
        }
    }

    pub fn is_quantized(&self) -> bool {
        self.element_size().is_none()
    }

    /// Exact payload size of a tensor with this dtype and `shape`.
    pub fn storage_bytes(&self, shape: &[usize]) -> KernelResult<usize> {
        let overflow = || {
            KernelError::ShapeMismatch(format!("{:?} storage for shape {:?} overflows usize", self, shape))
        };
        let count = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(overflow)?;
        if let Some(size) = self.element_size() {
            return count.checked_mul(size).ok_or_else(overflow);
        }

        let cols = shape.last().copied().unwrap_or(0);
        if cols % QK != 0 {
            return Err(KernelError::ShapeMismatch(format!(
                "{:?} requires the last dim to be a multiple of {}, got shape {:?}",
                self, QK, shape
            )));
        }
        let blocks = count / QK;
        let block_bytes = match self {
            DType::Int8 => INT8_BLOCK_BYTES,
            DType::Int4 => INT4_BLOCK_BYTES,
            // every stored element of a packed tensor stands for PACK_SIZE logical ones
            DType::Int4Packed => INT4_PACKED_TILE_BYTES,
            _ => unreachable!("element-sized dtypes handled above"),
        };
        blocks.checked_mul(block_bytes).ok_or_else(overflow)
    }
}

/// Optimizations a kernel may advertise through [`crate::Kernel::supported_optimization`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelOptMethod {
    /// Reorder INT4 matmul weights into `PACK_SIZE`-row tiles once at load time.
    MatmulInt4Reorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemMode {
    Add,
    Mul,
    Silu,
    Gelu,
    Relu,
}

impl ElemMode {
    pub fn is_binary(&self) -> bool {
        matches!(self, ElemMode::Add | ElemMode::Mul)
    }
}

/// Pairing of rotary dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RotMode {
    /// Adjacent pairs `(2i, 2i + 1)`.
    #[default]
    Mode0,
    /// Halves `(i, i + n_rot / 2)`, NeoX style.
    Neox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulProblem {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub weight: DType,
}

impl MatmulProblem {
    pub fn new(m: usize, n: usize, k: usize, weight: DType) -> Self {
        Self { m, n, k, weight }
    }

    pub fn flops(&self) -> f64 {
        2.0 * self.m as f64 * self.n as f64 * self.k as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_bytes_per_dtype() {
        assert_eq!(DType::F32.storage_bytes(&[4, 64]).unwrap(), 1024);
        assert_eq!(DType::F16.storage_bytes(&[4, 64]).unwrap(), 512);
        assert_eq!(DType::Int8.storage_bytes(&[4, 64]).unwrap(), 4 * 2 * 34);
        assert_eq!(DType::Int4.storage_bytes(&[4, 64]).unwrap(), 4 * 2 * 18);
        // {64, 64} packed is stored as {8, 64}
        assert_eq!(
            DType::Int4Packed.storage_bytes(&[8, 64]).unwrap(),
            DType::Int4.storage_bytes(&[64, 64]).unwrap()
        );
    }

    #[test]
    fn quantized_storage_rejects_ragged_rows() {
        assert!(DType::Int4.storage_bytes(&[4, 48]).is_err());
        assert!(DType::Int8.storage_bytes(&[20]).is_err());
    }

    #[test]
    fn storage_overflow_is_an_error() {
        let huge = [65536, 65536, 65536, 65536];
        assert!(matches!(DType::F32.storage_bytes(&huge), Err(KernelError::ShapeMismatch(_))));
        assert!(DType::F32.storage_bytes(&[usize::MAX / 2, 1]).is_err());
        assert!(DType::Int4.storage_bytes(&[1 << 30, 1 << 30, 1 << 30, 32]).is_err());
    }
}
