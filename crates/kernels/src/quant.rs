//! Block quantization formats and the INT4 tile reorder.
//!
//! `Int8` block (34 bytes): f16 scale, 32 x i8. Value = q * d.
//! `Int4` block (18 bytes): f16 scale, 16 bytes where byte `j` holds element `j`
//! in the low nibble and element `j + 16` in the high nibble. Value = (q - 8) * d.
//! `Int4Packed` tile (144 bytes): the 8 scales of 8 consecutive rows at the same
//! k-block, then the 8 nibble payloads in row order.

use crate::config::{
    DType, INT4_BLOCK_BYTES, INT4_PACKED_TILE_BYTES, INT8_BLOCK_BYTES, PACK_SIZE, QK,
};
use crate::error::{KernelError, KernelResult};
use half::f16;

#[inline]
fn read_scale(bytes: &[u8]) -> f32 {
    f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
}

fn check_blocks(data: &[f32]) -> KernelResult<usize> {
    if data.len() % QK != 0 {
        return Err(KernelError::ShapeMismatch(format!(
            "quantization requires a multiple of {} elements, got {}",
            QK,
            data.len()
        )));
    }
    Ok(data.len() / QK)
}

pub fn quantize_int8(data: &[f32]) -> KernelResult<Vec<u8>> {
    let n_blocks = check_blocks(data)?;
    let mut output = vec![0u8; n_blocks * INT8_BLOCK_BYTES];

    for (block, dst) in data
        .chunks_exact(QK)
        .zip(output.chunks_exact_mut(INT8_BLOCK_BYTES))
    {
        let amax = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        let scale = amax / 127.0;
        let inv_scale = if scale == 0.0 { 0.0 } else { 1.0 / scale };

        dst[..2].copy_from_slice(&f16::from_f32(scale).to_le_bytes());
        for (q, &v) in dst[2..].iter_mut().zip(block) {
            *q = (v * inv_scale).round().clamp(-128.0, 127.0) as i8 as u8;
        }
    }

    Ok(output)
}

pub fn quantize_int4(data: &[f32]) -> KernelResult<Vec<u8>> {
    let n_blocks = check_blocks(data)?;
    let mut output = vec![0u8; n_blocks * INT4_BLOCK_BYTES];

    for (block, dst) in data
        .chunks_exact(QK)
        .zip(output.chunks_exact_mut(INT4_BLOCK_BYTES))
    {
        // signed extreme maps to -8 so the full nibble range is used
        let extreme = block
            .iter()
            .fold(0.0f32, |acc, &v| if v.abs() > acc.abs() { v } else { acc });
        let scale = extreme / -8.0;
        let inv_scale = if scale == 0.0 { 0.0 } else { 1.0 / scale };

        dst[..2].copy_from_slice(&f16::from_f32(scale).to_le_bytes());
        for j in 0..QK / 2 {
            let lo = ((block[j] * inv_scale + 8.5) as i32).clamp(0, 15) as u8;
            let hi = ((block[j + QK / 2] * inv_scale + 8.5) as i32).clamp(0, 15) as u8;
            dst[2 + j] = lo | (hi << 4);
        }
    }

    Ok(output)
}

pub fn dequantize_int8_block(block: &[u8], out: &mut [f32]) {
    let scale = read_scale(block);
    for (o, &q) in out.iter_mut().zip(&block[2..INT8_BLOCK_BYTES]) {
        *o = q as i8 as f32 * scale;
    }
}

pub fn dequantize_int4_block(block: &[u8], out: &mut [f32]) {
    let scale = read_scale(block);
    let (lo_half, hi_half) = out.split_at_mut(QK / 2);
    for j in 0..QK / 2 {
        let byte = block[2 + j];
        lo_half[j] = ((byte & 0x0F) as i32 - 8) as f32 * scale;
        hi_half[j] = ((byte >> 4) as i32 - 8) as f32 * scale;
    }
}

/// Dequantize a whole buffer of `dtype` data into `out`.
pub fn dequantize(dtype: DType, raw: &[u8], out: &mut [f32]) -> KernelResult<()> {
    let expected = dtype.storage_bytes(&[out.len()])?;
    if raw.len() != expected {
        return Err(KernelError::ShapeMismatch(format!(
            "{:?} payload of {} bytes cannot hold {} elements",
            dtype,
            raw.len(),
            out.len()
        )));
    }
    match dtype {
        DType::F32 => {
            for (o, chunk) in out.iter_mut().zip(raw.chunks_exact(4)) {
                *o = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        DType::F16 => {
            for (o, chunk) in out.iter_mut().zip(raw.chunks_exact(2)) {
                *o = f16::from_le_bytes([chunk[0], chunk[1]]).to_f32();
            }
        }
        DType::Int8 => {
            for (block, o) in raw.chunks_exact(INT8_BLOCK_BYTES).zip(out.chunks_exact_mut(QK)) {
                dequantize_int8_block(block, o);
            }
        }
        DType::Int4 => {
            for (block, o) in raw.chunks_exact(INT4_BLOCK_BYTES).zip(out.chunks_exact_mut(QK)) {
                dequantize_int4_block(block, o);
            }
        }
        DType::Int4Packed | DType::Int32 => {
            return Err(KernelError::Unsupported {
                kernel: "dequantize",
                what: format!("{:?} data", dtype),
            })
        }
    }
    Ok(())
}

#[inline]
pub fn dot_int8_block(block: &[u8], x: &[f32]) -> f32 {
    let scale = read_scale(block);
    let mut sum = 0.0f32;
    for (&q, &v) in block[2..INT8_BLOCK_BYTES].iter().zip(x) {
        sum += (q as i8) as f32 * v;
    }
    sum * scale
}

#[inline]
pub fn dot_int4_nibbles(nibbles: &[u8], x: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for j in 0..QK / 2 {
        let byte = nibbles[j];
        sum += ((byte & 0x0F) as i32 - 8) as f32 * x[j];
        sum += ((byte >> 4) as i32 - 8) as f32 * x[j + QK / 2];
    }
    sum
}

#[inline]
pub fn dot_int4_block(block: &[u8], x: &[f32]) -> f32 {
    read_scale(block) * dot_int4_nibbles(&block[2..INT4_BLOCK_BYTES], x)
}

/// Accumulate the dot products of one packed tile (8 rows, one k-block) with `x`.
#[inline]
pub fn dot_int4_tile(tile: &[u8], x: &[f32], acc: &mut [f32; PACK_SIZE]) {
    let payload = &tile[2 * PACK_SIZE..INT4_PACKED_TILE_BYTES];
    for (r, slot) in acc.iter_mut().enumerate() {
        let scale = read_scale(&tile[2 * r..]);
        *slot += scale * dot_int4_nibbles(&payload[r * QK / 2..(r + 1) * QK / 2], x);
    }
}

/// Reorder an `Int4` weight of shape `{rows, cols}` into `PACK_SIZE`-row tiles.
pub fn pack_int4(src: &[u8], rows: usize, cols: usize) -> KernelResult<Vec<u8>> {
    if rows % PACK_SIZE != 0 {
        return Err(KernelError::ShapeMismatch(format!(
            "int4 reorder needs rows divisible by {}, got {}",
            PACK_SIZE, rows
        )));
    }
    let expected = DType::Int4.storage_bytes(&[rows, cols])?;
    if src.len() != expected {
        return Err(KernelError::ShapeMismatch(format!(
            "int4 weight {}x{} expects {} bytes, got {}",
            rows,
            cols,
            expected,
            src.len()
        )));
    }

    let blocks_per_row = cols / QK;
    let mut dst = vec![0u8; src.len()];
    for group in 0..rows / PACK_SIZE {
        for b in 0..blocks_per_row {
            let tile_offset = (group * blocks_per_row + b) * INT4_PACKED_TILE_BYTES;
            let tile = &mut dst[tile_offset..tile_offset + INT4_PACKED_TILE_BYTES];
            for r in 0..PACK_SIZE {
                let row = group * PACK_SIZE + r;
                let block_offset = (row * blocks_per_row + b) * INT4_BLOCK_BYTES;
                let block = &src[block_offset..block_offset + INT4_BLOCK_BYTES];
                tile[2 * r..2 * r + 2].copy_from_slice(&block[..2]);
                let payload = 2 * PACK_SIZE + r * QK / 2;
                tile[payload..payload + QK / 2].copy_from_slice(&block[2..]);
            }
        }
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i * 7) % 23) as f32 * 0.1 - 1.1).collect()
    }

    #[test]
    fn int8_dequantize_is_close() {
        let data = ramp(64);
        let raw = quantize_int8(&data).unwrap();
        let mut out = vec![0.0; 64];
        dequantize(DType::Int8, &raw, &mut out).unwrap();
        for (a, b) in data.iter().zip(&out) {
            assert_abs_diff_eq!(a, b, epsilon = 0.01);
        }
    }

    #[test]
    fn int4_dot_matches_dequantized_dot() {
        let data = ramp(32);
        let raw = quantize_int4(&data).unwrap();
        let mut deq = vec![0.0; 32];
        dequantize(DType::Int4, &raw, &mut deq).unwrap();
        let x: Vec<f32> = (0..32).map(|i| i as f32 * 0.05).collect();

        let expected: f32 = deq.iter().zip(&x).map(|(a, b)| a * b).sum();
        assert_abs_diff_eq!(dot_int4_block(&raw, &x), expected, epsilon = 1e-4);
        // quantization error stays within one step of the scale
        for (a, b) in data.iter().zip(&deq) {
            assert!((a - b).abs() <= 1.1 / 8.0 + 1e-3);
        }
    }

    #[test]
    fn packed_tile_matches_row_dots() {
        let rows = 8;
        let cols = 64;
        let data = ramp(rows * cols);
        let raw = quantize_int4(&data).unwrap();
        let packed = pack_int4(&raw, rows, cols).unwrap();
        let x: Vec<f32> = (0..cols).map(|i| (i as f32).sin()).collect();

        let mut acc = [0.0f32; PACK_SIZE];
        for b in 0..cols / QK {
            let tile = &packed[b * INT4_PACKED_TILE_BYTES..(b + 1) * INT4_PACKED_TILE_BYTES];
            dot_int4_tile(tile, &x[b * QK..(b + 1) * QK], &mut acc);
        }

        for (r, value) in acc.iter().enumerate() {
            let row = &raw[r * 2 * INT4_BLOCK_BYTES..(r + 1) * 2 * INT4_BLOCK_BYTES];
            let expected = dot_int4_block(&row[..INT4_BLOCK_BYTES], &x[..QK])
                + dot_int4_block(&row[INT4_BLOCK_BYTES..], &x[QK..]);
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn pack_rejects_ragged_rows() {
        let raw = quantize_int4(&ramp(4 * 32)).unwrap();
        assert!(pack_int4(&raw, 4, 32).is_err());
    }
}
