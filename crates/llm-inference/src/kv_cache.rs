//! Per-attention key/value storage for incremental decoding.
//!
//! A store holds `n_ctx` rows of `width` elements. The first
//! `current_length` rows are valid; new rows are appended in place at offset
//! `current_length` and the length only advances once the step has finished.

use half::f16;
use inferforge_kernels::DType;
use std::borrow::Cow;
use std::rc::Rc;

use crate::device::{Buffer, Device};
use crate::error::{LlmError, Result};

pub struct KvStorage {
    device: Rc<Device>,
    n_ctx: usize,
    width: usize,
    dtype: DType,
    current_length: usize,
    buffer: Option<Buffer>,
}

impl KvStorage {
    pub fn new(device: &Rc<Device>, n_ctx: usize, width: usize, dtype: DType) -> Result<Self> {
        if !matches!(dtype, DType::F32 | DType::F16) {
            return Err(LlmError::KernelUnsupported {
                kernel: device.kernel().name().to_string(),
                what: format!("{:?} kv cache", dtype),
            });
        }
        Ok(Self {
            device: Rc::clone(device),
            n_ctx,
            width,
            dtype,
            current_length: 0,
            buffer: None,
        })
    }

    pub fn current_length(&self) -> usize {
        self.current_length
    }

    pub fn capacity(&self) -> usize {
        self.n_ctx
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn bytes_per_token(&self) -> usize {
        self.width * self.dtype.element_size().unwrap_or(4)
    }

    pub fn is_materialized(&self) -> bool {
        self.buffer.is_some()
    }

    /// Make room for `len` more rows.
    pub fn prepare_data_with_length(&mut self, len: usize) -> Result<()> {
        if self.current_length + len > self.n_ctx {
            return Err(LlmError::Fatal(format!(
                "kv append of {} rows at length {} exceeds n_ctx {}",
                len, self.current_length, self.n_ctx
            )));
        }
        if self.buffer.is_none() {
            self.buffer = Some(self.device.allocate(self.n_ctx * self.bytes_per_token()));
        }
        Ok(())
    }

    fn buffer_mut(&mut self) -> Result<&mut Buffer> {
        self.buffer
            .as_mut()
            .ok_or_else(|| LlmError::Fatal("kv storage used before prepare".to_string()))
    }

    /// Write rows starting at row `offset`.
    pub fn write_rows(&mut self, offset: usize, rows: &[f32]) -> Result<()> {
        let width = self.width;
        if rows.len() % width != 0 || offset * width + rows.len() > self.n_ctx * width {
            return Err(LlmError::Fatal(format!(
                "{} values do not fit as rows of {} at offset {} (n_ctx {})",
                rows.len(),
                width,
                offset,
                self.n_ctx
            )));
        }
        let start = offset * width;
        match self.dtype {
            DType::F16 => {
                let dst = &mut self.buffer_mut()?.typed_mut::<f16>()?[start..start + rows.len()];
                for (d, s) in dst.iter_mut().zip(rows) {
                    *d = f16::from_f32(*s);
                }
            }
            _ => {
                self.buffer_mut()?.typed_mut::<f32>()?[start..start + rows.len()]
                    .copy_from_slice(rows);
            }
        }
        Ok(())
    }

    /// The first `rows` rows as f32.
    pub fn rows(&self, rows: usize) -> Result<Cow<'_, [f32]>> {
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| LlmError::Fatal("kv storage read before prepare".to_string()))?;
        let len = rows * self.width;
        match self.dtype {
            DType::F16 => Ok(Cow::Owned(
                buffer.typed::<f16>()?[..len].iter().map(|v| v.to_f32()).collect(),
            )),
            _ => Ok(Cow::Borrowed(&buffer.typed::<f32>()?[..len])),
        }
    }

    pub fn add_id(&mut self, len: usize) {
        self.current_length += len;
    }

    pub fn reset_id(&mut self) {
        self.current_length = 0;
    }

    /// Give the backing buffer back to the pool once the store is empty.
    pub fn recall_data(&mut self) {
        if self.current_length == 0 {
            if let Some(buffer) = self.buffer.take() {
                self.device.free(buffer);
            }
        }
    }
}
