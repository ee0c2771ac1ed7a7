//! Tensors with lazily materialized, pool-backed storage.
//!
//! Each connection to a consuming op bumps `total_users`. The producer resets
//! `curr_users` and materializes the storage before it runs; every consumer
//! decrements the count when it is done, and the last one hands the storage
//! back to the device pool. Weights and shared tensors keep their storage.

use half::f16;
use inferforge_kernels::DType;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use crate::device::{Buffer, Device};
use crate::error::{LlmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    /// Intermediate result, released once every consumer has run.
    Activation,
    /// Token ids fed by the graph.
    Input,
    /// Materialized on every run and never released.
    Shared,
    /// Bound at load time. `float_only` weights (norm gains, biases) must be
    /// stored as F32 or F16.
    Weight { float_only: bool },
}

pub type TensorRef = Rc<Tensor>;

pub struct Tensor {
    name: String,
    device: Rc<Device>,
    shape: RefCell<Vec<usize>>,
    dtype: Cell<DType>,
    kind: Cell<TensorKind>,
    storage: RefCell<Option<Buffer>>,
    total_users: Cell<usize>,
    curr_users: Cell<usize>,
    preprocess_count: Cell<usize>,
}

impl Tensor {
    fn with_kind(
        device: &Rc<Device>,
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
        kind: TensorKind,
    ) -> TensorRef {
        Rc::new(Self {
            name: name.into(),
            device: Rc::clone(device),
            shape: RefCell::new(shape),
            dtype: Cell::new(dtype),
            kind: Cell::new(kind),
            storage: RefCell::new(None),
            total_users: Cell::new(0),
            curr_users: Cell::new(0),
            preprocess_count: Cell::new(0),
        })
    }

    pub fn activation(device: &Rc<Device>, name: impl Into<String>, dtype: DType) -> TensorRef {
        Self::with_kind(device, name, Vec::new(), dtype, TensorKind::Activation)
    }

    pub fn input(device: &Rc<Device>, name: impl Into<String>) -> TensorRef {
        Self::with_kind(device, name, Vec::new(), DType::Int32, TensorKind::Input)
    }

    pub fn weight(
        device: &Rc<Device>,
        name: impl Into<String>,
        shape: Vec<usize>,
        float_only: bool,
    ) -> TensorRef {
        Self::with_kind(device, name, shape, DType::F32, TensorKind::Weight { float_only })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Rc<Device> {
        &self.device
    }

    pub fn shape(&self) -> Vec<usize> {
        self.shape.borrow().clone()
    }

    pub fn set_shape(&self, shape: Vec<usize>) {
        *self.shape.borrow_mut() = shape;
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape.borrow().get(axis).copied().unwrap_or(0)
    }

    pub fn nr_elems(&self) -> usize {
        self.shape.borrow().iter().product()
    }

    pub fn dtype(&self) -> DType {
        self.dtype.get()
    }

    pub fn set_dtype(&self, dtype: DType) {
        self.dtype.set(dtype);
    }

    pub fn kind(&self) -> TensorKind {
        self.kind.get()
    }

    pub fn mark_shared(&self) {
        self.kind.set(TensorKind::Shared);
    }

    pub fn is_weight(&self) -> bool {
        matches!(self.kind(), TensorKind::Weight { .. })
    }

    pub fn is_shared(&self) -> bool {
        self.kind() == TensorKind::Shared
    }

    pub fn length_in_bytes(&self) -> Result<usize> {
        Ok(self.dtype().storage_bytes(&self.shape.borrow())?)
    }

    pub fn add_user(&self) {
        self.total_users.set(self.total_users.get() + 1);
    }

    pub fn total_users(&self) -> usize {
        self.total_users.get()
    }

    pub fn curr_users(&self) -> usize {
        self.curr_users.get()
    }

    pub fn resume_user_count(&self) {
        self.curr_users.set(self.total_users.get());
    }

    /// Called by each consumer once it has read the tensor.
    pub fn decrease_curr_user_count(&self) -> Result<()> {
        match self.kind() {
            TensorKind::Weight { .. } | TensorKind::Shared => Ok(()),
            TensorKind::Activation | TensorKind::Input => {
                let curr = self.curr_users.get();
                if curr == 0 {
                    return Err(LlmError::Fatal(format!(
                        "user count underflow on tensor `{}`",
                        self.name
                    )));
                }
                self.curr_users.set(curr - 1);
                if curr == 1 {
                    self.recall_data();
                }
                Ok(())
            }
        }
    }

    /// Materialize storage for the current shape and dtype. Idempotent.
    pub fn prepare_data(&self) -> Result<()> {
        let len = self.length_in_bytes()?;
        let mut storage = self.storage.borrow_mut();
        let ready = matches!(storage.as_ref(), Some(buf) if buf.len() == len);
        if !ready {
            if let Some(old) = storage.take() {
                self.device.free(old);
            }
            *storage = Some(self.device.allocate(len));
        }
        Ok(())
    }

    /// Return the storage to the device pool.
    pub fn recall_data(&self) {
        if let Some(buf) = self.storage.borrow_mut().take() {
            self.device.free(buf);
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.storage.borrow().is_some()
    }

    /// Attach loaded weight data. The byte length must match `dtype` and `shape`.
    pub fn bind(&self, dtype: DType, shape: Vec<usize>, bytes: &[u8]) -> Result<()> {
        let expected = dtype.storage_bytes(&shape)?;
        if expected != bytes.len() {
            return Err(LlmError::Load(format!(
                "tensor `{}` {:?} {:?} needs {} bytes, got {}",
                self.name,
                dtype,
                shape,
                expected,
                bytes.len()
            )));
        }
        self.dtype.set(dtype);
        *self.shape.borrow_mut() = shape;
        *self.storage.borrow_mut() = Some(Buffer::from_bytes(bytes));
        Ok(())
    }

    pub fn mark_preprocessed(&self) {
        self.preprocess_count.set(self.preprocess_count.get() + 1);
    }

    /// How many times a load-time weight transform was applied.
    pub fn preprocess_count(&self) -> usize {
        self.preprocess_count.get()
    }

    fn unmaterialized(&self) -> LlmError {
        LlmError::Fatal(format!("tensor `{}` read before prepare_data", self.name))
    }

    fn expect_dtype(&self, dtype: DType) -> Result<()> {
        if self.dtype() != dtype {
            return Err(LlmError::Fatal(format!(
                "tensor `{}` is {:?}, viewed as {:?}",
                self.name,
                self.dtype(),
                dtype
            )));
        }
        Ok(())
    }

    pub fn bytes(&self) -> Result<Ref<'_, [u8]>> {
        Ref::filter_map(self.storage.borrow(), |s| s.as_ref().map(Buffer::bytes))
            .map_err(|_| self.unmaterialized())
    }

    fn typed<T: bytemuck::Pod>(&self, dtype: DType) -> Result<Ref<'_, [T]>> {
        self.expect_dtype(dtype)?;
        let bytes = self.bytes()?;
        bytemuck::try_cast_slice::<u8, T>(&bytes)
            .map_err(|err| LlmError::Fatal(format!("tensor `{}`: {}", self.name, err)))?;
        Ok(Ref::map(bytes, |b| bytemuck::cast_slice(b)))
    }

    fn typed_mut<T: bytemuck::Pod>(&self, dtype: DType) -> Result<RefMut<'_, [T]>> {
        self.expect_dtype(dtype)?;
        let mut storage = RefMut::filter_map(self.storage.borrow_mut(), |s| s.as_mut())
            .map_err(|_| self.unmaterialized())?;
        storage.typed_mut::<T>()?;
        Ok(RefMut::map(storage, |b| bytemuck::cast_slice_mut(b.bytes_mut())))
    }

    pub fn f32(&self) -> Result<Ref<'_, [f32]>> {
        self.typed(DType::F32)
    }

    pub fn f32_mut(&self) -> Result<RefMut<'_, [f32]>> {
        self.typed_mut(DType::F32)
    }

    pub fn f16(&self) -> Result<Ref<'_, [f16]>> {
        self.typed(DType::F16)
    }

    pub fn i32(&self) -> Result<Ref<'_, [i32]>> {
        self.typed(DType::Int32)
    }

    pub fn i32_mut(&self) -> Result<RefMut<'_, [i32]>> {
        self.typed_mut(DType::Int32)
    }

    /// Read float data as f32, converting F16 storage on the fly.
    pub fn read_f32(&self) -> Result<F32Data<'_>> {
        match self.dtype() {
            DType::F32 => Ok(F32Data::Direct(self.f32()?)),
            DType::F16 => Ok(F32Data::Staged(self.f16()?.iter().map(|v| v.to_f32()).collect())),
            other => Err(LlmError::Fatal(format!(
                "tensor `{}` holds {:?}, not float data",
                self.name, other
            ))),
        }
    }

    /// Writable f32 view. F16 tensors get a staging vector that is converted
    /// back on [`F32DataMut::commit`].
    pub fn write_f32(&self) -> Result<F32DataMut<'_>> {
        match self.dtype() {
            DType::F32 => Ok(F32DataMut::Direct(self.f32_mut()?)),
            DType::F16 => {
                if !self.is_materialized() {
                    return Err(self.unmaterialized());
                }
                Ok(F32DataMut::Staged(vec![0.0; self.nr_elems()], self))
            }
            other => Err(LlmError::Fatal(format!(
                "tensor `{}` holds {:?}, not float data",
                self.name, other
            ))),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("shape", &self.shape.borrow())
            .field("dtype", &self.dtype())
            .field("kind", &self.kind())
            .field("users", &(self.curr_users(), self.total_users()))
            .finish()
    }
}

pub enum F32Data<'a> {
    Direct(Ref<'a, [f32]>),
    Staged(Vec<f32>),
}

impl Deref for F32Data<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            F32Data::Direct(data) => &**data,
            F32Data::Staged(data) => data.as_slice(),
        }
    }
}

pub enum F32DataMut<'a> {
    Direct(RefMut<'a, [f32]>),
    Staged(Vec<f32>, &'a Tensor),
}

impl F32DataMut<'_> {
    /// Flush staged values into the tensor storage.
    pub fn commit(self) -> Result<()> {
        if let F32DataMut::Staged(data, tensor) = self {
            let mut storage = tensor.typed_mut::<f16>(DType::F16)?;
            for (dst, src) in storage.iter_mut().zip(&data) {
                *dst = f16::from_f32(*src);
            }
        }
        Ok(())
    }
}

impl Deref for F32DataMut<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            F32DataMut::Direct(data) => &**data,
            F32DataMut::Staged(data, _) => data.as_slice(),
        }
    }
}

impl DerefMut for F32DataMut<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        match self {
            F32DataMut::Direct(data) => &mut **data,
            F32DataMut::Staged(data, _) => data.as_mut_slice(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_consumer_returns_storage() {
        let device = Device::reference();
        let t = Tensor::activation(&device, "x", DType::F32);
        t.set_shape(vec![4, 8]);
        t.add_user();
        t.add_user();

        t.resume_user_count();
        t.prepare_data().expect("prepare");
        assert_eq!(device.stats().live_bytes, 128);

        t.decrease_curr_user_count().expect("first consumer");
        assert!(t.is_materialized());
        t.decrease_curr_user_count().expect("second consumer");
        assert!(!t.is_materialized());
        assert_eq!(device.stats().live_bytes, 0);

        assert!(matches!(t.decrease_curr_user_count(), Err(LlmError::Fatal(_))));
    }

    #[test]
    fn weights_ignore_user_counts() {
        let device = Device::reference();
        let w = Tensor::weight(&device, "w.weight", vec![2], true);
        w.bind(DType::F32, vec![2], bytemuck::cast_slice(&[1.0f32, 2.0])).expect("bind");
        w.decrease_curr_user_count().expect("no-op");
        assert_eq!(&*w.f32().expect("f32"), &[1.0, 2.0]);
    }

    #[test]
    fn reading_unprepared_tensor_is_fatal() {
        let device = Device::reference();
        let t = Tensor::activation(&device, "x", DType::F32);
        t.set_shape(vec![2]);
        assert!(matches!(t.f32(), Err(LlmError::Fatal(_))));
        assert!(matches!(t.i32(), Err(LlmError::Fatal(_))));
    }

    #[test]
    fn f16_staging_round_trip() {
        let device = Device::reference();
        let t = Tensor::activation(&device, "h", DType::F16);
        t.set_shape(vec![3]);
        t.prepare_data().expect("prepare");

        let mut out = t.write_f32().expect("write");
        out.copy_from_slice(&[0.5, -1.0, 2.0]);
        out.commit().expect("commit");

        assert_eq!(&*t.read_f32().expect("read"), &[0.5, -1.0, 2.0]);
    }

    #[test]
    fn bind_rejects_wrong_length() {
        let device = Device::reference();
        let w = Tensor::weight(&device, "w", vec![2, 32], false);
        assert!(matches!(w.bind(DType::Int4, vec![2, 32], &[0u8; 10]), Err(LlmError::Load(_))));
    }
}
