//! Compute device: a kernel plus a pool of reusable tensor buffers.

use inferforge_kernels::{
    DynKernel, Kernel, KernelOptMethod, KernelRegistry, ParallelKernel, ReferenceKernel,
};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{LlmError, Result};

/// Byte storage backed by `u64` words so it can be viewed as `f32`, `f16`
/// or `i32` slices without copying.
pub struct Buffer {
    words: Vec<u64>,
    len: usize,
}

impl Buffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::zeroed(bytes.len());
        buffer.bytes_mut().copy_from_slice(bytes);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * 8
    }

    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    pub fn typed<T: bytemuck::Pod>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.bytes())
            .map_err(|err| LlmError::Fatal(format!("buffer view: {}", err)))
    }

    pub fn typed_mut<T: bytemuck::Pod>(&mut self) -> Result<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.bytes_mut())
            .map_err(|err| LlmError::Fatal(format!("buffer view: {}", err)))
    }

    fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.len = len;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes currently handed out.
    pub live_bytes: usize,
    pub peak_bytes: usize,
    /// Released buffers waiting for reuse.
    pub pooled_buffers: usize,
    pub fresh_allocations: usize,
    pub reuses: usize,
}

/// Best-fit pool of released buffers.
pub struct MemoryPool {
    free: Vec<Buffer>,
    max_cached: usize,
    stats: PoolStats,
}

impl MemoryPool {
    pub fn new(max_cached: usize) -> Self {
        Self {
            free: Vec::new(),
            max_cached,
            stats: PoolStats::default(),
        }
    }

    pub fn allocate(&mut self, len: usize) -> Buffer {
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.capacity() >= len)
            .min_by_key(|(_, buf)| buf.capacity())
            .map(|(idx, _)| idx);

        let buffer = match best {
            Some(idx) => {
                let mut buf = self.free.swap_remove(idx);
                buf.set_len(len);
                self.stats.reuses += 1;
                buf
            }
            None => {
                self.stats.fresh_allocations += 1;
                Buffer::zeroed(len)
            }
        };

        self.stats.live_bytes += buffer.capacity();
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
        self.stats.pooled_buffers = self.free.len();
        buffer
    }

    pub fn free(&mut self, buffer: Buffer) {
        self.stats.live_bytes = self.stats.live_bytes.saturating_sub(buffer.capacity());
        if self.free.len() < self.max_cached {
            self.free.push(buffer);
        }
        self.stats.pooled_buffers = self.free.len();
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

/// Kernel and allocator shared by every tensor of a graph.
pub struct Device {
    kernel: DynKernel,
    pool: RefCell<MemoryPool>,
}

impl Device {
    pub const DEFAULT_POOL_BUFFERS: usize = 256;

    pub fn new(kernel: DynKernel) -> Rc<Self> {
        Rc::new(Self {
            kernel,
            pool: RefCell::new(MemoryPool::new(Self::DEFAULT_POOL_BUFFERS)),
        })
    }

    /// CPU device with the rayon kernel.
    pub fn cpu() -> Rc<Self> {
        Self::new(Arc::new(ParallelKernel::new()))
    }

    /// CPU device with the sequential reference kernel.
    pub fn reference() -> Rc<Self> {
        Self::new(Arc::new(ReferenceKernel::new()))
    }

    /// Device for a kernel registered under `name` (`reference`, `parallel`).
    pub fn by_kernel_name(name: &str) -> Result<Rc<Self>> {
        let registry = KernelRegistry::with_default_kernels();
        registry.find(name).map(Self::new).ok_or_else(|| {
            LlmError::Config(format!(
                "unknown kernel `{}`; registered: {:?}",
                name,
                registry.names()
            ))
        })
    }

    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    pub fn supported_optimization(&self, method: KernelOptMethod) -> bool {
        self.kernel.supported_optimization(method)
    }

    pub fn allocate(&self, len: usize) -> Buffer {
        self.pool.borrow_mut().allocate(len)
    }

    pub fn free(&self, buffer: Buffer) {
        self.pool.borrow_mut().free(buffer)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.borrow().stats()
    }
}
