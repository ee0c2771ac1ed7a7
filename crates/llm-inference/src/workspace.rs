//! Grow-only scratch memory lent to one operator at a time.

use crate::error::{LlmError, Result};

#[derive(Debug, Default)]
pub struct Workspace {
    data: Vec<f32>,
    peak: usize,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len_in_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Largest number of bytes carved by a single operator so far.
    pub fn peak_bytes(&self) -> usize {
        self.peak
    }

    /// Ensure at least `bytes` of scratch. Never shrinks.
    pub fn reserve_bytes(&mut self, bytes: usize) {
        let floats = bytes.div_ceil(std::mem::size_of::<f32>());
        if floats > self.data.len() {
            self.data.resize(floats, 0.0);
        }
    }

    /// Split the front of the workspace into `N` disjoint slices.
    pub fn carve<const N: usize>(&mut self, lens: [usize; N]) -> Result<[&mut [f32]; N]> {
        let total: usize = lens.iter().sum();
        if total > self.data.len() {
            return Err(LlmError::Fatal(format!(
                "operator requested {} bytes of workspace, only {} reserved",
                total * std::mem::size_of::<f32>(),
                self.len_in_bytes()
            )));
        }
        self.peak = self.peak.max(total * std::mem::size_of::<f32>());

        let mut rest: &mut [f32] = &mut self.data[..total];
        let mut slices: [&mut [f32]; N] = std::array::from_fn(|_| Default::default());
        for (slot, &len) in slices.iter_mut().zip(lens.iter()) {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            *slot = head;
            rest = tail;
        }
        Ok(slices)
    }
}
