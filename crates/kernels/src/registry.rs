//! Kernel registry for lookup and discovery.

use crate::kernel::{DynKernel, Kernel, ParallelKernel, ReferenceKernel};
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct KernelRegistry {
    kernels: Vec<DynKernel>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            kernels: Vec::new(),
        }
    }

    pub fn with_default_kernels() -> Self {
        let mut registry = Self::new();
        registry.register(ReferenceKernel::new());
        registry.register(ParallelKernel::new());
        registry
    }

    pub fn register<K>(&mut self, kernel: K)
    where
        K: Kernel + 'static,
    {
        self.kernels.push(Arc::new(kernel));
    }

    pub fn kernels(&self) -> &[DynKernel] {
        &self.kernels
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.kernels.iter().map(|kernel| kernel.name()).collect()
    }

    pub fn find(&self, name: &str) -> Option<DynKernel> {
        self.kernels
            .iter()
            .find(|kernel| kernel.name() == name)
            .map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_finds_by_name() {
        let registry = KernelRegistry::with_default_kernels();
        assert_eq!(registry.names(), vec!["reference", "parallel"]);
        assert!(registry.find("parallel").is_some());
        assert!(registry.find("gpu").is_none());
    }
}
