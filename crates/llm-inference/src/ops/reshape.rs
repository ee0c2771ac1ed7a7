//! Standalone reshape op. The built-in architectures never insert it; attention
//! reads its fused projections through head layouts instead.

use inferforge_kernels::DType;
use std::rc::Rc;

use super::{Op, OpCore};
use crate::device::Device;
use crate::error::{LlmError, Result};
use crate::tensor::TensorRef;
use crate::workspace::Workspace;

/// Copy the input under a new shape. At most one target dim may be `-1`.
pub struct Reshape {
    core: OpCore,
    target: Vec<i64>,
}

impl Reshape {
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        input: TensorRef,
        target: Vec<i64>,
        compt: DType,
    ) -> Self {
        Self {
            core: OpCore::new(device, name, vec![input], 1, compt),
            target,
        }
    }

    fn resolve(&self, total: usize) -> Result<Vec<usize>> {
        let inferred: Vec<usize> = self
            .target
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == -1)
            .map(|(i, _)| i)
            .collect();
        if inferred.len() > 1 || self.target.iter().any(|&d| d < -1 || d == 0) {
            return Err(LlmError::Shape(format!(
                "reshape `{}` target {:?} is invalid",
                self.core.name(),
                self.target
            )));
        }

        let known: usize = self.target.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
        let mut shape: Vec<usize> = self.target.iter().map(|&d| d.max(0) as usize).collect();
        match inferred.first() {
            Some(&idx) => {
                if total % known != 0 {
                    return Err(LlmError::Shape(format!(
                        "reshape `{}`: {} elements are not divisible by {}",
                        self.core.name(),
                        total,
                        known
                    )));
                }
                shape[idx] = total / known;
            }
            None if known != total => {
                return Err(LlmError::Shape(format!(
                    "reshape `{}`: {:?} does not hold {} elements",
                    self.core.name(),
                    self.target,
                    total
                )))
            }
            None => {}
        }
        Ok(shape)
    }
}

impl Op for Reshape {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        let shape = self.resolve(self.core.input(0).nr_elems())?;
        self.core.output().set_shape(shape);
        Ok(())
    }

    fn execute(&mut self, _workspace: &mut Workspace, _nr_past: usize) -> Result<()> {
        let input = self.core.input(0).read_f32()?;
        let mut out = self.core.output().write_f32()?;
        out.copy_from_slice(&input);
        out.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::{filled, run};

    #[test]
    fn infers_one_dim() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![4, 6], &[1.0; 24]);
        let mut op = Reshape::new(&device, "r", x, vec![-1, 4, 2], DType::F32);
        assert_eq!(run(&mut op, 0).expect("run").len(), 24);
        assert_eq!(op.outputs()[0].shape(), vec![3, 4, 2]);
    }

    #[test]
    fn non_divisible_inference_fails() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![5, 2], &[1.0; 10]);
        let mut op = Reshape::new(&device, "r", x, vec![-1, 4], DType::F32);
        assert!(matches!(op.deduce_output_shape(), Err(LlmError::Shape(_))));
    }

    #[test]
    fn two_wildcards_fail() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![4, 4], &[1.0; 16]);
        let mut op = Reshape::new(&device, "r", x, vec![-1, -1], DType::F32);
        assert!(matches!(op.deduce_output_shape(), Err(LlmError::Shape(_))));
    }
}
