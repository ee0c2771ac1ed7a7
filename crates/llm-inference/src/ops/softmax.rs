//! Standalone softmax and causal-mask ops. The built-in architectures mask and
//! normalize inside the attention kernel, so these only run when composed by hand.

use inferforge_kernels::DType;
use ndarray::ArrayViewMut2;
use std::rc::Rc;

use super::{rows_and_width, Op, OpCore};
use crate::device::Device;
use crate::error::Result;
use crate::tensor::TensorRef;
use crate::workspace::Workspace;

fn copy_into_output(core: &OpCore, apply: impl FnOnce(ArrayViewMut2<'_, f32>)) -> Result<()> {
    let (rows, width) = rows_and_width(core.input(0))?;
    let input = core.input(0).read_f32()?;
    let mut out = core.output().write_f32()?;
    out.copy_from_slice(&input);
    apply(ArrayViewMut2::from_shape((rows, width), &mut out[..])?);
    out.commit()
}

/// Softmax over the last dim.
pub struct SoftMax {
    core: OpCore,
}

impl SoftMax {
    pub fn new(device: &Rc<Device>, name: impl Into<String>, input: TensorRef, compt: DType) -> Self {
        Self {
            core: OpCore::new(device, name, vec![input], 1, compt),
        }
    }
}

impl Op for SoftMax {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        rows_and_width(self.core.input(0))?;
        self.core.output().set_shape(self.core.input(0).shape());
        Ok(())
    }

    fn execute(&mut self, _workspace: &mut Workspace, _nr_past: usize) -> Result<()> {
        let kernel = self.core.device().kernel();
        copy_into_output(&self.core, |scores| kernel.softmax(scores))
    }
}

/// Causal mask over `{L, T}` scores: `-inf` where `j > nr_past + i`.
pub struct DiagMask {
    core: OpCore,
}

impl DiagMask {
    pub fn new(device: &Rc<Device>, name: impl Into<String>, input: TensorRef, compt: DType) -> Self {
        Self {
            core: OpCore::new(device, name, vec![input], 1, compt),
        }
    }
}

impl Op for DiagMask {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        rows_and_width(self.core.input(0))?;
        self.core.output().set_shape(self.core.input(0).shape());
        Ok(())
    }

    fn execute(&mut self, _workspace: &mut Workspace, nr_past: usize) -> Result<()> {
        let kernel = self.core.device().kernel();
        copy_into_output(&self.core, |scores| kernel.diag_mask(scores, nr_past))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::{filled, run};
    use approx::assert_abs_diff_eq;

    #[test]
    fn softmax_rows_sum_to_one() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![2, 3], &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let out = run(&mut SoftMax::new(&device, "sm", x, DType::F32), 0).expect("run");
        assert_abs_diff_eq!(out[..3].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[3], 1.0 / 3.0, epsilon = 1e-6);
        assert!(out[2] > out[1]);
    }

    #[test]
    fn mask_offsets_by_past() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![2, 4], &[0.0; 8]);
        let out = run(&mut DiagMask::new(&device, "mask", x, DType::F32), 2).expect("run");
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], f32::NEG_INFINITY);
        assert_eq!(out[7], 0.0);
    }
}
