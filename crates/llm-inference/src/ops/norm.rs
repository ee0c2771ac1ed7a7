use inferforge_kernels::DType;
use ndarray::{ArrayView1, ArrayViewMut2};
use std::rc::Rc;

use super::{rows_and_width, Op, OpCore};
use crate::device::Device;
use crate::error::{LlmError, Result};
use crate::tensor::{F32Data, TensorRef};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormConfig {
    /// Apply a learned gain `{embd}`.
    pub mul: bool,
    /// Add a learned bias `{embd}`.
    pub bias: bool,
    /// RMS normalization instead of mean/variance.
    pub rms: bool,
    pub eps: f32,
}

impl NormConfig {
    pub fn rms(eps: f32) -> Self {
        Self { mul: true, bias: false, rms: true, eps }
    }

    pub fn layer_norm(eps: f32) -> Self {
        Self { mul: true, bias: true, rms: false, eps }
    }
}

pub struct LayerNorm {
    core: OpCore,
    embd: usize,
    config: NormConfig,
}

impl LayerNorm {
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        input: TensorRef,
        embd: usize,
        config: NormConfig,
        compt: DType,
    ) -> Self {
        let mut core = OpCore::new(device, name, vec![input], 1, compt);
        if config.mul {
            core.add_weight("weight", vec![embd], true);
        }
        if config.bias {
            core.add_weight("bias", vec![embd], true);
        }
        Self { core, embd, config }
    }

    fn param(&self, idx: usize) -> Result<F32Data<'_>> {
        self.core.weights[idx].read_f32()
    }
}

impl Op for LayerNorm {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        let input = self.core.input(0);
        let (_, width) = rows_and_width(input)?;
        if width != self.embd {
            return Err(LlmError::Shape(format!(
                "norm `{}` expects width {}, input has {}",
                self.core.name(),
                self.embd,
                width
            )));
        }
        self.core.output().set_shape(input.shape());
        Ok(())
    }

    fn execute(&mut self, _workspace: &mut Workspace, _nr_past: usize) -> Result<()> {
        let (rows, width) = rows_and_width(self.core.input(0))?;
        let input = self.core.input(0).read_f32()?;
        let output = self.core.output();
        let mut out = output.write_f32()?;
        out.copy_from_slice(&input);

        let gamma = self.config.mul.then(|| self.param(0)).transpose()?;
        let beta = self
            .config
            .bias
            .then(|| self.param(usize::from(self.config.mul)))
            .transpose()?;

        let data = ArrayViewMut2::from_shape((rows, width), &mut out[..])?;
        let gamma = gamma.as_deref().map(|g| ArrayView1::from(g));
        let beta = beta.as_deref().map(|b| ArrayView1::from(b));
        let kernel = self.core.device().kernel();
        if self.config.rms {
            kernel.rms_norm(data, gamma, beta, self.config.eps)?;
        } else {
            kernel.layer_norm(data, gamma, beta, self.config.eps)?;
        }
        out.commit()
    }
}
