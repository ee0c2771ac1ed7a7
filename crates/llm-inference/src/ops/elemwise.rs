use inferforge_kernels::{DType, ElemMode};
use std::rc::Rc;

use super::{rows_and_width, Op, OpCore};
use crate::device::Device;
use crate::error::{LlmError, Result};
use crate::tensor::TensorRef;
use crate::workspace::Workspace;

/// Unary activation or binary `Add`/`Mul`. `Add` with a scale computes
/// `a * scale + b`.
pub struct Elemwise {
    core: OpCore,
    mode: ElemMode,
    scale: Option<f32>,
}

impl Elemwise {
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        inputs: Vec<TensorRef>,
        mode: ElemMode,
        scale: Option<f32>,
        compt: DType,
    ) -> Result<Self> {
        let name = name.into();
        let arity = if mode.is_binary() { 2 } else { 1 };
        if inputs.len() != arity {
            return Err(LlmError::Config(format!(
                "elemwise `{}` {:?} takes {} inputs, got {}",
                name,
                mode,
                arity,
                inputs.len()
            )));
        }
        Ok(Self {
            core: OpCore::new(device, name, inputs, 1, compt),
            mode,
            scale,
        })
    }
}

impl Op for Elemwise {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        let shape = self.core.input(0).shape();
        if let Some(other) = self.core.inputs.get(1) {
            if other.shape() != shape {
                return Err(LlmError::Shape(format!(
                    "elemwise `{}` operands {:?} and {:?} differ",
                    self.core.name(),
                    shape,
                    other.shape()
                )));
            }
        }
        self.core.output().set_shape(shape);
        Ok(())
    }

    fn execute(&mut self, _workspace: &mut Workspace, _nr_past: usize) -> Result<()> {
        let a = self.core.input(0).read_f32()?;
        let b = self.core.inputs.get(1).map(|t| t.read_f32()).transpose()?;
        let mut out = self.core.output().write_f32()?;
        self.core
            .device()
            .kernel()
            .elemwise(self.mode, &a, b.as_deref(), self.scale, &mut out)?;
        out.commit()
    }
}

/// `out = act(x[.., :h]) * x[.., h:]` where `2h` is the input width.
pub struct SplitHalfActiveMul {
    core: OpCore,
    mode: ElemMode,
}

impl SplitHalfActiveMul {
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        input: TensorRef,
        mode: ElemMode,
        compt: DType,
    ) -> Self {
        Self {
            core: OpCore::new(device, name, vec![input], 1, compt),
            mode,
        }
    }
}

impl Op for SplitHalfActiveMul {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        let (_, width) = rows_and_width(self.core.input(0))?;
        if width % 2 != 0 {
            return Err(LlmError::Shape(format!(
                "split-half `{}` needs an even width, got {}",
                self.core.name(),
                width
            )));
        }
        let mut shape = self.core.input(0).shape();
        if let Some(last) = shape.last_mut() {
            *last = width / 2;
        }
        self.core.output().set_shape(shape);
        Ok(())
    }

    fn execute(&mut self, _workspace: &mut Workspace, _nr_past: usize) -> Result<()> {
        let (_, width) = rows_and_width(self.core.input(0))?;
        let input = self.core.input(0).read_f32()?;
        let mut out = self.core.output().write_f32()?;
        self.core
            .device()
            .kernel()
            .split_half_active_mul(self.mode, &input, width, &mut out)?;
        out.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testing::{filled, run};

    #[test]
    fn scaled_residual_add() {
        let device = Device::reference();
        let a = filled(&device, "a", vec![1, 2], &[1.0, 2.0]);
        let b = filled(&device, "b", vec![1, 2], &[10.0, 20.0]);
        let mut op = Elemwise::new(&device, "res", vec![a, b], ElemMode::Add, Some(3.0), DType::F32)
            .expect("binary");
        assert_eq!(run(&mut op, 0).expect("run"), vec![13.0, 26.0]);
    }

    #[test]
    fn arity_is_checked() {
        let device = Device::reference();
        let a = filled(&device, "a", vec![1, 2], &[1.0, 2.0]);
        assert!(Elemwise::new(&device, "mul", vec![a], ElemMode::Mul, None, DType::F32).is_err());
    }

    #[test]
    fn mismatched_operands_are_shape_errors() {
        let device = Device::reference();
        let a = filled(&device, "a", vec![1, 2], &[1.0, 2.0]);
        let b = filled(&device, "b", vec![2, 1], &[1.0, 2.0]);
        let mut op = Elemwise::new(&device, "mul", vec![a, b], ElemMode::Mul, None, DType::F32)
            .expect("binary");
        assert!(matches!(op.deduce_output_shape(), Err(LlmError::Shape(_))));
    }

    #[test]
    fn split_half_halves_width() {
        let device = Device::reference();
        let x = filled(&device, "x", vec![1, 4], &[0.0, 2.0, 5.0, 3.0]);
        let mut op = SplitHalfActiveMul::new(&device, "swiglu", x, ElemMode::Relu, DType::F32);
        assert_eq!(run(&mut op, 0).expect("run"), vec![0.0, 6.0]);
        assert_eq!(op.outputs()[0].shape(), vec![1, 2]);
    }

    #[test]
    fn f16_activations_round_trip_through_staging() {
        let device = Device::reference();
        let a = filled(&device, "a", vec![1, 2], &[1.5, -2.0]);
        let mut op = Elemwise::new(&device, "act", vec![a], ElemMode::Relu, None, DType::F16)
            .expect("unary");
        assert_eq!(run(&mut op, 0).expect("run"), vec![1.5, 0.0]);
        assert_eq!(op.outputs()[0].dtype(), DType::F16);
    }
}
