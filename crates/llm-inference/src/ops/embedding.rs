use inferforge_kernels::{DType, WeightView};
use ndarray::ArrayViewMut2;
use std::rc::Rc;

use super::{Op, OpCore};
use crate::device::Device;
use crate::error::{LlmError, Result};
use crate::tensor::TensorRef;
use crate::workspace::Workspace;

/// Token id `{L}` to `{L, embd}` row gather from `{vocab, embd}`.
pub struct Embedding {
    core: OpCore,
    vocab: usize,
    embd: usize,
}

impl Embedding {
    pub fn new(
        device: &Rc<Device>,
        name: impl Into<String>,
        tokens: TensorRef,
        vocab: usize,
        embd: usize,
        compt: DType,
    ) -> Self {
        let mut core = OpCore::new(device, name, vec![tokens], 1, compt);
        core.add_weight("weight", vec![vocab, embd], false);
        Self { core, vocab, embd }
    }
}

impl Op for Embedding {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn deduce_output_shape(&mut self) -> Result<()> {
        let len = self.core.input(0).nr_elems();
        self.core.output().set_shape(vec![len, self.embd]);
        Ok(())
    }

    fn execute(&mut self, _workspace: &mut Workspace, _nr_past: usize) -> Result<()> {
        let ids = self
            .core
            .input(0)
            .i32()?
            .iter()
            .map(|&id| {
                usize::try_from(id)
                    .ok()
                    .filter(|&id| id < self.vocab)
                    .ok_or_else(|| {
                        LlmError::Config(format!(
                            "token id {} outside vocabulary of {}",
                            id, self.vocab
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let table = &self.core.weights[0];
        let bytes = table.bytes()?;
        let view = WeightView::from_bytes(table.dtype(), self.vocab, self.embd, &bytes)?;
        let mut out = self.core.output().write_f32()?;
        self.core.device().kernel().embedding(
            &view,
            &ids,
            ArrayViewMut2::from_shape((ids.len(), self.embd), &mut out[..])?,
        )?;
        out.commit()
    }
}
