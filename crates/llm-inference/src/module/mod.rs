//! Modules group the ops of one transformer block stage.
//!
//! A module owns its ops and runs them in the order they were pushed. The
//! builders in [`blocks`] and [`ffn`] wire the ops of each architecture; the
//! last pushed op produces the module output.

use inferforge_kernels::DType;
use std::rc::Rc;
use tracing::trace;

use crate::device::Device;
use crate::error::Result;
use crate::ops::Op;
use crate::tensor::TensorRef;
use crate::workspace::Workspace;

pub mod blocks;
pub mod ffn;

/// Device and activation dtype every op of a graph is built with.
#[derive(Clone)]
pub struct BuildContext {
    pub device: Rc<Device>,
    pub compt: DType,
}

impl BuildContext {
    pub fn new(device: &Rc<Device>, compt: DType) -> Self {
        Self {
            device: Rc::clone(device),
            compt,
        }
    }
}

pub struct Module {
    name: String,
    inputs: Vec<TensorRef>,
    ops: Vec<Box<dyn Op>>,
}

impl Module {
    pub fn new(name: impl Into<String>, inputs: Vec<TensorRef>) -> Self {
        Self {
            name: name.into(),
            inputs,
            ops: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[TensorRef] {
        &self.inputs
    }

    /// Append an op and return its first output for chaining.
    pub fn push<O: Op + 'static>(&mut self, op: O) -> TensorRef {
        let out = Rc::clone(&op.outputs()[0]);
        self.ops.push(Box::new(op));
        out
    }

    pub fn ops(&self) -> &[Box<dyn Op>] {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut [Box<dyn Op>] {
        &mut self.ops
    }

    /// Output of the last op.
    pub fn output(&self) -> Option<TensorRef> {
        self.ops.last().map(|op| Rc::clone(&op.outputs()[0]))
    }

    pub fn deduce_output_shape(&mut self) -> Result<()> {
        for op in &mut self.ops {
            op.deduce_output_shape()?;
        }
        Ok(())
    }

    pub fn execute(&mut self, workspace: &mut Workspace, nr_past: usize, is_prefill: bool) -> Result<()> {
        trace!(module = %self.name, nr_past, is_prefill, "execute");
        for op in &mut self.ops {
            op.pre_execute()?;
            op.execute(workspace, nr_past)?;
            op.end_execute()?;
        }
        Ok(())
    }

    pub fn workspace_in_bytes(&self) -> usize {
        self.ops.iter().map(|op| op.workspace_in_bytes()).max().unwrap_or(0)
    }

    pub fn reset_ctx(&mut self) {
        for op in &mut self.ops {
            op.reset_ctx();
        }
    }

    /// KV lengths of the attention ops in this module.
    pub fn kv_lengths(&self) -> impl Iterator<Item = usize> + '_ {
        self.ops.iter().filter_map(|op| op.kv_length())
    }

    pub fn kv_bytes_per_token(&self) -> usize {
        self.ops.iter().map(|op| op.kv_bytes_per_token()).sum()
    }
}
