//! Gates: pick the top-k experts for every token.
//!
//! The layer only consumes a gate's output, so any routing policy can be
//! plugged in through [`MoEGate`]. [`NaiveGate`] is the default: a linear
//! projection to one logit per expert, top-k over the logits, then a
//! softmax over the k selected logits.

use std::sync::Arc;

use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use super::error::{MoEError, Result};

/// Output of a gate for a `[num_tokens, d_gate]` input.
#[derive(Debug, Clone)]
pub struct GateOutput {
    /// Global expert ids, `[num_tokens, top_k]` (U32). Ids at or beyond the
    /// total expert count are not dispatched.
    pub topk_ids: Tensor,
    /// Combine weights for each selected expert, `[num_tokens, top_k]`.
    pub scores: Tensor,
}

/// Trait for MoE gates.
pub trait MoEGate: Send + Sync {
    /// Route `[num_tokens, d_gate]` gating features to experts.
    fn route(&self, gate_input: &Tensor) -> Result<GateOutput>;

    /// Total number of experts across all workers.
    fn total_experts(&self) -> usize;

    /// Experts selected per token.
    fn top_k(&self) -> usize;

    /// Width of the gating features the gate consumes.
    fn d_gate(&self) -> usize;

    /// Names of the gate's trainable parameters, relative to the layer.
    fn param_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Observer called on every forward with the gate's ids and scores.
pub type GateHook = Arc<dyn Fn(&Tensor, &Tensor) + Send + Sync>;

/// Gate implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateKind {
    #[default]
    Naive,
}

impl GateKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "naive" => Ok(Self::Naive),
            other => Err(MoEError::UnsupportedGate(other.to_string())),
        }
    }

    /// Build the selected gate.
    pub fn build(
        self,
        d_model: usize,
        num_expert: usize,
        world_size: usize,
        top_k: usize,
        vb: VarBuilder,
    ) -> Result<Box<dyn MoEGate>> {
        match self {
            Self::Naive => Ok(Box::new(NaiveGate::new(
                d_model, num_expert, world_size, top_k, vb,
            )?)),
        }
    }
}

/// Linear top-k gate.
pub struct NaiveGate {
    gate: Linear,
    d_model: usize,
    total_experts: usize,
    top_k: usize,
}

impl NaiveGate {
    /// Create a gate scoring `num_expert * world_size` experts.
    pub fn new(
        d_model: usize,
        num_expert: usize,
        world_size: usize,
        top_k: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let total_experts = num_expert * world_size;
        if top_k == 0 || top_k > total_experts {
            return Err(MoEError::InvalidConfig(format!(
                "top_k must be in 1..={total_experts}, got {top_k}"
            )));
        }
        let gate = candle_nn::linear(d_model, total_experts, vb.pp("gate"))?;
        Ok(Self {
            gate,
            d_model,
            total_experts,
            top_k,
        })
    }

    /// Raw gate logits `[num_tokens, total_experts]`.
    pub fn logits(&self, gate_input: &Tensor) -> Result<Tensor> {
        Ok(self.gate.forward(gate_input)?)
    }
}

impl MoEGate for NaiveGate {
    fn route(&self, gate_input: &Tensor) -> Result<GateOutput> {
        let logits = self.logits(gate_input)?;
        let (values, topk_ids) = top_k_with_indices(&logits, self.top_k)?;
        let scores = candle_nn::ops::softmax(&values, D::Minus1)?;
        Ok(GateOutput { topk_ids, scores })
    }

    fn total_experts(&self) -> usize {
        self.total_experts
    }

    fn top_k(&self) -> usize {
        self.top_k
    }

    fn d_gate(&self) -> usize {
        self.d_model
    }

    fn param_names(&self) -> Vec<String> {
        vec!["gate.weight".to_string(), "gate.bias".to_string()]
    }
}

/// Get top-k values and their indices along the last dimension.
///
/// # Returns
/// * `values` - Top-k values of shape `[..., k]`, descending
/// * `indices` - Indices of top-k values of shape `[..., k]` (U32)
pub fn top_k_with_indices(tensor: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let dim = tensor.rank() - 1;
    let n = tensor.dim(dim)?;

    let sorted_indices = tensor.arg_sort_last_dim(false)?;
    let top_k_indices = if k >= n {
        sorted_indices.contiguous()?
    } else {
        sorted_indices.narrow(dim, 0, k)?.contiguous()?
    };

    let top_k_values = tensor.contiguous()?.gather(&top_k_indices, dim)?;
    Ok((top_k_values, top_k_indices))
}
