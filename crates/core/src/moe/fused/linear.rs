//! Fused per-expert linear projection.
//!
//! All experts' weights live in one `[num_expert, out, in]` tensor. A grouped
//! token batch is projected by walking the offset table once, so expert `i`
//! multiplies exactly rows `offsets[i]..offsets[i + 1]` with weight slice `i`.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use super::super::error::{MoEError, Result};
use super::expert_count::ExpertCounts;

/// Linear layer holding one weight matrix per expert in a single tensor.
#[derive(Debug, Clone)]
pub struct FusedExpertLinear {
    /// Shape: [num_expert, out_features, in_features]
    weight: Tensor,
    /// Shape: [num_expert, out_features]
    bias: Option<Tensor>,
    num_expert: usize,
    in_features: usize,
    out_features: usize,
}

impl FusedExpertLinear {
    /// Create a fused linear layer, loading `weight` (and `bias`) from `vb`.
    pub fn new(
        num_expert: usize,
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        // Same bound as a default-initialized dense linear layer.
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight = vb.get_with_hints((num_expert, out_features, in_features), "weight", init)?;
        let bias = if bias {
            Some(vb.get_with_hints((num_expert, out_features), "bias", init)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            num_expert,
            in_features,
            out_features,
        })
    }

    /// Create from existing tensors.
    ///
    /// Expects `weight: [num_expert, out, in]` and `bias: [num_expert, out]`.
    pub fn from_tensors(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (num_expert, out_features, in_features) = weight.dims3()?;
        if let Some(b) = &bias {
            if b.dims() != [num_expert, out_features] {
                return Err(MoEError::InvalidConfig(format!(
                    "bias shape {:?} does not match weight shape {:?}",
                    b.dims(),
                    weight.dims()
                )));
            }
        }
        Ok(Self {
            weight,
            bias,
            num_expert,
            in_features,
            out_features,
        })
    }

    /// Project a grouped token batch `[N, in]` into `[N, out]`.
    ///
    /// Rows keep their order; experts with a zero count contribute nothing.
    pub fn forward(&self, tokens: &Tensor, counts: &ExpertCounts) -> Result<Tensor> {
        let (num_tokens, in_features) = tokens.dims2()?;
        if in_features != self.in_features {
            return Err(MoEError::TokenShapeMismatch {
                d_model: self.in_features,
                actual: tokens.dims().to_vec(),
            });
        }
        if counts.num_expert() != self.num_expert {
            return Err(MoEError::CountLengthMismatch {
                expected: self.num_expert,
                actual: counts.num_expert(),
            });
        }
        if counts.total() != num_tokens {
            return Err(MoEError::CountSumMismatch {
                expected: num_tokens,
                actual: counts.total(),
            });
        }

        if num_tokens == 0 {
            return Ok(Tensor::zeros(
                (0, self.out_features),
                tokens.dtype(),
                tokens.device(),
            )?);
        }

        let mut outputs = Vec::with_capacity(counts.active_experts());
        for segment in counts.segments() {
            let x = tokens.narrow(0, segment.start, segment.len)?;
            let w = self.weight.get(segment.expert)?;
            let mut y = x.matmul(&w.t()?)?;
            if let Some(bias) = &self.bias {
                y = y.broadcast_add(&bias.get(segment.expert)?)?;
            }
            outputs.push(y);
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    /// Fused weight tensor `[num_expert, out, in]`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Fused bias tensor `[num_expert, out]`, if any.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn num_expert(&self) -> usize {
        self.num_expert
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}
