//! Expert compute units.
//!
//! Both variants take a token batch already grouped by ascending local
//! expert index plus the per-expert count vector, and return one output row
//! per input row in the same order:
//!
//! - **Linear** ([`LinearExpert`]): two [`FusedExpertLinear`] projections,
//!   every expert's weights stored in one tensor.
//! - **Conv** ([`ConvExpert`]): two `Conv1d` per expert, applied slice by
//!   slice with each expert's tokens as the sequence axis.
//!
//! The variant is fixed at construction ([`MoEExperts`]) and dispatched by
//! enum, so the layer above never inspects which one it holds.

use candle_core::{Module, Tensor};
use candle_nn::{conv1d, Activation, Conv1d, Conv1dConfig, VarBuilder};
use tracing::{trace, warn};

use super::error::{MoEError, Result};
use super::fused::{ExpertCounts, FusedExpertLinear};

/// Expert implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpertKind {
    /// Fused linear projections.
    #[default]
    Linear,
    /// Per-expert 1-D convolutions over each expert's token slice.
    Conv { kernel_size: usize, dilation: usize },
}

impl ExpertKind {
    /// Parse a selector name. `kernel_size` and `dilation` are only kept
    /// for `"conv"`.
    pub fn parse(name: &str, kernel_size: usize, dilation: usize) -> Result<Self> {
        match name {
            "linear" => {
                if kernel_size != 1 || dilation != 1 {
                    warn!(
                        kernel_size,
                        dilation, "kernel_size and dilation are ignored by linear experts"
                    );
                }
                Ok(Self::Linear)
            }
            "conv" => Ok(Self::Conv {
                kernel_size,
                dilation,
            }),
            other => Err(MoEError::UnsupportedExpert(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Conv { .. } => "conv",
        }
    }
}

/// Check a token batch is `[N, d_model]` and return N.
pub(crate) fn check_tokens(tokens: &Tensor, d_model: usize) -> Result<usize> {
    match tokens.dims() {
        &[n, d] if d == d_model => Ok(n),
        dims => Err(MoEError::TokenShapeMismatch {
            d_model,
            actual: dims.to_vec(),
        }),
    }
}

/// Expert bank built from two fused linear projections.
///
/// `h4toh(activation(htoh4(x)))`, with expert `i` using weight slice `i`
/// on rows `offsets[i]..offsets[i + 1]`.
#[derive(Debug, Clone)]
pub struct LinearExpert {
    htoh4: FusedExpertLinear,
    h4toh: FusedExpertLinear,
    activation: Activation,
}

impl LinearExpert {
    /// Create the expert bank, loading `htoh4` and `h4toh` from `vb`.
    pub fn new(
        num_expert: usize,
        d_model: usize,
        d_hidden: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let htoh4 = FusedExpertLinear::new(num_expert, d_model, d_hidden, true, vb.pp("htoh4"))?;
        let h4toh = FusedExpertLinear::new(num_expert, d_hidden, d_model, true, vb.pp("h4toh"))?;
        Ok(Self {
            htoh4,
            h4toh,
            activation,
        })
    }

    /// Assemble from existing projections.
    pub fn from_parts(
        htoh4: FusedExpertLinear,
        h4toh: FusedExpertLinear,
        activation: Activation,
    ) -> Result<Self> {
        if htoh4.num_expert() != h4toh.num_expert()
            || htoh4.out_features() != h4toh.in_features()
            || htoh4.in_features() != h4toh.out_features()
        {
            return Err(MoEError::InvalidConfig(format!(
                "incompatible projections: htoh4 {:?}, h4toh {:?}",
                htoh4.weight().dims(),
                h4toh.weight().dims()
            )));
        }
        Ok(Self {
            htoh4,
            h4toh,
            activation,
        })
    }

    /// Expand, activate, contract.
    pub fn forward(&self, tokens: &Tensor, counts: &[usize]) -> Result<Tensor> {
        let num_tokens = check_tokens(tokens, self.d_model())?;
        let counts = ExpertCounts::new(counts, self.num_expert(), num_tokens)?;

        let x = self.htoh4.forward(tokens, &counts)?;
        let x = x.apply(&self.activation)?;
        self.h4toh.forward(&x, &counts)
    }

    pub fn num_expert(&self) -> usize {
        self.htoh4.num_expert()
    }

    pub fn d_model(&self) -> usize {
        self.htoh4.in_features()
    }

    pub fn d_hidden(&self) -> usize {
        self.htoh4.out_features()
    }

    pub fn htoh4(&self) -> &FusedExpertLinear {
        &self.htoh4
    }

    pub fn h4toh(&self) -> &FusedExpertLinear {
        &self.h4toh
    }
}

/// Expert bank of independent 1-D convolutions, one pair per expert.
///
/// Convolution kernels cannot share the fused-weight trick, so every expert
/// owns its own parameters and only experts with tokens are invoked.
#[derive(Debug, Clone)]
pub struct ConvExpert {
    htoh4: Vec<Conv1d>,
    h4toh: Vec<Conv1d>,
    activation: Activation,
    d_model: usize,
    d_hidden: usize,
}

impl ConvExpert {
    /// Create `num_expert` convolution pairs from `vb`.
    ///
    /// Weights live under `htoh4.experts.{i}` and `h4toh.experts.{i}`. The
    /// padding keeps each slice's length, so `kernel_size` must be odd.
    pub fn new(
        num_expert: usize,
        d_model: usize,
        d_hidden: usize,
        kernel_size: usize,
        dilation: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        if kernel_size == 0 || kernel_size % 2 == 0 {
            return Err(MoEError::InvalidConfig(format!(
                "conv expert kernel_size must be odd to keep token count, got {kernel_size}"
            )));
        }
        if dilation == 0 {
            return Err(MoEError::InvalidConfig(
                "conv expert dilation must be > 0".to_string(),
            ));
        }

        let cfg = Conv1dConfig {
            padding: dilation * (kernel_size - 1) / 2,
            dilation,
            ..Default::default()
        };

        let vb_up = vb.pp("htoh4");
        let vb_down = vb.pp("h4toh");
        let mut htoh4 = Vec::with_capacity(num_expert);
        let mut h4toh = Vec::with_capacity(num_expert);
        for i in 0..num_expert {
            htoh4.push(conv1d(
                d_model,
                d_hidden,
                kernel_size,
                cfg,
                vb_up.pp(format!("experts.{i}")),
            )?);
            h4toh.push(conv1d(
                d_hidden,
                d_model,
                kernel_size,
                cfg,
                vb_down.pp(format!("experts.{i}")),
            )?);
        }

        Ok(Self {
            htoh4,
            h4toh,
            activation,
            d_model,
            d_hidden,
        })
    }

    /// Expand every non-empty expert slice, activate the whole intermediate,
    /// contract slice by slice.
    pub fn forward(&self, tokens: &Tensor, counts: &[usize]) -> Result<Tensor> {
        let num_tokens = check_tokens(tokens, self.d_model)?;
        let counts = ExpertCounts::new(counts, self.num_expert(), num_tokens)?;

        if num_tokens == 0 {
            return Ok(Tensor::zeros(
                (0, self.d_model),
                tokens.dtype(),
                tokens.device(),
            )?);
        }

        // [N, d_model] -> [1, d_model, N]: channels first, tokens as sequence.
        let x = tokens.t()?.unsqueeze(0)?;
        let hidden = Self::apply_per_expert(&self.htoh4, &x, &counts)?;
        let hidden = hidden.apply(&self.activation)?;
        let out = Self::apply_per_expert(&self.h4toh, &hidden, &counts)?;

        Ok(out.squeeze(0)?.t()?.contiguous()?)
    }

    fn apply_per_expert(convs: &[Conv1d], x: &Tensor, counts: &ExpertCounts) -> Result<Tensor> {
        let mut outputs = Vec::with_capacity(counts.active_experts());
        for segment in counts.segments() {
            trace!(
                expert = segment.expert,
                start = segment.start,
                tokens = segment.len,
                "conv expert slice"
            );
            let slice = x.narrow(2, segment.start, segment.len)?.contiguous()?;
            outputs.push(convs[segment.expert].forward(&slice)?);
        }
        Ok(Tensor::cat(&outputs, 2)?)
    }

    pub fn num_expert(&self) -> usize {
        self.htoh4.len()
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn d_hidden(&self) -> usize {
        self.d_hidden
    }
}

/// Expert bank selected once at construction.
#[derive(Debug, Clone)]
pub enum MoEExperts {
    Linear(LinearExpert),
    Conv(ConvExpert),
}

impl MoEExperts {
    /// Build the expert bank for `kind`.
    pub fn new(
        kind: ExpertKind,
        num_expert: usize,
        d_model: usize,
        d_hidden: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        match kind {
            ExpertKind::Linear => Ok(Self::Linear(LinearExpert::new(
                num_expert, d_model, d_hidden, activation, vb,
            )?)),
            ExpertKind::Conv {
                kernel_size,
                dilation,
            } => Ok(Self::Conv(ConvExpert::new(
                num_expert,
                d_model,
                d_hidden,
                kernel_size,
                dilation,
                activation,
                vb,
            )?)),
        }
    }

    /// Run every expert on its contiguous slice of `tokens`.
    ///
    /// `tokens` is `[N, d_model]` grouped by ascending expert index and
    /// `counts` has one entry per local expert summing to N.
    pub fn forward(&self, tokens: &Tensor, counts: &[usize]) -> Result<Tensor> {
        match self {
            Self::Linear(expert) => expert.forward(tokens, counts),
            Self::Conv(expert) => expert.forward(tokens, counts),
        }
    }

    pub fn num_expert(&self) -> usize {
        match self {
            Self::Linear(expert) => expert.num_expert(),
            Self::Conv(expert) => expert.num_expert(),
        }
    }

    pub fn d_model(&self) -> usize {
        match self {
            Self::Linear(expert) => expert.d_model(),
            Self::Conv(expert) => expert.d_model(),
        }
    }

    /// Parameter names relative to the expert bank's prefix.
    pub fn param_names(&self) -> Vec<String> {
        match self {
            Self::Linear(_) => ["htoh4", "h4toh"]
                .iter()
                .flat_map(|proj| [format!("{proj}.weight"), format!("{proj}.bias")])
                .collect(),
            Self::Conv(expert) => ["htoh4", "h4toh"]
                .iter()
                .flat_map(|proj| {
                    (0..expert.num_expert()).flat_map(move |i| {
                        [
                            format!("{proj}.experts.{i}.weight"),
                            format!("{proj}.experts.{i}.bias"),
                        ]
                    })
                })
                .collect(),
        }
    }
}
