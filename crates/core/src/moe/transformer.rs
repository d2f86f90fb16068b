//! MoE replacement for a transformer block's feed-forward network.
//!
//! Accepts tokens in any `[..., d_model]` layout, flattens the leading
//! dimensions for [`MoELayer`] and restores them on the way out.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::debug;

use super::error::{MoEError, Result};
use super::expert_layer::MoEExperts;
use super::expert_map::ExpertMap;
use super::layer::MoELayer;
use super::mask::TokenMask;
use super::router::{GateHook, MoEGate};
use super::token_dispatch::TokenDispatcher;
use crate::config::{DpComm, MoEConfig};
use crate::distributed::DeviceCommunicator;

/// Transformer MLP backed by a mixture of experts.
///
/// Parameters live under `experts.*` (expert bank) and `gate.*` (gate).
pub struct MoETransformerMlp {
    layer: MoELayer,
    expert_dp_comm: DpComm,
}

impl MoETransformerMlp {
    /// Build the layer described by `config`.
    ///
    /// `comm` connects the workers sharing the expert bank; its world size
    /// must equal `config.world_size`.
    pub fn new(
        config: &MoEConfig,
        comm: Arc<dyn DeviceCommunicator>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let pg = comm.process_group();
        if pg.world_size() != config.world_size {
            return Err(MoEError::InvalidConfig(format!(
                "world_size is {} but the communicator spans {} workers",
                config.world_size,
                pg.world_size()
            )));
        }
        let expert_kind = config.expert_kind()?;
        let activation = config.activation()?;
        let expert_dp_comm = config.dp_comm()?;
        let expert_map = ExpertMap::try_new(config.num_expert, config.world_size, pg.rank())?;

        let experts = MoEExperts::new(
            expert_kind,
            config.num_expert,
            config.d_model,
            config.d_hidden,
            activation,
            vb.pp("experts"),
        )?;
        let gate = config.gate_kind()?.build(
            config.d_model,
            config.num_expert,
            config.world_size,
            config.top_k,
            vb,
        )?;
        let dispatcher = TokenDispatcher::new(expert_map, comm)?;

        debug!(
            expert = expert_kind.name(),
            num_expert = config.num_expert,
            world_size = config.world_size,
            top_k = config.top_k,
            "built moe transformer mlp"
        );

        Ok(Self {
            layer: MoELayer::new(gate, experts, dispatcher)?,
            expert_dp_comm,
        })
    }

    /// Route with a custom gate instead of the configured one.
    pub fn with_gate(mut self, gate: Box<dyn MoEGate>) -> Result<Self> {
        self.layer.set_gate(gate)?;
        Ok(self)
    }

    /// Observe gate ids and scores on every forward.
    pub fn with_gate_hook(mut self, hook: GateHook) -> Self {
        self.layer.set_gate_hook(Some(hook));
        self
    }

    pub fn with_mask(mut self, mask: TokenMask) -> Self {
        self.layer.set_mask(Some(mask));
        self
    }

    /// Split every batch across a model-parallel group.
    pub fn with_mp_comm(mut self, comm: Arc<dyn DeviceCommunicator>) -> Self {
        self.layer.set_mp_comm(Some(comm));
        self
    }

    /// Forward `[..., d_model]` tokens.
    ///
    /// `gate_inp`, when given, must be `[..., d_gate]` with the input's
    /// leading dimensions and is used for routing only; otherwise the input
    /// routes itself.
    pub fn forward(&self, inp: &Tensor, gate_inp: Option<&Tensor>) -> Result<Tensor> {
        let d_model = self.layer.d_model();
        let original_shape = inp.dims().to_vec();
        let leading = match original_shape.split_last() {
            Some((&d, leading)) if d == d_model => leading,
            _ => {
                return Err(MoEError::TokenShapeMismatch {
                    d_model,
                    actual: inp.dims().to_vec(),
                })
            }
        };
        let num_tokens: usize = leading.iter().product();
        let tokens = inp.reshape((num_tokens, d_model))?;

        let output = match gate_inp {
            None => self.layer.forward(&tokens, &tokens)?,
            Some(gate_inp) => {
                let d_gate = self.layer.gate().d_gate();
                let mut expected = leading.to_vec();
                expected.push(d_gate);
                if gate_inp.dims() != expected.as_slice() {
                    return Err(MoEError::GateInputShapeMismatch {
                        expected,
                        actual: gate_inp.dims().to_vec(),
                    });
                }
                let gate_tokens = gate_inp.reshape((num_tokens, d_gate))?;
                self.layer.forward(&tokens, &gate_tokens)?
            }
        };

        Ok(output.reshape(original_shape)?)
    }

    /// Communication tag of every named parameter.
    pub fn param_comm_tags(&self) -> Vec<(String, DpComm)> {
        self.layer
            .experts()
            .param_names()
            .into_iter()
            .map(|name| (format!("experts.{name}"), self.expert_dp_comm))
            .chain(
                self.layer
                    .gate()
                    .param_names()
                    .into_iter()
                    .map(|name| (name, DpComm::Gate)),
            )
            .collect()
    }

    pub fn layer(&self) -> &MoELayer {
        &self.layer
    }
}
