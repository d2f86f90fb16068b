//! Mixture-of-experts layer over a flat token batch.
//!
//! ```text
//! tokens [N, d_model]      gate_input [N, d_gate]
//!      │                        │
//!      │ (mp slice)             ▼
//!      │                  gate: ids, scores ──▶ hook
//!      │                        │
//!      │                   mask: drop ids
//!      ▼                        ▼
//! dispatch ◀──────────── group by expert
//!      ▼
//! experts(fwd_input, fwd_expert_count)
//!      ▼
//! unpermute ──▶ + mask fill ──▶ reduce with scores ──▶ (mp all_gather)
//! ```

use std::sync::Arc;

use candle_core::{DType, Tensor};
use tracing::debug;

use super::error::{MoEError, Result};
use super::expert_layer::{check_tokens, MoEExperts};
use super::mask::TokenMask;
use super::router::{GateHook, MoEGate};
use super::token_dispatch::{reduce_top_k, TokenDispatcher};
use crate::distributed::DeviceCommunicator;

/// Gate, dispatcher and local expert bank of one MoE layer.
pub struct MoELayer {
    gate: Box<dyn MoEGate>,
    experts: MoEExperts,
    dispatcher: TokenDispatcher,
    gate_hook: Option<GateHook>,
    mask: Option<TokenMask>,
    mp_comm: Option<Arc<dyn DeviceCommunicator>>,
}

impl MoELayer {
    /// Assemble a layer.
    ///
    /// The gate must score every expert of the dispatcher's expert map and
    /// the expert bank must hold that map's local experts.
    pub fn new(
        gate: Box<dyn MoEGate>,
        experts: MoEExperts,
        dispatcher: TokenDispatcher,
    ) -> Result<Self> {
        let map = dispatcher.expert_map();
        if experts.num_expert() != map.num_expert() {
            return Err(MoEError::InvalidConfig(format!(
                "expert bank holds {} experts, expert map expects {}",
                experts.num_expert(),
                map.num_expert()
            )));
        }
        check_gate(gate.as_ref(), map.total_experts())?;
        Ok(Self {
            gate,
            experts,
            dispatcher,
            gate_hook: None,
            mask: None,
            mp_comm: None,
        })
    }

    /// Replace the gate.
    pub fn set_gate(&mut self, gate: Box<dyn MoEGate>) -> Result<()> {
        check_gate(gate.as_ref(), self.dispatcher.expert_map().total_experts())?;
        self.gate = gate;
        Ok(())
    }

    pub fn set_gate_hook(&mut self, hook: Option<GateHook>) {
        self.gate_hook = hook;
    }

    pub fn set_mask(&mut self, mask: Option<TokenMask>) {
        self.mask = mask;
    }

    /// Split batches across a model-parallel group.
    pub fn set_mp_comm(&mut self, comm: Option<Arc<dyn DeviceCommunicator>>) {
        self.mp_comm = comm;
    }

    /// Forward a `[N, d_model]` batch routed by `[N, d_gate]` gate input.
    pub fn forward(&self, tokens: &Tensor, gate_input: &Tensor) -> Result<Tensor> {
        let d_model = self.experts.d_model();
        let num_tokens = check_tokens(tokens, d_model)?;
        let d_gate = self.gate.d_gate();
        if gate_input.dims() != [num_tokens, d_gate] {
            return Err(MoEError::GateInputShapeMismatch {
                expected: vec![num_tokens, d_gate],
                actual: gate_input.dims().to_vec(),
            });
        }
        if let Some(mask) = &self.mask {
            mask.validate(num_tokens, d_model)?;
        }

        let mp = self
            .mp_comm
            .as_ref()
            .filter(|comm| !comm.process_group().is_single());

        match mp {
            None => self.forward_local(tokens, gate_input, self.mask.as_ref()),
            Some(comm) => {
                let pg = comm.process_group();
                let world_size = pg.world_size();
                if num_tokens % world_size != 0 {
                    return Err(MoEError::InvalidConfig(format!(
                        "batch of {num_tokens} tokens does not split across {world_size} model-parallel workers"
                    )));
                }
                let chunk = num_tokens / world_size;
                let start = pg.rank() * chunk;
                let mask = self.mask.as_ref().map(|m| m.slice(start, chunk));
                let local = self.forward_local(
                    &tokens.narrow(0, start, chunk)?,
                    &gate_input.narrow(0, start, chunk)?,
                    mask.as_ref(),
                )?;
                Ok(comm.all_gather(&local, 0)?)
            }
        }
    }

    fn forward_local(
        &self,
        tokens: &Tensor,
        gate_input: &Tensor,
        mask: Option<&TokenMask>,
    ) -> Result<Tensor> {
        let num_tokens = tokens.dim(0)?;
        if num_tokens == 0 {
            return Ok(Tensor::zeros(
                (0, self.experts.d_model()),
                tokens.dtype(),
                tokens.device(),
            )?);
        }
        let gate_out = self.gate.route(gate_input)?;
        if let Some(hook) = &self.gate_hook {
            hook(&gate_out.topk_ids, &gate_out.scores);
        }

        let top_k = gate_out.topk_ids.dim(1)?;
        let mut ids: Vec<u32> = gate_out
            .topk_ids
            .flatten_all()?
            .to_dtype(DType::U32)?
            .to_vec1()?;
        if let Some(mask) = mask {
            mask.apply_to_ids(&mut ids, top_k);
        }
        let grouped = self.dispatcher.grouper().group_ids(&ids, num_tokens, top_k);

        let (fwd_input, metadata) = self.dispatcher.dispatch_grouped(tokens, grouped)?;
        debug!(
            num_tokens,
            top_k,
            fwd_batch = metadata.fwd_batch_size(),
            active_experts = metadata.fwd_expert_count.iter().filter(|&&c| c > 0).count(),
            masked = mask.map_or(0, TokenMask::num_masked),
            "moe forward"
        );

        let expert_output = self
            .experts
            .forward(&fwd_input, &metadata.fwd_expert_count)?;
        let mut flat = self.dispatcher.unpermute(&expert_output, &metadata)?;

        if let Some(mask) = mask {
            if let Some(fill) =
                mask.fill_rows(top_k, self.experts.d_model(), flat.dtype(), flat.device())?
            {
                flat = (flat + fill)?;
            }
        }

        reduce_top_k(&flat, &gate_out.scores, num_tokens, top_k)
    }

    pub fn gate(&self) -> &dyn MoEGate {
        self.gate.as_ref()
    }

    pub fn experts(&self) -> &MoEExperts {
        &self.experts
    }

    pub fn dispatcher(&self) -> &TokenDispatcher {
        &self.dispatcher
    }

    pub fn top_k(&self) -> usize {
        self.gate.top_k()
    }

    pub fn d_model(&self) -> usize {
        self.experts.d_model()
    }
}

fn check_gate(gate: &dyn MoEGate, total_experts: usize) -> Result<()> {
    if gate.total_experts() != total_experts {
        return Err(MoEError::InvalidConfig(format!(
            "gate scores {} experts, layer has {}",
            gate.total_experts(),
            total_experts
        )));
    }
    Ok(())
}
