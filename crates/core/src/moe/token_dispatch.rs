//! Token dispatch and combine.
//!
//! Moves (token, k) entries into contiguous per-expert groups on the worker
//! that owns each expert, and brings expert outputs back:
//!
//! ```text
//! Input [num_tokens, d_model]
//!     ↓
//! dispatch():
//!     1. Group entries by global expert id (pos, local_expert_count)
//!     2. Gather rows in grouped order
//!     3. Exchange counts via all_to_all (global_expert_count)
//!     4. Exchange rows via all_to_all_v, regroup by local expert
//!     ↓
//! Local expert compute on fwd_expert_count
//!     ↓
//! combine():
//!     1. Undo the regroup, all_to_all_v back
//!     2. Scatter rows to their flat entry by pos
//!     3. Weight by gate scores and sum over top_k
//!     ↓
//! Output [num_tokens, d_model]
//! ```
//!
//! With a single worker steps 3-4 and 1 of combine are skipped.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use tracing::debug;

use super::error::{MoEError, Result};
use super::expert_map::ExpertMap;
use super::fused::{GroupedTokens, MoETokenGrouper};
use crate::distributed::DeviceCommunicator;

/// State captured by dispatch() and consumed by combine().
#[derive(Debug)]
pub struct DispatchMetadata {
    /// Grouping of this worker's own entries.
    pub grouped: GroupedTokens,
    /// Rows per local expert in the expert input batch.
    pub fwd_expert_count: Vec<usize>,
    /// Rows each source worker sends to each local expert,
    /// indexed `src * num_expert + expert`.
    pub global_expert_count: Vec<usize>,
    /// Rows sent to each worker.
    pub send_counts: Vec<usize>,
    /// Rows received from each worker.
    pub recv_counts: Vec<usize>,
    /// Received row for each expert input row (multi-worker only).
    recv_order: Option<Vec<u32>>,
    /// Device.
    pub device: Device,
}

impl DispatchMetadata {
    /// Total rows processed by the local experts.
    pub fn fwd_batch_size(&self) -> usize {
        self.fwd_expert_count.iter().sum()
    }

    pub fn num_tokens(&self) -> usize {
        self.grouped.num_tokens
    }

    pub fn top_k(&self) -> usize {
        self.grouped.top_k
    }
}

/// Dispatcher between gate output and local expert compute.
pub struct TokenDispatcher {
    expert_map: ExpertMap,
    comm: Arc<dyn DeviceCommunicator>,
    grouper: MoETokenGrouper,
}

impl TokenDispatcher {
    /// Create a dispatcher.
    ///
    /// The communicator's process group must match the expert map's world.
    pub fn new(expert_map: ExpertMap, comm: Arc<dyn DeviceCommunicator>) -> Result<Self> {
        let pg = comm.process_group();
        if pg.world_size() != expert_map.world_size() || pg.rank() != expert_map.rank() {
            return Err(MoEError::InvalidConfig(format!(
                "communicator rank {}/{} does not match expert map rank {}/{}",
                pg.rank(),
                pg.world_size(),
                expert_map.rank(),
                expert_map.world_size()
            )));
        }
        let grouper = MoETokenGrouper::new(expert_map.num_expert(), expert_map.world_size());
        Ok(Self {
            expert_map,
            comm,
            grouper,
        })
    }

    /// Group `tokens` by the gate's `[num_tokens, top_k]` expert ids and
    /// deliver them to the owning workers.
    ///
    /// Returns the expert input batch, grouped by ascending local expert,
    /// and the metadata combine() needs.
    pub fn dispatch(
        &self,
        tokens: &Tensor,
        topk_ids: &Tensor,
    ) -> Result<(Tensor, DispatchMetadata)> {
        let grouped = self.grouper.group(topk_ids)?;
        self.dispatch_grouped(tokens, grouped)
    }

    /// Dispatch an already computed grouping.
    pub fn dispatch_grouped(
        &self,
        tokens: &Tensor,
        grouped: GroupedTokens,
    ) -> Result<(Tensor, DispatchMetadata)> {
        let num_tokens = tokens.dim(0)?;
        if num_tokens != grouped.num_tokens {
            return Err(MoEError::CountSumMismatch {
                expected: num_tokens,
                actual: grouped.num_tokens,
            });
        }
        let device = tokens.device();
        let num_expert = self.expert_map.num_expert();
        let world_size = self.expert_map.world_size();

        let local_input = gather_rows(tokens, &grouped.source_rows())?;

        if self.expert_map.is_single() {
            let batch = grouped.batch_size();
            debug!(
                num_tokens,
                batch,
                active_experts = grouped.local_expert_count.iter().filter(|&&c| c > 0).count(),
                "dispatch (single worker)"
            );
            let metadata = DispatchMetadata {
                fwd_expert_count: grouped.local_expert_count.clone(),
                global_expert_count: grouped.local_expert_count.clone(),
                send_counts: vec![batch],
                recv_counts: vec![batch],
                recv_order: None,
                grouped,
                device: device.clone(),
            };
            return Ok((local_input, metadata));
        }

        let send_counts = grouped.send_counts(num_expert);
        let global_expert_count = self.exchange_counts(&grouped.local_expert_count, device)?;
        let recv_counts: Vec<usize> = global_expert_count
            .chunks(num_expert)
            .map(|chunk| chunk.iter().sum())
            .collect();

        let received = self
            .comm
            .all_to_all_v(&local_input, &send_counts, &recv_counts)?;

        let recv_order = expert_major_order(&global_expert_count, num_expert, world_size);
        let fwd_input = gather_rows(&received, &recv_order)?;

        let fwd_expert_count: Vec<usize> = (0..num_expert)
            .map(|e| {
                (0..world_size)
                    .map(|src| global_expert_count[src * num_expert + e])
                    .sum()
            })
            .collect();

        debug!(
            num_tokens,
            sent = grouped.batch_size(),
            received = recv_order.len(),
            rank = self.expert_map.rank(),
            "dispatch (expert parallel)"
        );

        let metadata = DispatchMetadata {
            grouped,
            fwd_expert_count,
            global_expert_count,
            send_counts,
            recv_counts,
            recv_order: Some(recv_order),
            device: device.clone(),
        };
        Ok((fwd_input, metadata))
    }

    /// Return expert outputs to their source workers and scatter them to
    /// flat entry order.
    ///
    /// Output is `[num_tokens * top_k, hidden]`; entries that were not
    /// dispatched are zero.
    pub fn unpermute(&self, expert_output: &Tensor, metadata: &DispatchMetadata) -> Result<Tensor> {
        let local_output = match &metadata.recv_order {
            None => expert_output.clone(),
            Some(order) => {
                let received = gather_rows(expert_output, &inverse_permutation(order))?;
                self.comm
                    .all_to_all_v(&received, &metadata.recv_counts, &metadata.send_counts)?
            }
        };

        let grouped = &metadata.grouped;
        let flat_entries = grouped.num_tokens * grouped.top_k;
        let hidden = local_output.dim(1)?;
        let output = Tensor::zeros((flat_entries, hidden), local_output.dtype(), &metadata.device)?;
        if grouped.pos.is_empty() {
            return Ok(output);
        }

        let pos = Tensor::from_vec(grouped.pos.clone(), grouped.pos.len(), &metadata.device)?;
        Ok(output.index_add(&pos, &local_output, 0)?)
    }

    /// Unpermute expert outputs and reduce them with the gate scores.
    pub fn combine(
        &self,
        expert_output: &Tensor,
        metadata: &DispatchMetadata,
        scores: &Tensor,
    ) -> Result<Tensor> {
        let flat = self.unpermute(expert_output, metadata)?;
        reduce_top_k(&flat, scores, metadata.num_tokens(), metadata.top_k())
    }

    /// Exchange per-expert counts so every worker learns how many rows each
    /// source sends to each of its experts.
    fn exchange_counts(&self, local_expert_count: &[usize], device: &Device) -> Result<Vec<usize>> {
        let counts_tensor = Tensor::from_vec(
            local_expert_count
                .iter()
                .map(|&c| c as u32)
                .collect::<Vec<_>>(),
            local_expert_count.len(),
            device,
        )?;
        let global: Vec<u32> = self.comm.all_to_all(&counts_tensor)?.to_vec1()?;
        Ok(global.into_iter().map(|c| c as usize).collect())
    }

    pub fn expert_map(&self) -> &ExpertMap {
        &self.expert_map
    }

    pub fn grouper(&self) -> &MoETokenGrouper {
        &self.grouper
    }
}

/// Weight `[num_tokens * top_k, hidden]` entries by `[num_tokens, top_k]`
/// scores and sum over top_k.
pub fn reduce_top_k(
    flat: &Tensor,
    scores: &Tensor,
    num_tokens: usize,
    top_k: usize,
) -> Result<Tensor> {
    let hidden = flat.dim(1)?;
    let entries = flat.reshape((num_tokens, top_k, hidden))?;
    let weights = scores
        .to_dtype(flat.dtype())?
        .reshape((num_tokens, top_k, 1))?;
    Ok(entries.broadcast_mul(&weights)?.sum(1)?)
}

/// Row order that turns a source-major receive buffer into an
/// expert-major one.
///
/// Received rows are laid out `(src, expert)`; local experts need them
/// `(expert, src)` so every expert's rows are contiguous.
fn expert_major_order(
    global_expert_count: &[usize],
    num_expert: usize,
    world_size: usize,
) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(global_expert_count.len());
    let mut acc = 0usize;
    for &count in global_expert_count {
        offsets.push(acc);
        acc += count;
    }

    let mut order = Vec::with_capacity(acc);
    for expert in 0..num_expert {
        for src in 0..world_size {
            let idx = src * num_expert + expert;
            let start = offsets[idx];
            order.extend((start..start + global_expert_count[idx]).map(|r| r as u32));
        }
    }
    order
}

fn inverse_permutation(order: &[u32]) -> Vec<u32> {
    let mut inverse = vec![0u32; order.len()];
    for (i, &row) in order.iter().enumerate() {
        inverse[row as usize] = i as u32;
    }
    inverse
}

/// Gather rows by index.
fn gather_rows(tensor: &Tensor, indices: &[u32]) -> Result<Tensor> {
    if indices.is_empty() {
        let hidden = tensor.dim(1)?;
        return Ok(Tensor::zeros((0, hidden), tensor.dtype(), tensor.device())?);
    }
    let index_tensor = Tensor::from_vec(indices.to_vec(), indices.len(), tensor.device())?;
    Ok(tensor.index_select(&index_tensor, 0)?)
}
