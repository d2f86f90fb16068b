//! Token grouping by expert assignment.
//!
//! Turns the gate's `[num_tokens, top_k]` expert ids into the permutation
//! that lays every (token, k) entry out contiguously by ascending global
//! expert id, plus the per-expert entry counts:
//! 1. Count entries per expert
//! 2. Prefix-sum the counts into start offsets
//! 3. Scatter flat entry indices to their grouped positions (stable)

use candle_core::{DType, Tensor};

use super::super::error::Result;

/// Result of grouping one batch of expert assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedTokens {
    /// Grouped position -> flat entry index (`token * top_k + k`).
    ///
    /// Length is the number of dispatched entries; entries whose expert id
    /// is out of range are not dispatched.
    pub pos: Vec<u32>,
    /// Entries routed to each global expert id, length `num_expert * world_size`.
    pub local_expert_count: Vec<usize>,
    /// Number of tokens in the batch.
    pub num_tokens: usize,
    /// Experts per token.
    pub top_k: usize,
}

impl GroupedTokens {
    /// Number of dispatched entries.
    pub fn batch_size(&self) -> usize {
        self.pos.len()
    }

    /// Source token row for every grouped position.
    pub fn source_rows(&self) -> Vec<u32> {
        let top_k = self.top_k as u32;
        self.pos.iter().map(|&p| p / top_k).collect()
    }

    /// Entries sent to each worker, given `num_expert` experts per worker.
    pub fn send_counts(&self, num_expert: usize) -> Vec<usize> {
        self.local_expert_count
            .chunks(num_expert.max(1))
            .map(|chunk| chunk.iter().sum())
            .collect()
    }
}

/// Groups (token, k) entries by global expert id.
#[derive(Debug, Clone)]
pub struct MoETokenGrouper {
    num_expert: usize,
    world_size: usize,
}

impl MoETokenGrouper {
    /// Create a grouper for `num_expert` experts on each of `world_size` workers.
    pub fn new(num_expert: usize, world_size: usize) -> Self {
        Self {
            num_expert,
            world_size,
        }
    }

    /// Total number of experts across all workers.
    pub fn total_experts(&self) -> usize {
        self.num_expert * self.world_size
    }

    /// Group a `[num_tokens, top_k]` tensor of expert ids.
    pub fn group(&self, topk_ids: &Tensor) -> Result<GroupedTokens> {
        let (num_tokens, top_k) = topk_ids.dims2()?;
        let ids: Vec<u32> = topk_ids.flatten_all()?.to_dtype(DType::U32)?.to_vec1()?;
        Ok(self.group_ids(&ids, num_tokens, top_k))
    }

    /// Group flat expert ids laid out as `[num_tokens, top_k]`.
    ///
    /// Ids `>= total_experts()` mark entries that are not dispatched.
    pub fn group_ids(&self, ids: &[u32], num_tokens: usize, top_k: usize) -> GroupedTokens {
        let total_experts = self.total_experts();

        let mut local_expert_count = vec![0usize; total_experts];
        for &id in ids {
            if let Some(count) = local_expert_count.get_mut(id as usize) {
                *count += 1;
            }
        }

        let mut offsets = Vec::with_capacity(total_experts);
        let mut acc = 0usize;
        for &count in &local_expert_count {
            offsets.push(acc);
            acc += count;
        }

        let mut pos = vec![0u32; acc];
        for (flat_idx, &id) in ids.iter().enumerate() {
            if let Some(offset) = offsets.get_mut(id as usize) {
                pos[*offset] = flat_idx as u32;
                *offset += 1;
            }
        }

        GroupedTokens {
            pos,
            local_expert_count,
            num_tokens,
            top_k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_token_grouper_basic() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(4, 1);

        // Token 0 -> experts [2, 3]
        // Token 1 -> experts [1, 2]
        // Token 2 -> experts [1, 3]
        // Token 3 -> experts [1, 2]
        let topk_ids = Tensor::new(&[[2u32, 3], [1, 2], [1, 3], [1, 2]], &device).unwrap();

        let grouped = grouper.group(&topk_ids).unwrap();

        assert_eq!(grouped.local_expert_count, vec![0, 3, 3, 2]);
        // Expert 1: entries 2, 4, 6; expert 2: 0, 3, 7; expert 3: 1, 5
        assert_eq!(grouped.pos, vec![2, 4, 6, 0, 3, 7, 1, 5]);
        assert_eq!(grouped.source_rows(), vec![1, 2, 3, 0, 1, 3, 0, 2]);
        assert_eq!(grouped.batch_size(), 8);
    }

    #[test]
    fn test_token_grouper_keeps_order_within_expert() {
        let grouper = MoETokenGrouper::new(2, 1);
        let grouped = grouper.group_ids(&[0, 0, 1, 1], 4, 1);

        assert_eq!(grouped.pos, vec![0, 1, 2, 3]);
        assert_eq!(grouped.local_expert_count, vec![2, 2]);
    }

    #[test]
    fn test_token_grouper_drops_invalid_ids() {
        let grouper = MoETokenGrouper::new(2, 1);
        let grouped = grouper.group_ids(&[1, u32::MAX, 0, 7], 4, 1);

        assert_eq!(grouped.pos, vec![2, 0]);
        assert_eq!(grouped.local_expert_count, vec![1, 1]);
        assert_eq!(grouped.batch_size(), 2);
    }

    #[test]
    fn test_token_grouper_send_counts() {
        let grouper = MoETokenGrouper::new(2, 2);
        let grouped = grouper.group_ids(&[0, 3, 2, 2, 1, 0], 3, 2);

        assert_eq!(grouped.local_expert_count, vec![2, 1, 2, 1]);
        assert_eq!(grouped.send_counts(2), vec![3, 3]);
    }

    #[test]
    fn test_token_grouper_i64_ids() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(3, 1);
        let topk_ids = Tensor::new(&[[2i64], [0], [2]], &device).unwrap();

        let grouped = grouper.group(&topk_ids).unwrap();
        assert_eq!(grouped.pos, vec![1, 0, 2]);
        assert_eq!(grouped.local_expert_count, vec![1, 0, 2]);
    }
}
