//! Expert placement across workers.
//!
//! Every worker holds `num_expert` experts. Worker `r` owns the contiguous
//! global ids `r * num_expert .. (r + 1) * num_expert`, so grouping entries
//! by ascending global id also groups them by destination worker.
//!
//! ## Example
//!
//! ```
//! use fmoe_core::moe::ExpertMap;
//!
//! // 4 experts on each of 2 workers, viewed from rank 1
//! let map = ExpertMap::new(4, 2, 1);
//! assert_eq!(map.owner_rank(5), 1);
//! assert_eq!(map.to_local(5), Some(1));
//! assert_eq!(map.to_local(2), None);
//! assert_eq!(map.to_global(3), 7);
//! ```

use crate::distributed::DistributedError;

/// Maps global expert ids to the worker that owns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertMap {
    /// Experts held by each worker.
    num_expert: usize,
    /// Number of workers in the expert group.
    world_size: usize,
    /// This worker's rank.
    rank: usize,
}

impl ExpertMap {
    /// Create an expert map.
    ///
    /// # Panics
    /// Panics if `rank >= world_size`.
    pub fn new(num_expert: usize, world_size: usize, rank: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self {
            num_expert,
            world_size,
            rank,
        }
    }

    /// Fallible constructor for ranks coming from a process group.
    pub fn try_new(
        num_expert: usize,
        world_size: usize,
        rank: usize,
    ) -> Result<Self, DistributedError> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self::new(num_expert, world_size, rank))
    }

    /// Expert map for a single worker: all experts are local.
    pub fn single_worker(num_expert: usize) -> Self {
        Self::new(num_expert, 1, 0)
    }

    /// Check if a global expert id is stored on this worker.
    #[inline]
    pub fn is_local(&self, global_id: usize) -> bool {
        self.to_local(global_id).is_some()
    }

    /// Convert a global expert id to this worker's local id.
    #[inline]
    pub fn to_local(&self, global_id: usize) -> Option<usize> {
        let start = self.rank * self.num_expert;
        (start..start + self.num_expert)
            .contains(&global_id)
            .then(|| global_id - start)
    }

    /// Convert a local expert id to its global id.
    #[inline]
    pub fn to_global(&self, local_id: usize) -> usize {
        debug_assert!(local_id < self.num_expert);
        self.rank * self.num_expert + local_id
    }

    /// Rank that owns a global expert id.
    #[inline]
    pub fn owner_rank(&self, global_id: usize) -> usize {
        debug_assert!(global_id < self.total_experts());
        global_id / self.num_expert
    }

    /// Experts stored on each worker.
    #[inline]
    pub fn num_expert(&self) -> usize {
        self.num_expert
    }

    /// Experts across all workers.
    #[inline]
    pub fn total_experts(&self) -> usize {
        self.num_expert * self.world_size
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Whether every expert lives on this worker.
    #[inline]
    pub fn is_single(&self) -> bool {
        self.world_size == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_worker() {
        let map = ExpertMap::single_worker(8);
        assert!(map.is_single());
        assert_eq!(map.total_experts(), 8);
        for id in 0..8 {
            assert!(map.is_local(id));
            assert_eq!(map.to_local(id), Some(id));
            assert_eq!(map.owner_rank(id), 0);
        }
        assert!(!map.is_local(8));
    }

    #[test]
    fn test_multi_worker_ownership() {
        let map = ExpertMap::new(2, 4, 2);
        assert_eq!(map.total_experts(), 8);
        assert_eq!(map.to_local(4), Some(0));
        assert_eq!(map.to_local(5), Some(1));
        assert_eq!(map.to_local(6), None);
        assert_eq!(map.to_global(1), 5);
        assert_eq!(map.owner_rank(7), 3);
        assert_eq!(map.owner_rank(0), 0);
    }

    #[test]
    #[should_panic(expected = "rank must be < world_size")]
    fn test_invalid_rank_panics() {
        ExpertMap::new(4, 2, 2);
    }

    #[test]
    fn test_try_new_invalid_rank() {
        assert!(matches!(
            ExpertMap::try_new(4, 2, 3),
            Err(DistributedError::InvalidRank {
                rank: 3,
                world_size: 2
            })
        ));
    }
}
