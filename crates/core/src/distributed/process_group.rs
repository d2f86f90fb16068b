//! Process group abstractions for expert and model parallelism.
//!
//! A process group is the set of workers that take part in a collective.
//! The expert group spreads `num_expert * world_size` experts over its
//! workers; the model-parallel group splits the token batch.

use super::error::{DistributedError, Result};

/// Trait for process group operations.
///
/// A process group manages rank assignment and provides the foundation
/// for collective communications.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this worker within the group (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of workers in the group.
    fn world_size(&self) -> usize;

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-worker group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// In-process group with a fixed rank and size.
///
/// With `world_size = 1` every collective is the identity. Larger sizes are
/// used to drive multi-worker bookkeeping on a single process.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Create a single-worker group.
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Create a group with a specific rank and size.
    pub fn with_rank(rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}
