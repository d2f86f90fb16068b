//! Device communicator for the collectives the MoE layer needs.
//!
//! Token exchange between expert workers is an all-to-all with variable
//! splits; the model-parallel group gathers outputs with all-gather. The
//! transport itself lives outside this crate behind [`DeviceCommunicator`].

use candle_core::Tensor;

use super::error::{DistributedError, Result};
use super::process_group::ProcessGroup;

/// Trait for worker-to-worker communication.
///
/// Implementations can wrap a real transport, or be no-ops for a single
/// worker.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-gather: gather tensors from all ranks along dimension.
    ///
    /// Input shape: [dim0, dim1, ...]
    /// Output shape: [dim0 * world_size, dim1, ...] (if gather_dim=0)
    ///
    /// For a single worker, this is identity.
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// All-to-all: each rank sends distinct data to each other rank.
    ///
    /// Input tensor is split into `world_size` equal chunks along dimension 0.
    /// Chunk i is sent to rank i, and this rank receives chunk j from rank j.
    ///
    /// For a single worker, this is identity.
    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Variable-size all-to-all: each rank sends/receives different amounts
    /// to/from each rank.
    ///
    /// # Arguments
    /// * `tensor` - Input tensor, size along dim 0 equals sum of send_splits
    /// * `send_splits` - Rows to send to each rank (length = world_size)
    /// * `recv_splits` - Rows to receive from each rank (length = world_size)
    ///
    /// Output tensor has size sum(recv_splits) along dimension 0.
    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor>;
}

/// Communicator for in-process execution.
///
/// With one rank every collective is the identity. With a simulated
/// multi-rank group it reproduces the output shapes of the real collectives
/// so the dispatch bookkeeping can be exercised without a transport.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    /// Create a new mock communicator with the given process group.
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }

    fn check_splits(&self, splits: &[usize]) -> Result<()> {
        let world_size = self.process_group.world_size();
        if splits.len() != world_size {
            return Err(DistributedError::SplitLengthMismatch {
                expected: world_size,
                actual: splits.len(),
            });
        }
        Ok(())
    }
}

impl<P: ProcessGroup> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        // Every simulated rank holds the same shard.
        let world_size = self.process_group.world_size();
        let tensors: Vec<Tensor> = (0..world_size).map(|_| tensor.clone()).collect();
        Ok(Tensor::cat(&tensors, gather_dim)?)
    }

    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor> {
        let world_size = self.process_group.world_size();
        let rows = tensor.dim(0)?;
        if rows % world_size != 0 {
            return Err(DistributedError::ShapeMismatch {
                expected: vec![rows.div_ceil(world_size) * world_size],
                actual: tensor.dims().to_vec(),
            });
        }
        Ok(tensor.clone())
    }

    fn all_to_all_v(
        &self,
        tensor: &Tensor,
        send_splits: &[usize],
        recv_splits: &[usize],
    ) -> Result<Tensor> {
        self.check_splits(send_splits)?;
        self.check_splits(recv_splits)?;

        let total_send: usize = send_splits.iter().sum();
        let total_recv: usize = recv_splits.iter().sum();
        let dims = tensor.dims();

        if dims.is_empty() || dims[0] != total_send {
            return Err(DistributedError::ShapeMismatch {
                expected: vec![total_send],
                actual: dims.to_vec(),
            });
        }

        if total_send == total_recv {
            return Ok(tensor.clone());
        }

        if total_recv < total_send {
            Ok(tensor.narrow(0, 0, total_recv)?)
        } else {
            let mut new_dims = dims.to_vec();
            new_dims[0] = total_recv - total_send;
            let pad = Tensor::zeros(new_dims.as_slice(), tensor.dtype(), tensor.device())?;
            Ok(Tensor::cat(&[tensor, &pad], 0)?)
        }
    }
}
