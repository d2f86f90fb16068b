//! Error types for the MoE layer.

use thiserror::Error;

use crate::distributed::DistributedError;

/// Errors raised by expert dispatch and computation.
///
/// Everything except `Tensor` and `Distributed` is a caller contract
/// violation and is reported before any computation starts.
#[derive(Error, Debug)]
pub enum MoEError {
    /// Count vector does not have one entry per local expert.
    #[error("expert count length mismatch: expected {expected} experts, got {actual}")]
    CountLengthMismatch { expected: usize, actual: usize },

    /// Count vector does not sum to the number of tokens supplied.
    #[error("expert count sum mismatch: {expected} tokens supplied, counts sum to {actual}")]
    CountSumMismatch { expected: usize, actual: usize },

    /// Unknown expert implementation selector.
    #[error("unsupported expert implementation '{0}' (expected 'linear' or 'conv')")]
    UnsupportedExpert(String),

    /// Unknown activation name.
    #[error("unsupported activation '{0}'")]
    UnsupportedActivation(String),

    /// Unknown gate name.
    #[error("unsupported gate '{0}'")]
    UnsupportedGate(String),

    /// Unknown data-parallel communication tag.
    #[error("unsupported expert_dp_comm '{0}'")]
    UnsupportedDpComm(String),

    /// Auxiliary gating features do not match the input's leading shape.
    #[error("gate input shape mismatch: expected leading dims {expected:?}, got {actual:?}")]
    GateInputShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Token batch has the wrong feature dimension or rank.
    #[error("token shape mismatch: expected [_, {d_model}], got {actual:?}")]
    TokenShapeMismatch { d_model: usize, actual: Vec<usize> },

    /// Token mask does not cover the flattened batch.
    #[error("mask length mismatch: expected {expected} tokens, got {actual}")]
    MaskLengthMismatch { expected: usize, actual: usize },

    /// A mask value has no registered fill vector.
    #[error("no fill vector registered for mask value {0}")]
    MissingMaskFill(u32),

    /// Inconsistent construction parameters.
    #[error("invalid MoE config: {0}")]
    InvalidConfig(String),

    /// Cross-worker exchange failed.
    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MoEError>;
