//! Mixture of Experts (MoE) module.
//!
//! Routes every token to its top-k experts, runs each expert on a contiguous
//! slice of the tokens assigned to it and recombines the outputs in the
//! original token order.
//!
//! ## Submodules
//!
//! - [`fused`]: Expert counts, token grouping and the fused linear primitive
//! - [`expert_layer`]: Fused-linear and per-expert conv expert banks
//! - [`router`]: Gate trait and the naive top-k gate
//! - [`expert_map`]: Expert placement across workers
//! - [`token_dispatch`]: Scatter, cross-worker exchange and gather
//! - [`mask`]: Per-token expert bypass
//! - [`layer`]: Gate + dispatch + experts over a flat batch
//! - [`transformer`]: Shape-preserving transformer MLP wrapper

mod error;
mod expert_layer;
mod expert_map;
pub mod fused;
mod layer;
mod mask;
mod router;
mod token_dispatch;
mod transformer;

pub use error::{MoEError, Result};
pub use expert_layer::{ConvExpert, ExpertKind, LinearExpert, MoEExperts};
pub use expert_map::ExpertMap;
pub use fused::{ExpertCounts, FusedExpertLinear, GroupedTokens, MoETokenGrouper};
pub use layer::MoELayer;
pub use mask::TokenMask;
pub use router::{top_k_with_indices, GateHook, GateKind, GateOutput, MoEGate, NaiveGate};
pub use token_dispatch::{reduce_top_k, DispatchMetadata, TokenDispatcher};
pub use transformer::MoETransformerMlp;
