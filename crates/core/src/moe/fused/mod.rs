//! Fused expert primitives for grouped token batches.
//!
//! Implements the permute-compute-unpermute pattern:
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌───────────────────────┐
//! │    Gate     │──▶│  Group by expert │──▶│  Fused per-expert     │
//! │ (top-k ids) │   │  (pos + counts)  │   │  projection (offsets) │
//! └─────────────┘   └──────────────────┘   └───────────┬───────────┘
//!                                                      │
//!                    ┌─────────────────────────────────▼───────────┐
//!                    │   Scatter back by pos, reduce over top-k    │
//!                    └─────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`expert_count`]: Validated per-expert counts and their offset table
//! - [`token_grouper`]: Stable grouping of (token, k) entries by expert
//! - [`linear`]: One weight tensor for all experts, sliced by offsets

mod expert_count;
mod linear;
mod token_grouper;

pub use expert_count::{ExpertCounts, ExpertSegment};
pub use linear::FusedExpertLinear;
pub use token_grouper::{GroupedTokens, MoETokenGrouper};
