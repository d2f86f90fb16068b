//! Distributed abstractions for expert and model parallelism.
//!
//! - [`ProcessGroup`] - Rank and world size of a worker group
//! - [`DeviceCommunicator`] - Collectives used by token dispatch
//!
//! A single worker (`world_size = 1`) bypasses every collective. Real
//! transports implement [`DeviceCommunicator`] outside this crate.
//!
//! # Usage
//!
//! ```
//! use fmoe_core::distributed::{LocalProcessGroup, ProcessGroup};
//!
//! let pg = LocalProcessGroup::new();
//! assert_eq!(pg.world_size(), 1);
//! ```

mod communicator;
mod error;
mod process_group;

pub use communicator::{DeviceCommunicator, MockCommunicator};
pub use error::DistributedError;
pub use process_group::{LocalProcessGroup, ProcessGroup};

use std::sync::Arc;

/// Communicator for a single in-process worker.
pub fn single_worker() -> Arc<dyn DeviceCommunicator> {
    Arc::new(MockCommunicator::new(LocalProcessGroup::new()))
}
