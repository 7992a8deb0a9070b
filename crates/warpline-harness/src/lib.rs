//! Deterministic simulation harness for warpline.
//!
//! # Why Deterministic Simulation?
//!
//! Optimistic synchronization bugs hide in interleavings: a straggler that
//! arrives one message earlier, an antimessage that overtakes a write-back.
//! Real threads and sockets make those orders unrepeatable. Here:
//!
//! - [`SimCluster`] runs every node in one thread, choosing which node steps
//!   and which link delivers next from a seed
//! - [`SimEnv`] is a clock that only moves when told to
//! - [`sequential`] is the reference: the same model executed in timestamp
//!   order with no speculation
//! - [`PageModel`] exercises page rendezvous with observable side effects
//!
//! Turmoil tests in `tests/` run the real tokio runtime over simulated TCP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod oracle;
pub mod page_model;
mod sim_env;

pub use cluster::{SimCluster, SimConfig, SimError, SimNode, SimRun, message_body};
pub use oracle::{OracleError, OracleRun, sequential};
pub use page_model::{Command, PAGES_PER_LP, PageModel, PageState, borrow};
pub use sim_env::{SimEnv, SimInstant};
