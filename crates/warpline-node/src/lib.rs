//! Warpline node runtime.
//!
//! Everything the sans-IO core leaves out: a clock, a network and a loop.
//!
//! ## Architecture
//!
//! ```text
//! warpline-node
//!   ├─ TokioEnv          (Environment on the tokio clock)
//!   ├─ Transport         (ChannelTransport in-process, StreamTransport over bytes)
//!   ├─ NodeRunner        (drives Node::step, priority inbox, deferred bodies)
//!   ├─ run_in_process    (one task per node, for demos and tests)
//!   └─ Phold             (benchmark model)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cluster;
mod env;
mod error;
pub mod phold;
mod runner;
pub mod transport;

pub use cluster::{ClusterRun, run_in_process};
pub use env::TokioEnv;
pub use error::{RunnerError, TransportError};
pub use phold::{Phold, PholdConfig, PholdState};
pub use runner::{DEFAULT_IDLE_WAIT, NodeRunner};
pub use transport::{ChannelTransport, Envelope, StreamTransport, Transport};
