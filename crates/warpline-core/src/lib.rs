//! Warpline synchronization core.
//!
//! Sans-IO engine for optimistic (Time Warp) discrete-event simulation. A
//! [`Node`] owns a partition of logical processes, executes their events
//! speculatively, and reconciles with other nodes purely through messages:
//!
//! ```text
//!  Model::on_event ──> EventContext ──> Communicator::insert_outgoing_msg
//!                                             │ (per-node queues, lazy packing)
//!                                             ▼
//!                              send_outgoing_msgs ──> NodeAction::SendBatch
//!
//!  Node::receive ──> Communicator::ingest (slab, validate, decode, release)
//!                        │
//!                        ├─ Positive ──> LogicalProcess input queue (straggler? rollback)
//!                        ├─ Anti     ──> cancel entry (processed? rollback first)
//!                        └─ Control  ──> route() ──> RendezvousEngine
//!
//!  GVT channel ──> GvtCoordinator (Mattern colours) ──> fossil collection
//! ```
//!
//! # Design
//!
//! - Action-based: `Node::step` returns [`NodeAction`]s; the driver performs
//!   all I/O
//! - Time-abstracted: wall-clock reads go through [`Environment`]
//! - Collaborators injected: [`Model`], [`CheckpointStore`], [`MetricsSink`]
//!   and [`Scheduler`] are supplied by the embedder

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod comm;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod gvt;
pub mod lp;
pub mod metrics;
pub mod model;
pub mod node;
pub mod placement;
pub mod pool;
pub mod rendezvous;
pub mod rollback;
pub mod scheduler;

pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpoints, Retained};
pub use comm::{Batch, Communicator, Inbound, SequenceTracker, Shutdown, pack_msg};
pub use config::{NodeConfig, PoolGrowth, RetryPolicy};
pub use dispatch::{AgentEvent, RendezvousStep, Route, route};
pub use env::Environment;
pub use error::{CoreError, Violation, ViolationTracker};
pub use gvt::{Adoption, GvtCoordinator, GvtOutbox, MASTER, PhaseLedger, RoundRecord};
pub use lp::{Entry, EntryKey, Insert, LogicalProcess, OutgoingRecord, Rank};
pub use metrics::{CounterSink, MetricsSink, Stat};
pub use model::{EventContext, Model, PageRequest, ScheduleError, Scheduled};
pub use node::{INITIAL_SENDER, Node, NodeAction, NodeReport};
pub use placement::Placement;
pub use pool::{PoolError, SlabBuffer, SlabPool};
pub use rendezvous::{
    Expired, Lend, LendRecord, RendezvousEngine, RendezvousError, RollbackOutcome, Session, SessionState,
    UnblockOutcome,
};
pub use rollback::{RollbackReport, send_antimessages};
pub use scheduler::{LowestTimestampFirst, Runnable, Scheduler};
