//! Chunked, resumable transfer engine.
//!
//! Reconciles three independent sources of state change (local user
//! action, remote peer action, and transport chunk events) into one
//! per-transfer state machine, with pluggable byte conduits, rolling
//! rate estimation, and batched progress notification.
//!
//! The transport and the durable record store are collaborators behind
//! the [`transport::Transport`] and [`store::RecordStore`] traits; the
//! [`coordinator::Coordinator`] ties everything together.

pub mod conduit;
pub mod coordinator;
pub mod estimator;
pub mod file;
pub mod mem;
pub mod store;
pub mod transfer;
pub mod transport;

pub use conduit::{Conduit, ConduitEnd, ConduitFactory, ReceivingConduit, SendingConduit};
pub use coordinator::{Coordinator, ProgressListener, SubscriptionId};
pub use estimator::RateEstimator;
pub use file::{FileConduitFactory, FileSink, FileSource};
pub use mem::{MemorySink, MemorySource};
pub use store::{MemoryStore, RecordStore};
pub use transfer::{ActiveTransfer, InterestMask};
pub use transport::Transport;

use byteferry_protocol::TransferState;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Conduit activation failed; the transfer was aborted.
    #[error("conduit activation failed")]
    BadConduit,

    /// The operation is not valid for the transfer's current state.
    #[error("operation not valid in state {0:?}")]
    InvalidState(TransferState),

    /// A conduit or transport I/O call failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk arrived at an unexpected offset, or an event named a
    /// handle the engine does not know.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// No record with the given id exists.
    #[error("no such transfer: {0}")]
    NotFound(String),
}
