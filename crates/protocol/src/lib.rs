//! Shared types on the transfer engine's boundaries.
//!
//! Everything here is either persisted (the [`record::TransferRecord`]
//! layout is the on-disk contract) or handed across the engine's public
//! surface (states, pause flags, progress snapshots). The engine crate
//! depends on this; conduit and transport implementations only need this
//! plus the engine's trait definitions.

pub mod record;
pub mod types;

pub use record::TransferRecord;
pub use types::{
    ControlSignal, Direction, PauseFlags, PeerId, TransferProgress, TransferState,
    TransportHandle, UsageKind,
};
