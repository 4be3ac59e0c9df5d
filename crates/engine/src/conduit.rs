//! Conduit capability set: pluggable byte sources and sinks.
//!
//! A conduit backs exactly one transfer and is owned exclusively by it.
//! The engine drives the lifecycle: [`Conduit::become_active`] before
//! first use, [`Conduit::will_complete`] once the last chunk has been
//! exchanged, [`Conduit::become_inactive`] before the conduit is idled
//! indefinitely. Seeking and snapshots are optional; both are required
//! for a transfer to survive interruption.

use std::io;
use std::path::PathBuf;

use byteferry_protocol::Direction;

/// Base lifecycle capability shared by senders and receivers.
pub trait Conduit: Send {
    /// Notifies the conduit that it is about to be used. A good place to
    /// open files. Failure aborts the transfer with `BadConduit`.
    fn become_active(&mut self) -> io::Result<()>;

    /// Notifies the conduit that it will see no activity for an
    /// indefinite amount of time. Best-effort cleanup; must not block
    /// indefinitely.
    fn become_inactive(&mut self);

    /// The last chunk has been sent or received.
    fn will_complete(&mut self);

    /// Whether [`Conduit::seek_to`] is implemented. Transfers whose
    /// conduit cannot seek are not resumable.
    fn supports_seek(&self) -> bool {
        false
    }

    /// Repositions the conduit to an absolute byte offset. Must be
    /// idempotent: a resumed transfer may seek to an offset whose bytes
    /// were already exchanged before the interruption.
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        let _ = offset;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "conduit does not support seeking",
        ))
    }

    /// Opaque encoding from which an equivalent conduit can be rebuilt
    /// by a [`ConduitFactory`] after a process restart. `None` means the
    /// conduit is only resumable within the current process.
    fn snapshot(&self) -> Option<Vec<u8>> {
        None
    }
}

/// A byte source backing an outbound transfer.
pub trait SendingConduit: Conduit {
    /// Total size in bytes of the offered data. Callable at any time,
    /// including before activation.
    fn size(&self) -> u64;

    /// Produces up to `max_len` bytes at the current position. A short
    /// return near the end of the data is fine; an empty return before
    /// the reported size is exhausted is an error on the conduit's part.
    fn read(&mut self, max_len: usize) -> io::Result<Vec<u8>>;
}

/// A byte sink backing an inbound transfer.
pub trait ReceivingConduit: Conduit {
    /// Consumes the given bytes at the current position.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Where the received data ended up, once complete. `None` means the
    /// data is not addressable (or the transfer has not completed).
    fn final_location(&self) -> Option<PathBuf>;
}

/// Direction-tagged conduit, carried by one active transfer.
pub enum ConduitEnd {
    Sending(Box<dyn SendingConduit>),
    Receiving(Box<dyn ReceivingConduit>),
}

impl ConduitEnd {
    pub fn direction(&self) -> Direction {
        match self {
            ConduitEnd::Sending(_) => Direction::Outbound,
            ConduitEnd::Receiving(_) => Direction::Inbound,
        }
    }

    /// Upcasts to the base capability for lifecycle calls.
    pub fn base_mut(&mut self) -> &mut dyn Conduit {
        match self {
            ConduitEnd::Sending(c) => c.as_mut(),
            ConduitEnd::Receiving(c) => c.as_mut(),
        }
    }

    pub fn supports_seek(&self) -> bool {
        match self {
            ConduitEnd::Sending(c) => c.supports_seek(),
            ConduitEnd::Receiving(c) => c.supports_seek(),
        }
    }

    pub fn snapshot(&self) -> Option<Vec<u8>> {
        match self {
            ConduitEnd::Sending(c) => c.snapshot(),
            ConduitEnd::Receiving(c) => c.snapshot(),
        }
    }
}

/// Reconstructs conduits from their snapshots when a transfer is resumed
/// after a process restart.
pub trait ConduitFactory: Send + Sync {
    fn restore(&self, direction: Direction, snapshot: &[u8]) -> io::Result<ConduitEnd>;
}
