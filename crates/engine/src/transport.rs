//! Transport seam.
//!
//! The engine drives the transport through this trait; transport events
//! come back in through the coordinator's `on_*` methods. Control
//! signals are fire-and-forget: the engine logs delivery failures and
//! infers acknowledgement from subsequent chunk events.

use std::io;

use byteferry_protocol::{ControlSignal, PeerId, TransportHandle, UsageKind};

pub trait Transport: Send + Sync {
    /// Offers an outbound transfer to `peer`. Returns the session-scoped
    /// handle and the opaque resumption tag the transport assigned (empty
    /// when the transport supports none).
    fn offer(
        &self,
        peer: PeerId,
        name: &str,
        size: u64,
        usage: UsageKind,
    ) -> io::Result<(TransportHandle, Vec<u8>)>;

    /// Accepts an inbound (or resumed) transfer handle.
    fn accept(&self, peer: PeerId, handle: TransportHandle) -> io::Result<()>;

    /// Sends a pause/resume/cancel signal for a live handle.
    fn control(
        &self,
        peer: PeerId,
        handle: TransportHandle,
        signal: ControlSignal,
    ) -> io::Result<()>;

    /// Delivers one outbound chunk at the given offset.
    fn send_chunk(
        &self,
        peer: PeerId,
        handle: TransportHandle,
        offset: u64,
        data: &[u8],
    ) -> io::Result<()>;
}
