//! Per-transfer runtime state.
//!
//! An [`ActiveTransfer`] is the hot, non-persisted half of a transfer.
//! All mutations happen inside the coordinator's serialized paths; the
//! status quartet (state, bytes moved, byte size, rate) is additionally
//! published through atomics so UI code can read it from any thread
//! without taking the hot lock. A few milliseconds of staleness is fine
//! there.

use std::ops::BitOr;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use byteferry_protocol::{
    Direction, PauseFlags, PeerId, TransferProgress, TransferState, TransportHandle,
};

use crate::conduit::ConduitEnd;
use crate::estimator::RateEstimator;

/// Sentinel for "sender has not reported a size yet".
const SIZE_UNKNOWN: u64 = u64::MAX;

/// Which transfer properties a progress listener cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestMask(pub u8);

impl InterestMask {
    pub const PROGRESS: InterestMask = InterestMask(1);
    pub const ETA: InterestMask = InterestMask(1 << 1);
    pub const BYTES_MOVED: InterestMask = InterestMask(1 << 2);
    pub const STATE: InterestMask = InterestMask(1 << 3);
    pub const ALL: InterestMask = InterestMask(0b1111);

    pub fn intersects(self, other: InterestMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for InterestMask {
    type Output = InterestMask;

    fn bitor(self, rhs: InterestMask) -> InterestMask {
        InterestMask(self.0 | rhs.0)
    }
}

pub(crate) struct TransferInner {
    pub(crate) conduit: Option<ConduitEnd>,
    pub(crate) estimator: RateEstimator,
    pub(crate) conduit_open: bool,
    pub(crate) resumption_tag: Vec<u8>,
}

/// Runtime state machine of one in-progress or resumable transfer.
pub struct ActiveTransfer {
    peer: PeerId,
    direction: Direction,
    record_id: String,
    handle: AtomicU32,
    state: AtomicU8,
    pause_flags: AtomicU8,
    byte_size: AtomicU64,
    bytes_moved: AtomicU64,
    bytes_per_second: AtomicU64,
    changed: AtomicU8,
    inner: Mutex<TransferInner>,
}

impl ActiveTransfer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        peer: PeerId,
        direction: Direction,
        record_id: String,
        handle: TransportHandle,
        state: TransferState,
        pause_flags: PauseFlags,
        byte_size: Option<u64>,
        conduit: Option<ConduitEnd>,
        resumption_tag: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            direction,
            record_id,
            handle: AtomicU32::new(handle.0),
            state: AtomicU8::new(state as u8),
            pause_flags: AtomicU8::new(pause_flags.0),
            byte_size: AtomicU64::new(byte_size.unwrap_or(SIZE_UNKNOWN)),
            bytes_moved: AtomicU64::new(0),
            bytes_per_second: AtomicU64::new(0),
            changed: AtomicU8::new(0),
            inner: Mutex::new(TransferInner {
                conduit,
                estimator: RateEstimator::new(),
                conduit_open: false,
                resumption_tag,
            }),
        })
    }

    // -- published, lock-free status ------------------------------------

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle(self.handle.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> TransferState {
        // Only the engine writes this field, always with a valid repr.
        TransferState::from_u8(self.state.load(Ordering::Relaxed))
            .unwrap_or(TransferState::Canceled)
    }

    pub fn pause_flags(&self) -> PauseFlags {
        PauseFlags(self.pause_flags.load(Ordering::Relaxed))
    }

    pub fn byte_size(&self) -> Option<u64> {
        match self.byte_size.load(Ordering::Relaxed) {
            SIZE_UNKNOWN => None,
            size => Some(size),
        }
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved.load(Ordering::Relaxed)
    }

    /// Rolling average over the trailing ten seconds.
    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second.load(Ordering::Relaxed)
    }

    /// Completed fraction in [0, 1]; 0 while the size is unknown.
    pub fn progress(&self) -> f64 {
        match self.byte_size() {
            Some(0) => 1.0,
            Some(size) => (self.bytes_moved() as f64 / size as f64).clamp(0.0, 1.0),
            None => 0.0,
        }
    }

    /// Time until completion at the current rate; `None` when the rate is
    /// zero or the size is unknown.
    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        let size = self.byte_size()?;
        let rate = self.bytes_per_second();
        if rate == 0 {
            return None;
        }
        let remaining = size.saturating_sub(self.bytes_moved());
        Some(Duration::from_secs_f64(remaining as f64 / rate as f64))
    }

    /// Point-in-time snapshot for listeners.
    pub fn progress_snapshot(&self) -> TransferProgress {
        TransferProgress {
            record_id: self.record_id.clone(),
            state: self.state(),
            byte_size: self.byte_size(),
            bytes_moved: self.bytes_moved(),
            progress: self.progress(),
            bytes_per_second: self.bytes_per_second(),
            eta_seconds: self
                .estimated_time_remaining()
                .map_or(-1, |eta| eta.as_secs() as i64),
        }
    }

    // -- mutations (coordinator-internal) -------------------------------

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, TransferInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: TransferState) {
        let old = self.state.swap(state as u8, Ordering::Relaxed);
        if old != state as u8 {
            tracing::debug!(
                record = %self.record_id,
                from = ?TransferState::from_u8(old),
                to = ?state,
                "transfer state changed"
            );
            self.mark_changed(InterestMask::STATE);
        }
    }

    pub(crate) fn set_pause_flags(&self, flags: PauseFlags) {
        self.pause_flags.store(flags.0, Ordering::Relaxed);
    }

    pub(crate) fn set_handle(&self, handle: TransportHandle) {
        self.handle.store(handle.0, Ordering::Relaxed);
    }

    /// Sets the total size once the sender reports it. Later reports are
    /// ignored: the size is fixed once known.
    pub(crate) fn set_byte_size(&self, size: u64) {
        let was = self
            .byte_size
            .compare_exchange(SIZE_UNKNOWN, size, Ordering::Relaxed, Ordering::Relaxed);
        if was.is_ok() {
            self.mark_changed(InterestMask::PROGRESS | InterestMask::ETA);
        }
    }

    /// Rewinds the byte counter to a persisted resume offset.
    pub(crate) fn set_bytes_moved(&self, offset: u64) {
        self.bytes_moved.store(offset, Ordering::Relaxed);
        self.mark_changed(
            InterestMask::BYTES_MOVED | InterestMask::PROGRESS | InterestMask::ETA,
        );
    }

    /// Advances the byte counter by one chunk, clamped to the known size,
    /// and feeds the estimator.
    pub(crate) fn advance(&self, n: u64) {
        let size = self.byte_size.load(Ordering::Relaxed);
        let mut moved = self.bytes_moved.load(Ordering::Relaxed).saturating_add(n);
        if size != SIZE_UNKNOWN {
            moved = moved.min(size);
        }
        self.bytes_moved.store(moved, Ordering::Relaxed);

        let mut inner = self.lock_inner();
        inner.estimator.record(n);
        self.bytes_per_second
            .store(inner.estimator.bytes_per_second(), Ordering::Relaxed);
        drop(inner);

        self.mark_changed(
            InterestMask::BYTES_MOVED | InterestMask::PROGRESS | InterestMask::ETA,
        );
    }

    /// Zero-length chunk event: refresh the estimator window only.
    pub(crate) fn keep_alive(&self) {
        let mut inner = self.lock_inner();
        inner.estimator.touch();
        self.bytes_per_second
            .store(inner.estimator.bytes_per_second(), Ordering::Relaxed);
        drop(inner);
        self.mark_changed(InterestMask::ETA);
    }

    fn mark_changed(&self, mask: InterestMask) {
        self.changed.fetch_or(mask.0, Ordering::Relaxed);
    }

    /// Drains the accumulated change bits for one notification pass.
    pub(crate) fn take_changed(&self) -> InterestMask {
        InterestMask(self.changed.swap(0, Ordering::Relaxed))
    }

    // -- conduit lifecycle ----------------------------------------------

    /// Opens the conduit if it is not open yet.
    pub(crate) fn activate_conduit(&self, inner: &mut TransferInner) -> Result<(), crate::EngineError> {
        if inner.conduit_open {
            return Ok(());
        }
        let conduit = inner.conduit.as_mut().ok_or(crate::EngineError::BadConduit)?;
        if let Err(e) = conduit.base_mut().become_active() {
            tracing::warn!(record = %self.record_id, error = %e, "conduit activation failed");
            return Err(crate::EngineError::BadConduit);
        }
        inner.conduit_open = true;
        Ok(())
    }

    /// Idles the conduit (best-effort).
    pub(crate) fn idle_conduit(&self, inner: &mut TransferInner) {
        if !inner.conduit_open {
            return;
        }
        if let Some(conduit) = inner.conduit.as_mut() {
            conduit.base_mut().become_inactive();
        }
        inner.conduit_open = false;
    }

    /// Last chunk exchanged: `will_complete`, then `become_inactive`.
    pub(crate) fn finish_conduit(&self, inner: &mut TransferInner) {
        if let Some(conduit) = inner.conduit.as_mut() {
            conduit.base_mut().will_complete();
        }
        self.idle_conduit(inner);
    }

    /// An interrupted transfer can come back only when its conduit can
    /// seek and the transport gave it a resumption tag.
    pub(crate) fn is_resumable(&self, inner: &TransferInner) -> bool {
        let seekable = inner.conduit.as_ref().is_some_and(|c| c.supports_seek());
        seekable && !inner.resumption_tag.is_empty()
    }
}
