use serde::{Deserialize, Serialize};

/// Stable identifier of a remote peer, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

/// Transport-assigned, session-scoped transfer handle.
///
/// Valid only while the transfer is live with the transport. Never
/// persisted: resumption across sessions matches on the opaque
/// resumption tag instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u32);

/// Direction of a transfer, from the local side's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// How the transferred file is meant to be used by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// Ordinary file transfer.
    Data,
    /// Inline image shown without user interaction.
    Sticker,
}

/// Coarse control signal sent to (or received from) the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Resume,
    Cancel,
}

/// Lifecycle state of a transfer.
///
/// `Canceled` and `Ready` are terminal. `Interrupted` is neither terminal
/// nor live: the transport session is gone, but the transfer can come back
/// through a resume offer if its conduit and resumption tag survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TransferState {
    /// Inbound only: the remote has offered, we have not accepted yet.
    WaitingConfirmation = 0,
    /// Bytes are eligible to flow (they actually flow iff no pause bit is set).
    Loading = 1,
    /// At least one pause bit is set and the session is still live.
    Paused = 2,
    /// Terminal, not resumable.
    Canceled = 3,
    /// Terminal, not resumable: the transfer completed.
    Ready = 4,
    /// Session dropped; resumable if conduit and resumption tag are intact.
    Interrupted = 5,
}

impl TransferState {
    /// Decodes a state from its `repr(u8)` value (the atomic publication form).
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::WaitingConfirmation),
            1 => Some(Self::Loading),
            2 => Some(Self::Paused),
            3 => Some(Self::Canceled),
            4 => Some(Self::Ready),
            5 => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// `true` for `Canceled` and `Ready`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Ready)
    }

    /// `true` while the transfer has a live transport session and a
    /// conduit attached (`Loading` or `Paused`).
    pub fn is_live(self) -> bool {
        matches!(self, Self::Loading | Self::Paused)
    }
}

/// Who is holding up a transfer.
///
/// Bytes flow iff no bit is set. Each side owns its own bit: the engine
/// sets and clears [`PauseFlags::SELF`] on local pause/resume and mirrors
/// the remote's signals into [`PauseFlags::PEER`], but never clears the
/// peer's bit on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PauseFlags(pub u8);

impl PauseFlags {
    pub const NOBODY: PauseFlags = PauseFlags(0);
    pub const SELF: PauseFlags = PauseFlags(1);
    pub const PEER: PauseFlags = PauseFlags(1 << 1);
    pub const BOTH: PauseFlags = PauseFlags(0b11);

    pub fn contains(self, other: PauseFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: PauseFlags) -> PauseFlags {
        PauseFlags(self.0 | other.0)
    }

    #[must_use]
    pub fn without(self, other: PauseFlags) -> PauseFlags {
        PauseFlags(self.0 & !other.0)
    }

    /// `true` when nobody is pausing, i.e. bytes may flow.
    pub fn is_clear(self) -> bool {
        self.0 == 0
    }
}

/// Point-in-time status snapshot delivered to progress listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub record_id: String,
    pub state: TransferState,
    /// Total size in bytes; `None` until the sender reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<u64>,
    pub bytes_moved: u64,
    /// Completed fraction in [0, 1]; 0 while the size is unknown.
    pub progress: f64,
    /// Rolling average over the trailing ten seconds.
    pub bytes_per_second: u64,
    /// Seconds until completion at the current rate; -1 means indeterminate.
    pub eta_seconds: i64,
}
