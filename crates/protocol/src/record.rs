use serde::{Deserialize, Serialize};

use crate::types::{Direction, PauseFlags, PeerId, TransferState, UsageKind};

/// Durable view of one logical transfer.
///
/// This layout is the on-disk contract. The engine is the sole writer of
/// `state`, `pause_flags` and `resume_offset`; the persistence layer is
/// the durability authority. `resumption_tag` and `serialized_conduit`
/// are opaque to the engine and must round-trip byte-for-byte across
/// process restarts (they are base64 in JSON form).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    pub peer: PeerId,
    pub direction: Direction,
    pub state: TransferState,
    pub pause_flags: PauseFlags,
    pub usage: UsageKind,
    /// Total size in bytes; `None` until the sending side reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<u64>,
    /// Name as specified by the sender; the on-disk name may differ.
    pub file_name: String,
    /// Where the received file ended up. Absent until the transfer is Ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
    /// Transport-assigned identifier matching a resumed session to this
    /// transfer. Empty means the transport offered none.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub resumption_tag: Vec<u8>,
    /// Conduit-defined encoding from which an equivalent conduit can be
    /// reconstructed. Empty means the conduit does not support snapshots.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub serialized_conduit: Vec<u8>,
    /// Last durably flushed byte offset. A resumed transfer seeks here,
    /// which may re-request bytes delivered after the last flush.
    #[serde(default)]
    pub resume_offset: u64,
}

impl TransferRecord {
    /// `true` if an interrupted transfer can come back: it needs a
    /// resumption tag to match the peer's resume offer against.
    pub fn has_resumption_tag(&self) -> bool {
        !self.resumption_tag.is_empty()
    }
}

/// Serde adapter encoding `Vec<u8>` as standard base64 in human-readable
/// formats, so opaque tags survive JSON round-trips byte-for-byte.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
