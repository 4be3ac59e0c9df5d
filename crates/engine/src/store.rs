//! Persistence seam.
//!
//! The engine never talks to a database directly: it goes through
//! [`RecordStore`], and the durability authority lives behind it. The
//! batch mode exists because byte-progress flushes are high-frequency
//! and should not fan out a change notification per record write.

use std::collections::HashMap;
use std::sync::RwLock;

use byteferry_protocol::TransferRecord;

/// Durable store for transfer records.
pub trait RecordStore: Send + Sync {
    /// Stores a new record. An empty `id` is replaced with a freshly
    /// assigned unique one; a non-empty `id` is kept (records re-seeded
    /// from disk after a restart). Returns the record's id.
    fn create(&self, record: TransferRecord) -> String;

    fn get(&self, id: &str) -> Option<TransferRecord>;

    /// Applies `mutator` to the record in place. Returns `false` when no
    /// such record exists.
    fn update(&self, id: &str, mutator: &mut dyn FnMut(&mut TransferRecord)) -> bool;

    fn delete(&self, id: &str) -> bool;

    /// Finds the record carrying exactly this resumption tag.
    fn find_by_tag(&self, tag: &[u8]) -> Option<TransferRecord>;

    /// While enabled, implementations should suppress per-write change
    /// notifications (bulk progress flush). Discrete user-visible
    /// transitions are written outside batch mode.
    fn set_batch(&self, enabled: bool);
}

/// Callback invoked with the updated record after a non-batched write.
pub type ChangeListener = Box<dyn Fn(&TransferRecord) + Send + Sync>;

/// In-memory [`RecordStore`] with change listeners.
///
/// The default store for tests and for embedders that persist elsewhere.
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

struct StoreInner {
    records: HashMap<String, TransferRecord>,
    listeners: Vec<ChangeListener>,
    batch: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                records: HashMap::new(),
                listeners: Vec::new(),
                batch: false,
            }),
        }
    }

    /// Registers a change listener.
    pub fn on_change(&self, listener: ChangeListener) {
        let mut inner = self.inner.write().unwrap();
        inner.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryStore {
    fn create(&self, mut record: TransferRecord) -> String {
        if record.id.is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }
        let id = record.id.clone();
        let mut inner = self.inner.write().unwrap();
        inner.records.insert(id.clone(), record);
        id
    }

    fn get(&self, id: &str) -> Option<TransferRecord> {
        self.inner.read().unwrap().records.get(id).cloned()
    }

    fn update(&self, id: &str, mutator: &mut dyn FnMut(&mut TransferRecord)) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(record) = inner.records.get_mut(id) else {
            return false;
        };
        mutator(record);
        if !inner.batch {
            let record = inner.records[id].clone();
            for listener in &inner.listeners {
                listener(&record);
            }
        }
        true
    }

    fn delete(&self, id: &str) -> bool {
        self.inner.write().unwrap().records.remove(id).is_some()
    }

    fn find_by_tag(&self, tag: &[u8]) -> Option<TransferRecord> {
        if tag.is_empty() {
            return None;
        }
        let inner = self.inner.read().unwrap();
        inner
            .records
            .values()
            .find(|r| r.resumption_tag == tag)
            .cloned()
    }

    fn set_batch(&self, enabled: bool) {
        self.inner.write().unwrap().batch = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use byteferry_protocol::{Direction, PauseFlags, PeerId, TransferState, UsageKind};

    fn sample_record() -> TransferRecord {
        TransferRecord {
            id: String::new(),
            peer: PeerId(3),
            direction: Direction::Outbound,
            state: TransferState::Paused,
            pause_flags: PauseFlags::SELF,
            usage: UsageKind::Data,
            byte_size: Some(1000),
            file_name: "report.pdf".into(),
            storage_location: None,
            resumption_tag: b"tag-1".to_vec(),
            serialized_conduit: vec![],
            resume_offset: 0,
        }
    }

    #[test]
    fn create_assigns_id_and_get_roundtrips() {
        let store = MemoryStore::new();
        let id = store.create(sample_record());
        assert!(!id.is_empty());

        let record = store.get(&id).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.file_name, "report.pdf");
    }

    #[test]
    fn create_keeps_preexisting_id() {
        let store = MemoryStore::new();
        let mut record = sample_record();
        record.id = "seeded".into();
        assert_eq!(store.create(record), "seeded");
        assert!(store.get("seeded").is_some());
    }

    #[test]
    fn update_mutates_in_place() {
        let store = MemoryStore::new();
        let id = store.create(sample_record());
        let ok = store.update(&id, &mut |r| {
            r.state = TransferState::Loading;
            r.resume_offset = 512;
        });
        assert!(ok);
        let record = store.get(&id).unwrap();
        assert_eq!(record.state, TransferState::Loading);
        assert_eq!(record.resume_offset, 512);
    }

    #[test]
    fn update_missing_record_returns_false() {
        let store = MemoryStore::new();
        assert!(!store.update("nope", &mut |_| {}));
    }

    #[test]
    fn find_by_tag_matches_exact_bytes() {
        let store = MemoryStore::new();
        let id = store.create(sample_record());
        assert_eq!(store.find_by_tag(b"tag-1").unwrap().id, id);
        assert!(store.find_by_tag(b"tag-2").is_none());
        assert!(store.find_by_tag(b"").is_none());
    }

    #[test]
    fn batch_mode_suppresses_listeners() {
        let store = MemoryStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        store.on_change(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let id = store.create(sample_record());
        store.update(&id, &mut |r| r.resume_offset = 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        store.set_batch(true);
        store.update(&id, &mut |r| r.resume_offset = 2);
        store.update(&id, &mut |r| r.resume_offset = 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        store.set_batch(false);
        store.update(&id, &mut |r| r.resume_offset = 4);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn delete_removes_record() {
        let store = MemoryStore::new();
        let id = store.create(sample_record());
        assert!(store.delete(&id));
        assert!(!store.delete(&id));
        assert!(store.get(&id).is_none());
    }
}
