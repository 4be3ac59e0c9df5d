//! Transfer coordinator: registry, event routing, persistence flush and
//! the batched notification pass.
//!
//! One coordinator serializes all state mutation for its transfers:
//! control commands and transport events funnel through it, conduit I/O
//! is offloaded to the blocking pool, and the published status atomics
//! on each [`ActiveTransfer`] stay readable from anywhere. Progress
//! listeners run only inside the scheduled flush pass, never inside
//! chunk-event handling, and are invoked with no coordinator lock held.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteferry_protocol::{
    ControlSignal, Direction, PauseFlags, PeerId, TransferProgress, TransferRecord, TransferState,
    TransportHandle, UsageKind,
};

use crate::EngineError;
use crate::conduit::{ConduitEnd, ConduitFactory, ReceivingConduit, SendingConduit};
use crate::store::RecordStore;
use crate::transfer::{ActiveTransfer, InterestMask};
use crate::transport::Transport;

/// Default interval between persistence flushes / notification passes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with a progress snapshot during a notification pass.
pub type ProgressListener = Box<dyn Fn(&TransferProgress) + Send + Sync>;

/// Handle returned by [`Coordinator::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    interest: InterestMask,
    listener: ProgressListener,
}

#[derive(Default)]
struct Registry {
    by_record: HashMap<String, Arc<ActiveTransfer>>,
    by_handle: HashMap<(PeerId, Direction, u32), String>,
    subscriptions: HashMap<String, Vec<Arc<Subscription>>>,
}

/// Tracks all live transfers and schedules persistence and progress
/// notification.
pub struct Coordinator {
    transport: Arc<dyn Transport>,
    store: Arc<dyn RecordStore>,
    factory: Option<Arc<dyn ConduitFactory>>,
    registry: Mutex<Registry>,
    flush_interval: Duration,
    next_subscription: AtomicU64,
    stop: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl Coordinator {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            transport,
            store,
            factory: None,
            registry: Mutex::new(Registry::default()),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            next_subscription: AtomicU64::new(1),
            stop: Mutex::new(None),
        }
    }

    /// Registers the factory used to rebuild conduits when a transfer is
    /// resumed after a process restart.
    pub fn with_conduit_factory(mut self, factory: Arc<dyn ConduitFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    // -- caller-facing surface ------------------------------------------

    /// Starts an outbound transfer.
    ///
    /// The record is created `Paused` with the self bit set; call
    /// [`Coordinator::resume`] to let bytes flow.
    pub fn send(
        &self,
        name: &str,
        source: Box<dyn SendingConduit>,
        peer: PeerId,
        usage: UsageKind,
    ) -> Result<(Arc<ActiveTransfer>, String), EngineError> {
        let size = source.size();
        let (handle, tag) = self.transport.offer(peer, name, size, usage)?;
        let serialized = source.snapshot().unwrap_or_default();

        let record_id = self.store.create(TransferRecord {
            id: String::new(),
            peer,
            direction: Direction::Outbound,
            state: TransferState::Paused,
            pause_flags: PauseFlags::SELF,
            usage,
            byte_size: Some(size),
            file_name: name.to_string(),
            storage_location: None,
            resumption_tag: tag.clone(),
            serialized_conduit: serialized,
            resume_offset: 0,
        });

        let transfer = ActiveTransfer::new(
            peer,
            Direction::Outbound,
            record_id.clone(),
            handle,
            TransferState::Paused,
            PauseFlags::SELF,
            Some(size),
            Some(ConduitEnd::Sending(source)),
            tag,
        );
        self.register(&transfer);
        tracing::debug!(record = %record_id, peer = peer.0, size, "outbound transfer created");
        Ok((transfer, record_id))
    }

    /// Accepts an incoming offer by attaching a receiving conduit.
    ///
    /// Valid only while the record is `WaitingConfirmation`.
    pub fn accept_incoming(
        &self,
        record_id: &str,
        sink: Box<dyn ReceivingConduit>,
    ) -> Result<Arc<ActiveTransfer>, EngineError> {
        let transfer = self
            .lookup(record_id)
            .ok_or_else(|| EngineError::NotFound(record_id.to_string()))?;
        let state = transfer.state();
        if state != TransferState::WaitingConfirmation {
            return Err(EngineError::InvalidState(state));
        }

        let mut inner = transfer.lock_inner();
        inner.conduit = Some(ConduitEnd::Receiving(sink));
        let serialized = inner.conduit.as_ref().and_then(|c| c.snapshot());
        if transfer.activate_conduit(&mut inner).is_err() {
            drop(inner);
            self.abort(&transfer, true);
            return Err(EngineError::BadConduit);
        }
        drop(inner);

        if let Err(e) = self.transport.accept(transfer.peer(), transfer.handle()) {
            self.abort(&transfer, false);
            return Err(EngineError::Io(e));
        }

        let next = if transfer.pause_flags().is_clear() {
            TransferState::Loading
        } else {
            TransferState::Paused
        };
        transfer.set_state(next);
        self.store.update(record_id, &mut |r| {
            if let Some(bytes) = &serialized {
                r.serialized_conduit = bytes.clone();
            }
        });
        self.persist_now(&transfer);
        Ok(transfer)
    }

    /// Returns the live handle for a record, if it is `Loading` or
    /// `Paused`. Terminal and interrupted transfers read their final
    /// data from the persisted record instead.
    pub fn active_transfer_for(&self, record_id: &str) -> Option<Arc<ActiveTransfer>> {
        self.lookup(record_id).filter(|t| t.state().is_live())
    }

    /// Raises the self pause bit.
    pub fn pause(&self, transfer: &Arc<ActiveTransfer>) -> Result<(), EngineError> {
        let state = transfer.state();
        if !state.is_live() {
            return Err(EngineError::InvalidState(state));
        }
        transfer.set_pause_flags(transfer.pause_flags().with(PauseFlags::SELF));
        transfer.set_state(TransferState::Paused);
        self.persist_now(transfer);
        self.signal(transfer, ControlSignal::Pause);
        Ok(())
    }

    /// Clears the self pause bit. Bytes flow again only once the peer's
    /// bit is clear too.
    pub fn resume(&self, transfer: &Arc<ActiveTransfer>) -> Result<(), EngineError> {
        let state = transfer.state();
        if !state.is_live() {
            return Err(EngineError::InvalidState(state));
        }
        let flags = transfer.pause_flags().without(PauseFlags::SELF);
        transfer.set_pause_flags(flags);
        if flags.is_clear() {
            let mut inner = transfer.lock_inner();
            if transfer.activate_conduit(&mut inner).is_err() {
                drop(inner);
                self.abort(transfer, true);
                return Err(EngineError::BadConduit);
            }
            drop(inner);
            transfer.set_state(TransferState::Loading);
        }
        self.persist_now(transfer);
        self.signal(transfer, ControlSignal::Resume);
        Ok(())
    }

    /// Cancels the transfer. Always succeeds for a non-terminal transfer
    /// and is terminal: resources are released and the transport is told
    /// to drop the handle.
    pub fn cancel(&self, transfer: &Arc<ActiveTransfer>) -> Result<(), EngineError> {
        let state = transfer.state();
        if state.is_terminal() {
            return Err(EngineError::InvalidState(state));
        }
        let mut inner = transfer.lock_inner();
        transfer.idle_conduit(&mut inner);
        drop(inner);
        transfer.set_state(TransferState::Canceled);
        self.drop_route(transfer);
        self.persist_now(transfer);
        // An interrupted transfer has no live handle to signal on.
        if state != TransferState::Interrupted {
            self.signal(transfer, ControlSignal::Cancel);
        }
        Ok(())
    }

    /// Registers a progress listener for one transfer, filtered by the
    /// given interest mask.
    pub fn subscribe(
        &self,
        transfer: &Arc<ActiveTransfer>,
        interest: InterestMask,
        listener: ProgressListener,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.lock().unwrap();
        registry
            .subscriptions
            .entry(transfer.record_id().to_string())
            .or_default()
            .push(Arc::new(Subscription {
                id,
                interest,
                listener,
            }));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut registry = self.registry.lock().unwrap();
        for subs in registry.subscriptions.values_mut() {
            subs.retain(|s| s.id != id);
        }
    }

    // -- transport-facing events ----------------------------------------

    /// The remote peer offered an inbound transfer. Creates a
    /// `WaitingConfirmation` record and returns its id.
    pub fn on_incoming_offer(
        &self,
        peer: PeerId,
        handle: TransportHandle,
        name: &str,
        size: Option<u64>,
        usage: UsageKind,
        tag: Vec<u8>,
    ) -> String {
        let record_id = self.store.create(TransferRecord {
            id: String::new(),
            peer,
            direction: Direction::Inbound,
            state: TransferState::WaitingConfirmation,
            pause_flags: PauseFlags::NOBODY,
            usage,
            byte_size: size,
            file_name: name.to_string(),
            storage_location: None,
            resumption_tag: tag.clone(),
            serialized_conduit: vec![],
            resume_offset: 0,
        });
        let transfer = ActiveTransfer::new(
            peer,
            Direction::Inbound,
            record_id.clone(),
            handle,
            TransferState::WaitingConfirmation,
            PauseFlags::NOBODY,
            size,
            None,
            tag,
        );
        self.register(&transfer);
        tracing::debug!(record = %record_id, peer = peer.0, name, "incoming offer");
        record_id
    }

    /// The sender reported the transfer's total size.
    pub fn on_size_known(
        &self,
        peer: PeerId,
        handle: TransportHandle,
        size: u64,
    ) -> Result<(), EngineError> {
        let transfer = self
            .route(peer, Direction::Inbound, handle)
            .ok_or_else(|| unknown_handle(peer, handle))?;
        transfer.set_byte_size(size);
        Ok(())
    }

    /// The transport wants up to `max_len` bytes at `position` for an
    /// outbound transfer.
    pub async fn on_chunk_request(
        &self,
        peer: PeerId,
        handle: TransportHandle,
        position: u64,
        max_len: usize,
    ) -> Result<(), EngineError> {
        let transfer = self
            .route(peer, Direction::Outbound, handle)
            .ok_or_else(|| unknown_handle(peer, handle))?;
        match transfer.state() {
            TransferState::Loading => {}
            state => {
                tracing::debug!(record = %transfer.record_id(), ?state, "chunk request while not loading, dropped");
                return Ok(());
            }
        }
        if max_len == 0 {
            transfer.keep_alive();
            return Ok(());
        }
        if position != transfer.bytes_moved() {
            return Err(self.mismatch(&transfer, position));
        }

        let t = Arc::clone(&transfer);
        let read = tokio::task::spawn_blocking(move || {
            let mut inner = t.lock_inner();
            match inner.conduit.as_mut() {
                Some(ConduitEnd::Sending(c)) => c.read(max_len),
                _ => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no sending conduit attached",
                )),
            }
        })
        .await
        .map_err(io::Error::other)?;

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.conduit_failure(&transfer, e)),
        };
        // Safe point: a control command may have landed during the read.
        // A pause still completes this event, since the conduit cursor
        // has already moved past these bytes; it takes effect at the next
        // one. For cancel and interruption the chunk is dropped: the
        // conduit is idled, and a later resume seeks back to the
        // persisted offset anyway.
        if !transfer.state().is_live() {
            return Ok(());
        }
        if bytes.is_empty() {
            let e = io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "sending conduit produced no data before the reported size",
            );
            return Err(self.conduit_failure(&transfer, e));
        }
        if let Err(e) = self.transport.send_chunk(peer, handle, position, &bytes) {
            return Err(self.conduit_failure(&transfer, e));
        }
        transfer.advance(bytes.len() as u64);
        self.maybe_complete(&transfer).await;
        Ok(())
    }

    /// The transport delivered one inbound chunk.
    pub async fn on_chunk_received(
        &self,
        peer: PeerId,
        handle: TransportHandle,
        position: u64,
        bytes: Vec<u8>,
    ) -> Result<(), EngineError> {
        let transfer = self
            .route(peer, Direction::Inbound, handle)
            .ok_or_else(|| unknown_handle(peer, handle))?;
        match transfer.state() {
            TransferState::Loading => {}
            state => {
                tracing::debug!(record = %transfer.record_id(), ?state, "chunk while not loading, dropped");
                return Ok(());
            }
        }
        if bytes.is_empty() {
            transfer.keep_alive();
            return Ok(());
        }
        if position != transfer.bytes_moved() {
            return Err(self.mismatch(&transfer, position));
        }
        if let Some(size) = transfer.byte_size() {
            if position + bytes.len() as u64 > size {
                return Err(self.mismatch(&transfer, position + bytes.len() as u64));
            }
        }

        let n = bytes.len() as u64;
        let t = Arc::clone(&transfer);
        let written = tokio::task::spawn_blocking(move || {
            let mut inner = t.lock_inner();
            match inner.conduit.as_mut() {
                Some(ConduitEnd::Receiving(c)) => c.write(&bytes),
                _ => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no receiving conduit attached",
                )),
            }
        })
        .await
        .map_err(io::Error::other)?;

        if let Err(e) = written {
            return Err(self.conduit_failure(&transfer, e));
        }
        // The write is already durable, so the byte counter advances even
        // when a pause or cancel landed mid-write: the sink and the
        // counter must not disagree on the next expected offset.
        transfer.advance(n);
        self.maybe_complete(&transfer).await;
        Ok(())
    }

    /// The remote peer paused, resumed, or canceled its side.
    pub fn on_peer_control(
        &self,
        peer: PeerId,
        handle: TransportHandle,
        signal: ControlSignal,
    ) -> Result<(), EngineError> {
        let transfer = self
            .route(peer, Direction::Outbound, handle)
            .or_else(|| self.route(peer, Direction::Inbound, handle))
            .ok_or_else(|| unknown_handle(peer, handle))?;
        let state = transfer.state();
        match signal {
            ControlSignal::Pause => {
                if state.is_live() {
                    transfer.set_pause_flags(transfer.pause_flags().with(PauseFlags::PEER));
                    transfer.set_state(TransferState::Paused);
                    self.persist_now(&transfer);
                }
            }
            ControlSignal::Resume => {
                let flags = transfer.pause_flags().without(PauseFlags::PEER);
                transfer.set_pause_flags(flags);
                if state == TransferState::Paused && flags.is_clear() {
                    let mut inner = transfer.lock_inner();
                    if transfer.activate_conduit(&mut inner).is_err() {
                        drop(inner);
                        self.abort(&transfer, true);
                        return Err(EngineError::BadConduit);
                    }
                    drop(inner);
                    transfer.set_state(TransferState::Loading);
                }
                self.persist_now(&transfer);
            }
            ControlSignal::Cancel => {
                let mut inner = transfer.lock_inner();
                transfer.idle_conduit(&mut inner);
                drop(inner);
                transfer.set_state(TransferState::Canceled);
                self.drop_route(&transfer);
                self.persist_now(&transfer);
            }
        }
        Ok(())
    }

    /// The transport session with `peer` is gone. Every live transfer
    /// with that peer becomes `Interrupted` if it can come back (seekable
    /// conduit plus resumption tag), `Canceled` otherwise.
    pub fn on_session_ended(&self, peer: PeerId) {
        let affected: Vec<Arc<ActiveTransfer>> = {
            let registry = self.registry.lock().unwrap();
            registry
                .by_record
                .values()
                .filter(|t| t.peer() == peer && !t.state().is_terminal())
                .filter(|t| t.state() != TransferState::Interrupted)
                .cloned()
                .collect()
        };
        for transfer in affected {
            self.interrupt_or_cancel(&transfer);
        }
    }

    /// The peer offered a fresh session for a previously interrupted
    /// transfer, identified by its resumption tag. Reactivates the
    /// conduit (rebuilding it through the conduit factory when the
    /// process restarted in between), seeks to the persisted resume
    /// offset and rejoins the transport. Returns the record id.
    pub fn on_resume_offer(
        &self,
        peer: PeerId,
        handle: TransportHandle,
        tag: &[u8],
    ) -> Result<String, EngineError> {
        let record = self
            .store
            .find_by_tag(tag)
            .ok_or_else(|| EngineError::NotFound("no record matches resumption tag".into()))?;
        if record.state != TransferState::Interrupted {
            return Err(EngineError::InvalidState(record.state));
        }

        let transfer = match self.lookup(&record.id) {
            Some(t) => t,
            None => {
                let factory = self.factory.as_ref().ok_or(EngineError::BadConduit)?;
                if record.serialized_conduit.is_empty() {
                    return Err(EngineError::BadConduit);
                }
                let conduit = factory.restore(record.direction, &record.serialized_conduit)?;
                let t = ActiveTransfer::new(
                    record.peer,
                    record.direction,
                    record.id.clone(),
                    handle,
                    TransferState::Interrupted,
                    record.pause_flags,
                    record.byte_size,
                    Some(conduit),
                    record.resumption_tag.clone(),
                );
                self.registry
                    .lock()
                    .unwrap()
                    .by_record
                    .insert(record.id.clone(), Arc::clone(&t));
                t
            }
        };

        let mut inner = transfer.lock_inner();
        if transfer.activate_conduit(&mut inner).is_err() {
            drop(inner);
            self.abort(&transfer, false);
            return Err(EngineError::BadConduit);
        }
        let seek = match inner.conduit.as_mut() {
            Some(conduit) => conduit.base_mut().seek_to(record.resume_offset),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no conduit")),
        };
        if let Err(e) = seek {
            tracing::warn!(record = %record.id, error = %e, "seek to resume offset failed");
            transfer.idle_conduit(&mut inner);
            drop(inner);
            transfer.set_state(TransferState::Canceled);
            self.persist_now(&transfer);
            return Err(EngineError::Io(e));
        }
        inner.estimator.reset();
        drop(inner);

        transfer.set_handle(handle);
        transfer.set_bytes_moved(record.resume_offset);
        // The peer is the one offering; its pause bit cannot still hold.
        let flags = record.pause_flags.without(PauseFlags::PEER);
        transfer.set_pause_flags(flags);

        if let Err(e) = self.transport.accept(peer, handle) {
            self.abort(&transfer, false);
            return Err(EngineError::Io(e));
        }
        transfer.set_state(if flags.is_clear() {
            TransferState::Loading
        } else {
            TransferState::Paused
        });
        self.registry
            .lock()
            .unwrap()
            .by_handle
            .insert((peer, record.direction, handle.0), record.id.clone());
        self.persist_now(&transfer);
        tracing::debug!(record = %record.id, offset = record.resume_offset, "transfer resumed");
        Ok(record.id)
    }

    // -- scheduled flush / notification pass ----------------------------

    /// Starts the periodic flush + notification task.
    ///
    /// Call [`Coordinator::stop`] to cancel.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        {
            let mut stop = self.stop.lock().unwrap();
            // Stop any existing task.
            drop(stop.take());
            *stop = Some(tx);
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.flush_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.flush(),
                    _ = &mut rx => break,
                }
            }
        });
    }

    /// Stops the periodic task.
    pub fn stop(&self) {
        let mut stop = self.stop.lock().unwrap();
        // Dropping the sender signals the task to exit.
        drop(stop.take());
    }

    /// Runs one flush + notification pass synchronously: dirty transfers
    /// are written to the store in batch mode, listeners whose interest
    /// intersects the accumulated changes are invoked, and transfers
    /// that reached a terminal state are detached.
    ///
    /// Listeners run outside the registry lock, so they may call back
    /// into the coordinator.
    pub fn flush(&self) {
        let mut dirty = Vec::new();
        let mut parting = Vec::new();
        {
            let registry = self.registry.lock().unwrap();
            for (id, transfer) in &registry.by_record {
                let changed = transfer.take_changed();
                if !changed.is_empty() {
                    let subs = registry
                        .subscriptions
                        .get(id)
                        .map(|s| s.to_vec())
                        .unwrap_or_default();
                    dirty.push((id.clone(), Arc::clone(transfer), changed, subs));
                }
                if transfer.state().is_terminal() {
                    parting.push(id.clone());
                }
            }
        }

        if !dirty.is_empty() {
            self.store.set_batch(true);
            for (id, transfer, _, _) in &dirty {
                self.store.update(id, &mut |r| write_back(r, transfer));
            }
            self.store.set_batch(false);

            for (_, transfer, changed, subs) in &dirty {
                if subs.is_empty() {
                    continue;
                }
                let snapshot = transfer.progress_snapshot();
                for sub in subs {
                    if sub.interest.intersects(*changed) {
                        (sub.listener)(&snapshot);
                    }
                }
            }
        }

        if !parting.is_empty() {
            let mut registry = self.registry.lock().unwrap();
            for id in &parting {
                registry.by_record.remove(id);
                registry.subscriptions.remove(id);
            }
            registry.by_handle.retain(|_, id| !parting.contains(id));
        }
    }

    // -- internals ------------------------------------------------------

    fn register(&self, transfer: &Arc<ActiveTransfer>) {
        let mut registry = self.registry.lock().unwrap();
        registry
            .by_record
            .insert(transfer.record_id().to_string(), Arc::clone(transfer));
        registry.by_handle.insert(
            (transfer.peer(), transfer.direction(), transfer.handle().0),
            transfer.record_id().to_string(),
        );
    }

    fn lookup(&self, record_id: &str) -> Option<Arc<ActiveTransfer>> {
        self.registry
            .lock()
            .unwrap()
            .by_record
            .get(record_id)
            .cloned()
    }

    fn route(
        &self,
        peer: PeerId,
        direction: Direction,
        handle: TransportHandle,
    ) -> Option<Arc<ActiveTransfer>> {
        let registry = self.registry.lock().unwrap();
        let id = registry.by_handle.get(&(peer, direction, handle.0))?;
        registry.by_record.get(id).cloned()
    }

    /// Removes the transport route. The transfer stays registered by
    /// record until the flush pass has delivered its final notification.
    fn drop_route(&self, transfer: &ActiveTransfer) {
        let mut registry = self.registry.lock().unwrap();
        registry.by_handle.remove(&(
            transfer.peer(),
            transfer.direction(),
            transfer.handle().0,
        ));
    }

    /// Writes the transfer's durable fields through immediately, for
    /// discrete user-visible transitions. The dirty bits stay set so the
    /// next flush pass still notifies listeners.
    fn persist_now(&self, transfer: &ActiveTransfer) {
        self.store
            .update(transfer.record_id(), &mut |r| write_back(r, transfer));
    }

    fn signal(&self, transfer: &ActiveTransfer, signal: ControlSignal) {
        if let Err(e) = self
            .transport
            .control(transfer.peer(), transfer.handle(), signal)
        {
            // Fire-and-forget: acknowledgement is inferred from chunks.
            tracing::warn!(record = %transfer.record_id(), ?signal, error = %e, "control signal failed");
        }
    }

    /// Cancels a transfer after a local fault (bad conduit, dead
    /// transport accept). `signal_peer` says whether the handle is still
    /// live enough to tell the other side.
    fn abort(&self, transfer: &Arc<ActiveTransfer>, signal_peer: bool) {
        let mut inner = transfer.lock_inner();
        transfer.idle_conduit(&mut inner);
        drop(inner);
        transfer.set_state(TransferState::Canceled);
        self.drop_route(transfer);
        self.persist_now(transfer);
        if signal_peer {
            self.signal(transfer, ControlSignal::Cancel);
        }
    }

    /// A chunk arrived at the wrong offset: fail the transfer and build
    /// the error to hand back.
    fn mismatch(&self, transfer: &Arc<ActiveTransfer>, position: u64) -> EngineError {
        let err = EngineError::ProtocolMismatch(format!(
            "chunk at offset {position}, transfer {} is at {}",
            transfer.record_id(),
            transfer.bytes_moved()
        ));
        tracing::warn!(record = %transfer.record_id(), position, at = transfer.bytes_moved(), "chunk offset mismatch");
        self.interrupt_or_cancel(transfer);
        err
    }

    /// A conduit or transport I/O call failed mid-transfer.
    fn conduit_failure(&self, transfer: &Arc<ActiveTransfer>, e: io::Error) -> EngineError {
        tracing::warn!(record = %transfer.record_id(), error = %e, "transfer I/O failed");
        self.interrupt_or_cancel(transfer);
        EngineError::Io(e)
    }

    /// Moves a transfer off the live path: `Interrupted` when it can be
    /// resumed later, `Canceled` otherwise.
    fn interrupt_or_cancel(&self, transfer: &Arc<ActiveTransfer>) {
        let state = transfer.state();
        if state.is_terminal() || state == TransferState::Interrupted {
            return;
        }
        let mut inner = transfer.lock_inner();
        let resumable = transfer.is_resumable(&inner);
        transfer.idle_conduit(&mut inner);
        drop(inner);

        if resumable {
            transfer.set_state(TransferState::Interrupted);
            self.drop_route(transfer);
        } else {
            transfer.set_state(TransferState::Canceled);
            self.drop_route(transfer);
        }
        self.persist_now(transfer);
    }

    /// Finishes a transfer whose byte counter reached the known size.
    async fn maybe_complete(&self, transfer: &Arc<ActiveTransfer>) {
        if !transfer.state().is_live() {
            return;
        }
        let Some(size) = transfer.byte_size() else {
            return;
        };
        if transfer.bytes_moved() < size {
            return;
        }

        let t = Arc::clone(transfer);
        let location = tokio::task::spawn_blocking(move || {
            let mut inner = t.lock_inner();
            t.finish_conduit(&mut inner);
            match inner.conduit.as_ref() {
                Some(ConduitEnd::Receiving(c)) => c.final_location(),
                _ => None,
            }
        })
        .await
        .ok()
        .flatten();

        transfer.set_state(TransferState::Ready);
        self.store.update(transfer.record_id(), &mut |r| {
            write_back(r, transfer);
            if let Some(location) = &location {
                r.storage_location = Some(location.display().to_string());
            }
        });
        self.drop_route(transfer);
        tracing::debug!(record = %transfer.record_id(), bytes = size, "transfer complete");
    }
}

/// Copies the engine-owned durable fields into a record.
fn write_back(record: &mut TransferRecord, transfer: &ActiveTransfer) {
    record.state = transfer.state();
    record.pause_flags = transfer.pause_flags();
    if record.byte_size.is_none() {
        record.byte_size = transfer.byte_size();
    }
    record.resume_offset = transfer.bytes_moved();
}

fn unknown_handle(peer: PeerId, handle: TransportHandle) -> EngineError {
    EngineError::ProtocolMismatch(format!(
        "no live transfer for peer {} handle {}",
        peer.0, handle.0
    ))
}
