fn main() {
    println!("Run `cargo test -p engine-scenarios` to execute the end-to-end transfer scenarios.");
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use byteferry_engine::{
        ActiveTransfer, Coordinator, FileConduitFactory, FileSink, FileSource, InterestMask,
        MemoryStore, RecordStore, Transport,
    };
    use byteferry_protocol::{
        ControlSignal, PeerId, TransferState, TransportHandle, UsageKind,
    };
    use tempfile::TempDir;

    const PEER: PeerId = PeerId(1);

    /// Loopback transport that records everything the engine sends.
    struct RecordingTransport {
        next_handle: AtomicU32,
        chunks: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_handle: AtomicU32::new(1),
                chunks: Mutex::new(Vec::new()),
            })
        }

        /// All sent chunks concatenated in offset order.
        fn sent_payload(&self) -> Vec<u8> {
            let mut chunks = self.chunks.lock().unwrap().clone();
            chunks.sort_by_key(|(offset, _)| *offset);
            chunks.into_iter().flat_map(|(_, data)| data).collect()
        }
    }

    impl Transport for RecordingTransport {
        fn offer(
            &self,
            _peer: PeerId,
            name: &str,
            _size: u64,
            _usage: UsageKind,
        ) -> io::Result<(TransportHandle, Vec<u8>)> {
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
            Ok((TransportHandle(handle), format!("{name}#{handle}").into_bytes()))
        }

        fn accept(&self, _peer: PeerId, _handle: TransportHandle) -> io::Result<()> {
            Ok(())
        }

        fn control(
            &self,
            _peer: PeerId,
            _handle: TransportHandle,
            _signal: ControlSignal,
        ) -> io::Result<()> {
            Ok(())
        }

        fn send_chunk(
            &self,
            _peer: PeerId,
            _handle: TransportHandle,
            offset: u64,
            data: &[u8],
        ) -> io::Result<()> {
            self.chunks.lock().unwrap().push((offset, data.to_vec()));
            Ok(())
        }
    }

    fn coordinator_with(
        transport: &Arc<RecordingTransport>,
        store: &Arc<MemoryStore>,
    ) -> Arc<Coordinator> {
        Arc::new(
            Coordinator::new(
                Arc::clone(transport) as Arc<dyn Transport>,
                Arc::clone(store) as Arc<dyn RecordStore>,
            )
            .with_conduit_factory(Arc::new(FileConduitFactory)),
        )
    }

    /// Drives an outbound transfer by requesting chunks at the current
    /// position until it leaves `Loading`.
    async fn pump_outbound(
        coordinator: &Coordinator,
        transfer: &ActiveTransfer,
        handle: TransportHandle,
        chunk_len: usize,
    ) {
        while transfer.state() == TransferState::Loading {
            let position = transfer.bytes_moved();
            coordinator
                .on_chunk_request(PEER, handle, position, chunk_len)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn outbound_file_transfer_end_to_end() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("report.pdf");
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        std::fs::write(&src, &payload).unwrap();

        let transport = RecordingTransport::new();
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator_with(&transport, &store);

        let source = FileSource::open(&src).unwrap();
        let (transfer, record_id) = coordinator
            .send("report.pdf", Box::new(source), PEER, UsageKind::Data)
            .unwrap();
        assert_eq!(transfer.byte_size(), Some(3000));

        coordinator.resume(&transfer).unwrap();
        pump_outbound(&coordinator, &transfer, transfer.handle(), 512).await;

        assert_eq!(transfer.state(), TransferState::Ready);
        assert_eq!(transport.sent_payload(), payload);

        coordinator.flush();
        let record = store.get(&record_id).unwrap();
        assert_eq!(record.state, TransferState::Ready);
        assert_eq!(record.resume_offset, 3000);
    }

    #[tokio::test]
    async fn inbound_file_transfer_lands_on_disk() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("incoming/notes.txt");
        let payload = b"The quick brown fox jumps over the lazy dog".to_vec();

        let transport = RecordingTransport::new();
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator_with(&transport, &store);

        let handle = TransportHandle(11);
        let record_id = coordinator.on_incoming_offer(
            PEER,
            handle,
            "notes.txt",
            Some(payload.len() as u64),
            UsageKind::Data,
            b"resume-1".to_vec(),
        );
        let transfer = coordinator
            .accept_incoming(&record_id, Box::new(FileSink::create(&dest)))
            .unwrap();

        for part in payload.chunks(8) {
            let position = transfer.bytes_moved();
            coordinator
                .on_chunk_received(PEER, handle, position, part.to_vec())
                .await
                .unwrap();
        }

        assert_eq!(transfer.state(), TransferState::Ready);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);

        let record = store.get(&record_id).unwrap();
        assert_eq!(record.state, TransferState::Ready);
        assert_eq!(record.storage_location, Some(dest.display().to_string()));
    }

    #[tokio::test]
    async fn interrupted_inbound_transfer_survives_a_restart() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("download.bin");
        let payload: Vec<u8> = (0..200u8).collect();

        // First process: accept the transfer and move 80 bytes, then lose
        // the session.
        let transport_a = RecordingTransport::new();
        let store_a = Arc::new(MemoryStore::new());
        let coordinator_a = coordinator_with(&transport_a, &store_a);

        let handle_a = TransportHandle(21);
        let record_id = coordinator_a.on_incoming_offer(
            PEER,
            handle_a,
            "download.bin",
            Some(payload.len() as u64),
            UsageKind::Data,
            b"resume-dl".to_vec(),
        );
        coordinator_a
            .accept_incoming(&record_id, Box::new(FileSink::create(&dest)))
            .unwrap();
        for part in payload[..80].chunks(40) {
            let position = coordinator_a
                .active_transfer_for(&record_id)
                .unwrap()
                .bytes_moved();
            coordinator_a
                .on_chunk_received(PEER, handle_a, position, part.to_vec())
                .await
                .unwrap();
        }
        coordinator_a.on_session_ended(PEER);

        let persisted = store_a.get(&record_id).unwrap();
        assert_eq!(persisted.state, TransferState::Interrupted);
        assert_eq!(persisted.resume_offset, 80);
        assert!(!persisted.serialized_conduit.is_empty());

        // Second process: a fresh coordinator seeded with the persisted
        // record rebuilds the sink through the conduit factory.
        let transport_b = RecordingTransport::new();
        let store_b = Arc::new(MemoryStore::new());
        store_b.create(persisted.clone());
        let coordinator_b = coordinator_with(&transport_b, &store_b);

        let handle_b = TransportHandle(55);
        let resumed_id = coordinator_b
            .on_resume_offer(PEER, handle_b, &persisted.resumption_tag)
            .unwrap();
        assert_eq!(resumed_id, record_id);

        let transfer = coordinator_b.active_transfer_for(&record_id).unwrap();
        assert_eq!(transfer.state(), TransferState::Loading);
        assert_eq!(transfer.bytes_moved(), 80);

        for part in payload[80..].chunks(40) {
            let position = transfer.bytes_moved();
            coordinator_b
                .on_chunk_received(PEER, handle_b, position, part.to_vec())
                .await
                .unwrap();
        }

        assert_eq!(transfer.state(), TransferState::Ready);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[tokio::test]
    async fn interrupted_outbound_transfer_survives_a_restart() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("large.bin");
        let payload = vec![7u8; 1024];
        std::fs::write(&src, &payload).unwrap();

        let transport_a = RecordingTransport::new();
        let store_a = Arc::new(MemoryStore::new());
        let coordinator_a = coordinator_with(&transport_a, &store_a);

        let (transfer, record_id) = coordinator_a
            .send(
                "large.bin",
                Box::new(FileSource::open(&src).unwrap()),
                PEER,
                UsageKind::Data,
            )
            .unwrap();
        coordinator_a.resume(&transfer).unwrap();
        coordinator_a
            .on_chunk_request(PEER, transfer.handle(), 0, 256)
            .await
            .unwrap();
        coordinator_a.on_session_ended(PEER);

        let persisted = store_a.get(&record_id).unwrap();
        assert_eq!(persisted.state, TransferState::Interrupted);
        assert_eq!(persisted.resume_offset, 256);

        let transport_b = RecordingTransport::new();
        let store_b = Arc::new(MemoryStore::new());
        store_b.create(persisted.clone());
        let coordinator_b = coordinator_with(&transport_b, &store_b);

        let handle_b = TransportHandle(90);
        coordinator_b
            .on_resume_offer(PEER, handle_b, &persisted.resumption_tag)
            .unwrap();
        let resumed = coordinator_b.active_transfer_for(&record_id).unwrap();
        pump_outbound(&coordinator_b, &resumed, handle_b, 256).await;

        assert_eq!(resumed.state(), TransferState::Ready);
        // Both sessions together delivered the whole file exactly once.
        let mut sent = transport_a.sent_payload();
        sent.extend(transport_b.sent_payload());
        assert_eq!(sent, payload);
    }

    #[tokio::test]
    async fn scheduled_flush_delivers_progress_notifications() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("clip.bin");
        std::fs::write(&src, vec![3u8; 400]).unwrap();

        let transport = RecordingTransport::new();
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(
            Coordinator::new(
                Arc::clone(&transport) as Arc<dyn Transport>,
                Arc::clone(&store) as Arc<dyn RecordStore>,
            )
            .with_flush_interval(Duration::from_millis(10)),
        );

        let (transfer, _) = coordinator
            .send(
                "clip.bin",
                Box::new(FileSource::open(&src).unwrap()),
                PEER,
                UsageKind::Data,
            )
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        coordinator.subscribe(
            &transfer,
            InterestMask::ALL,
            Box::new(move |progress| {
                assert_eq!(progress.byte_size, Some(400));
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        coordinator.start();
        coordinator.resume(&transfer).unwrap();
        pump_outbound(&coordinator, &transfer, transfer.handle(), 100).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.stop();

        assert!(hits.load(Ordering::SeqCst) >= 1);
        assert_eq!(transfer.state(), TransferState::Ready);
    }

    #[test]
    fn persisted_record_keeps_its_wire_shape() {
        let record = byteferry_protocol::TransferRecord {
            id: "r-1".into(),
            peer: PEER,
            direction: byteferry_protocol::Direction::Inbound,
            state: TransferState::Interrupted,
            pause_flags: byteferry_protocol::PauseFlags::NOBODY,
            usage: UsageKind::Data,
            byte_size: Some(200),
            file_name: "download.bin".into(),
            storage_location: None,
            resumption_tag: b"resume-dl".to_vec(),
            serialized_conduit: vec![1, 2, 3],
            resume_offset: 80,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["fileName"], "download.bin");
        assert_eq!(value["resumeOffset"], 80);
        assert_eq!(value["state"], "interrupted");
        // Binary fields travel as base64 text.
        assert!(value["resumptionTag"].is_string());
        assert!(value["serializedConduit"].is_string());

        let back: byteferry_protocol::TransferRecord =
            serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
