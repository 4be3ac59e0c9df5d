//! In-memory conduits.
//!
//! Useful for small payloads (avatars, stickers) and for tests. Both ends
//! are seek-capable but have no snapshot, so they are resumable only
//! within the current process.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::conduit::{Conduit, ReceivingConduit, SendingConduit};

/// Sending conduit over an in-memory byte buffer.
pub struct MemorySource {
    data: Arc<[u8]>,
    pos: usize,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl Conduit for MemorySource {
    fn become_active(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn become_inactive(&mut self) {}

    fn will_complete(&mut self) {}

    fn supports_seek(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        if offset > self.data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek past end of buffer",
            ));
        }
        self.pos = offset as usize;
        Ok(())
    }
}

impl SendingConduit for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        let end = (self.pos + max_len).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(chunk)
    }
}

/// Receiving conduit collecting bytes into a shared buffer.
///
/// The buffer handle from [`MemorySink::buffer`] stays valid after the
/// transfer completes, so callers can read the received bytes back out.
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
    pos: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
            pos: 0,
        }
    }

    /// Shared handle to the underlying buffer.
    pub fn buffer(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.buf)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Conduit for MemorySink {
    fn become_active(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn become_inactive(&mut self) {}

    fn will_complete(&mut self) {}

    fn supports_seek(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.pos = offset as usize;
        Ok(())
    }
}

impl ReceivingConduit for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut buf = self.buf.lock().unwrap();
        let end = self.pos + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn final_location(&self) -> Option<PathBuf> {
        None
    }
}
