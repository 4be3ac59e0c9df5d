//! Default file-backed conduits.
//!
//! [`FileSource`] reads an existing file; [`FileSink`] writes incoming
//! bytes to `<path>.part` and renames to the final path on completion.
//! Both are seek-capable and snapshot their path, so file transfers are
//! resumable across process restarts via [`FileConduitFactory`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use byteferry_protocol::Direction;

use crate::conduit::{Conduit, ConduitEnd, ConduitFactory, ReceivingConduit, SendingConduit};

/// Snapshot payload for both file conduits.
#[derive(Debug, Serialize, Deserialize)]
struct PathSnapshot {
    path: PathBuf,
}

fn encode_snapshot(path: &Path) -> Option<Vec<u8>> {
    serde_json::to_vec(&PathSnapshot {
        path: path.to_path_buf(),
    })
    .ok()
}

fn decode_snapshot(bytes: &[u8]) -> io::Result<PathBuf> {
    let snap: PathSnapshot = serde_json::from_slice(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(snap.path)
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Sending conduit reading from a file on disk.
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    size: u64,
}

impl FileSource {
    /// Opens `path` and captures its size.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file: Some(file),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Conduit for FileSource {
    fn become_active(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            let file = File::open(&self.path)?;
            self.size = file.metadata()?.len();
            self.file = Some(file);
        }
        Ok(())
    }

    fn become_inactive(&mut self) {
        self.file = None;
    }

    fn will_complete(&mut self) {}

    fn supports_seek(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "source not active"))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        encode_snapshot(&self.path)
    }
}

impl SendingConduit for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "source not active"))?;
        let mut buf = vec![0u8; max_len];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Receiving conduit writing to `<path>.part`, renamed to `path` once the
/// last chunk has been written.
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    complete: bool,
}

impl FileSink {
    /// Creates a sink targeting `path`. No I/O happens until activation.
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            complete: false,
        }
    }

    fn part_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".part");
        PathBuf::from(name)
    }
}

impl Conduit for FileSink {
    fn become_active(&mut self) -> io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // truncate(false): a resumed transfer reopens its partial data.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.part_path())?;
        self.file = Some(file);
        Ok(())
    }

    fn become_inactive(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.sync_all();
        }
    }

    fn will_complete(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.sync_all();
        }
        match std::fs::rename(self.part_path(), &self.path) {
            Ok(()) => self.complete = true,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "finalizing received file failed");
            }
        }
    }

    fn supports_seek(&self) -> bool {
        true
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "sink not active"))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        encode_snapshot(&self.path)
    }
}

impl ReceivingConduit for FileSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "sink not active"))?;
        file.write_all(data)
    }

    fn final_location(&self) -> Option<PathBuf> {
        self.complete.then(|| self.path.clone())
    }
}

// ---------------------------------------------------------------------------
// FileConduitFactory
// ---------------------------------------------------------------------------

/// Restores [`FileSource`] / [`FileSink`] conduits from their snapshots.
pub struct FileConduitFactory;

impl ConduitFactory for FileConduitFactory {
    fn restore(&self, direction: Direction, snapshot: &[u8]) -> io::Result<ConduitEnd> {
        let path = decode_snapshot(snapshot)?;
        match direction {
            Direction::Outbound => Ok(ConduitEnd::Sending(Box::new(FileSource::open(path)?))),
            Direction::Inbound => Ok(ConduitEnd::Receiving(Box::new(FileSink::create(path)))),
        }
    }
}
