//! Operation log
//!
//! Append-only record of committed space operations, replayed on startup
//! to bring back writes and takes the write scheduler had not yet flushed.
//!
//! Record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | LSN  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```
//!
//! A torn or corrupt record ends the log; everything after it is ignored.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use tuplespace_common::{Error, Oid, Result, TypeName};

/// Log record magic number
const LOG_MAGIC: u32 = 0x5453_4F50; // "TSOP"

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// One logged operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A committed write, carrying the flattened entry
    Write {
        type_name: TypeName,
        oid: Oid,
        entry: Vec<u8>,
    },
    /// A committed take
    Take { type_name: TypeName, oid: Oid },
    /// A lease change, expiry 0 cancels
    Renew {
        type_name: TypeName,
        oid: Oid,
        expiry: u64,
    },
    /// Instance count of a type when it was first mutated after startup
    InstanceCount { type_name: TypeName, count: i64 },
}

impl LogRecord {
    pub fn type_name(&self) -> &TypeName {
        match self {
            Self::Write { type_name, .. }
            | Self::Take { type_name, .. }
            | Self::Renew { type_name, .. }
            | Self::InstanceCount { type_name, .. } => type_name,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::codec(format!("encode log record: {e}")))
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::codec(format!("decode log record: {e}")))
    }
}

fn frame(lsn: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + 4);
    buf.extend_from_slice(&LOG_MAGIC.to_le_bytes());
    buf.extend_from_slice(&lsn.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);

    // CRC over everything except the CRC itself
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Parse one framed record, returning it and its total size
fn unframe(data: &[u8]) -> Option<(u64, &[u8], usize)> {
    if data.len() < RECORD_HEADER_SIZE + 4 {
        return None;
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().ok()?);
    if magic != LOG_MAGIC {
        return None;
    }
    let lsn = u64::from_le_bytes(data[4..12].try_into().ok()?);
    let len = u32::from_le_bytes(data[12..16].try_into().ok()?) as usize;

    let total = RECORD_HEADER_SIZE + len + 4;
    if data.len() < total {
        return None;
    }
    let stored = u32::from_le_bytes(data[RECORD_HEADER_SIZE + len..total].try_into().ok()?);
    if crc32c::crc32c(&data[..RECORD_HEADER_SIZE + len]) != stored {
        return None;
    }
    Some((lsn, &data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len], total))
}

/// Walk the valid prefix of a log image
fn records(data: &[u8]) -> impl Iterator<Item = (u64, &[u8])> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let (lsn, body, size) = unframe(&data[offset..])?;
        offset += size;
        Some((lsn, body))
    })
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

struct Writer {
    file: BufWriter<File>,
    next_lsn: u64,
}

/// Operation log file
pub struct OpLog {
    path: PathBuf,
    writer: Mutex<Writer>,
    size: AtomicU64,
    sync_on_write: bool,
}

impl OpLog {
    /// Open or create the log at `path`, continuing after its last valid
    /// record
    pub fn open(path: impl AsRef<Path>, sync_on_write: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let image = read_image(&path)?;
        let mut last_lsn = 0;
        let mut valid = 0u64;
        for (lsn, body) in records(&image) {
            last_lsn = lsn;
            valid += (RECORD_HEADER_SIZE + body.len() + 4) as u64;
        }
        if valid < image.len() as u64 {
            warn!(
                "Op log {} has {} trailing bytes after LSN {}, truncating",
                path.display(),
                image.len() as u64 - valid,
                last_lsn
            );
        }

        let file = OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;
        file.set_len(valid)?;
        let mut file = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        file.seek(SeekFrom::Start(valid))?;

        info!("Opened op log {} at LSN {}", path.display(), last_lsn);
        Ok(Self {
            path,
            writer: Mutex::new(Writer {
                file,
                next_lsn: last_lsn + 1,
            }),
            size: AtomicU64::new(valid),
            sync_on_write,
        })
    }

    /// Append one record, returning its LSN
    pub fn append(&self, record: &LogRecord) -> Result<u64> {
        let data = record.to_bytes()?;

        let mut writer = self.writer.lock();
        let lsn = writer.next_lsn;
        let bytes = frame(lsn, &data);
        writer.file.write_all(&bytes)?;
        if self.sync_on_write {
            writer.file.flush()?;
            writer.file.get_ref().sync_data()?;
        }
        writer.next_lsn += 1;
        self.size.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    /// Flush buffered records to disk
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.flush()?;
        writer.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Replay records with LSN >= `from_lsn`. Returns the last LSN seen.
    pub fn replay<F>(&self, from_lsn: u64, mut callback: F) -> Result<u64>
    where
        F: FnMut(u64, LogRecord) -> Result<()>,
    {
        self.sync()?;
        let image = read_image(&self.path)?;
        let mut last_lsn = from_lsn.saturating_sub(1);
        for (lsn, body) in records(&image) {
            if lsn >= from_lsn {
                callback(lsn, LogRecord::from_bytes(body)?)?;
            }
            last_lsn = lsn;
        }
        Ok(last_lsn)
    }

    /// Drop every record before `lsn`.
    ///
    /// The kept tail is written to a sibling file that atomically replaces
    /// the log.
    pub fn truncate_before(&self, lsn: u64) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.flush()?;

        let image = read_image(&self.path)?;
        let mut kept = Vec::new();
        for (record_lsn, body) in records(&image) {
            if record_lsn >= lsn {
                kept.extend_from_slice(&frame(record_lsn, body));
            }
        }

        let new_path = self.path.with_extension("log.new");
        {
            let mut file = File::create(&new_path)?;
            file.write_all(&kept)?;
            file.sync_all()?;
        }
        std::fs::rename(&new_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        writer.file = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        self.size.store(kept.len() as u64, Ordering::Relaxed);

        debug!("Truncated op log {} before LSN {}", self.path.display(), lsn);
        Ok(())
    }

    /// Last assigned LSN
    pub fn current_lsn(&self) -> u64 {
        self.writer.lock().next_lsn.saturating_sub(1)
    }

    /// Current log size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
