use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record<E: Serialize>(writer: &mut impl Write, record: &E) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: record][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
///
/// The log is untyped on disk; callers pick the record type at append and replay.
///
/// Appends are all-or-nothing per flush: records are staged in memory and
/// written by `flush_sync`. If the write or fsync fails, the file is cut back
/// to its last durable length and the staged records are discarded, so a
/// failed batch can neither reach disk later nor leave a torn record in front
/// of the next one. If the cut itself fails the log refuses further writes.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Staged records not yet written.
    pending: Vec<u8>,
    pending_records: u64,
    /// File length after the last successful flush.
    durable_len: u64,
    /// Set when the file could not be restored after a failed flush.
    poisoned: Option<String>,
    appends_since_compact: u64,
    #[cfg(test)]
    injected_failure: Option<usize>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_records: 0,
            durable_len,
            poisoned: None,
            appends_since_compact: 0,
            #[cfg(test)]
            injected_failure: None,
        })
    }

    /// Append a single record and fsync. The reservation store batches
    /// through `append_buffered` + `flush_sync` instead.
    pub fn append<E: Serialize>(&mut self, record: &E) -> io::Result<()> {
        if let Err(e) = self.append_buffered(record) {
            self.discard_pending();
            return Err(e);
        }
        self.flush_sync()
    }

    /// Stage a single record without writing it.
    /// Call `flush_sync()` after the batch to durably commit all staged records.
    pub fn append_buffered<E: Serialize>(&mut self, record: &E) -> io::Result<()> {
        self.check_poisoned()?;
        let mut encoded = Vec::new();
        encode_record(&mut encoded, record)?;
        self.pending.extend_from_slice(&encoded);
        self.pending_records += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Drop every staged record without writing anything.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.appends_since_compact -= self.pending_records;
        self.pending_records = 0;
    }

    /// Write staged records and fsync. On failure nothing staged survives,
    /// on disk or in memory.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if let Err(e) = self.check_poisoned() {
            self.discard_pending();
            return Err(e);
        }
        match self.write_pending() {
            Ok(()) => {
                self.durable_len += self.pending.len() as u64;
                self.pending.clear();
                self.pending_records = 0;
                Ok(())
            }
            Err(e) => {
                self.discard_pending();
                self.restore_durable_len();
                Err(e)
            }
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.injected_failure.take() {
            let torn = limit.min(self.pending.len());
            self.file.write_all(&self.pending[..torn])?;
            return Err(io::Error::other("injected write failure"));
        }
        self.file.write_all(&self.pending)?;
        self.file.sync_all()
    }

    fn restore_durable_len(&mut self) {
        let restored = self
            .file
            .set_len(self.durable_len)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = restored {
            tracing::error!(
                "WAL {}: could not truncate to {} bytes after failed write: {e}",
                self.path.display(),
                self.durable_len
            );
            self.poisoned = Some(e.to_string());
        }
    }

    fn check_poisoned(&self) -> io::Result<()> {
        match &self.poisoned {
            Some(reason) => Err(io::Error::other(format!(
                "WAL {} is unusable after a failed write: {reason}",
                self.path.display()
            ))),
            None => Ok(()),
        }
    }

    /// The next flush writes only the first `bytes` staged bytes and then fails.
    #[cfg(test)]
    pub(crate) fn fail_next_flush_after(&mut self, bytes: usize) {
        self.injected_failure = Some(bytes);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted records to a temp file and fsync.
    pub fn write_compact_file<E: Serialize>(path: &Path, records: &[E]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    /// Anything still staged is dropped.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.file = file;
        self.pending.clear();
        self.pending_records = 0;
        self.poisoned = None;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the WAL with a minimal set of records. Both phases in one call.
    #[cfg(test)]
    pub fn compact<E: Serialize>(&mut self, records: &[E]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid records.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay<E: DeserializeOwned>(path: &Path) -> io::Result<Vec<E>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            if stored_crc != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<E>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }

        Ok(records)
    }
}
