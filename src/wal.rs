//! Append-only event log for the timetable store.
//!
//! Each record is framed as `[u32 len][bincode Event][u32 crc32]`, little
//! endian. Replay stops at the first record that is short, oversized or fails
//! its checksum, so a crash mid-write loses at most the unacknowledged tail.
//! Opening the log cuts that tail off so new records follow the last good one.
//!
//! A batch is all or nothing: records are staged in memory and only reach
//! the file in `flush_sync`. If the write or fsync fails, the file is cut
//! back to its last committed length.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::limits::MAX_WAL_RECORD_LEN;
use crate::model::Event;

fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("WAL record of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Next record and its framed size. `Ok(None)` at a clean end of file or at
/// the first unusable record.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_WAL_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, (len + 8) as u64)))
}

/// False on a short read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Intact records and the byte length they cover. A missing file is empty.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let mut reader = match File::open(path) {
        Ok(f) => BufReader::new(f),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut events = Vec::new();
    let mut valid_len = 0;
    while let Some((event, size)) = read_record(&mut reader)? {
        events.push(event);
        valid_len += size;
    }
    Ok((events, valid_len))
}

/// Writer half of the log. Owned by the engine's single writer task.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Framed records not yet written to the file.
    pending: Vec<u8>,
    pending_records: u64,
    /// File length covering every acknowledged record.
    committed_len: u64,
    appends_since_compact: u64,
    /// Set when a failed batch could not be cut back out of the file.
    poisoned: bool,
    #[cfg(test)]
    fail_after_bytes: Option<usize>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::open_with_replay(path).map(|(wal, _)| wal)
    }

    /// Open for appending and return every intact record. A torn or corrupt
    /// tail is truncated away first.
    pub fn open_with_replay(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = scan(path)?;
        let file = Self::open_append(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                "truncating {} unreadable bytes at the end of {}",
                on_disk - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        let wal = Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_records: 0,
            committed_len: valid_len,
            appends_since_compact: 0,
            poisoned: false,
            #[cfg(test)]
            fail_after_bytes: None,
        };
        Ok((wal, events))
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage one record. Nothing reaches the file until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let mark = self.pending.len();
        if let Err(e) = write_record(&mut self.pending, event) {
            self.pending.truncate(mark);
            return Err(e);
        }
        self.pending_records += 1;
        Ok(())
    }

    /// Drop every staged record.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_records = 0;
    }

    /// Commit every staged record: write, then fsync. On failure none of
    /// them stay in the log.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            self.discard_pending();
            return Err(io::Error::other(
                "WAL holds a partly written batch; compaction required",
            ));
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        match self.write_pending() {
            Ok(()) => {
                self.committed_len += self.pending.len() as u64;
                self.appends_since_compact += self.pending_records;
                self.discard_pending();
                Ok(())
            }
            Err(e) => {
                self.discard_pending();
                if let Err(cut) = self
                    .file
                    .set_len(self.committed_len)
                    .and_then(|()| self.file.sync_data())
                {
                    error!("could not roll back failed WAL batch: {cut}");
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        #[cfg(test)]
        {
            if let Some(limit) = self.fail_after_bytes.take() {
                let n = limit.min(self.pending.len());
                self.file.write_all(&self.pending[..n])?;
                return Err(io::Error::other("injected write failure"));
            }
        }
        self.file.write_all(&self.pending)?;
        self.file.sync_data()
    }

    /// Make the next flush write `n` bytes and then fail.
    #[cfg(test)]
    pub fn fail_next_flush_after(&mut self, n: usize) {
        self.fail_after_bytes = Some(n);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a replacement log next to `path` and fsync it. Does not touch
    /// the live log.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the replacement over the live log and continue appending to it.
    /// The replacement is written from live state, so it also clears a
    /// poisoned log.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        self.file = Self::open_append(&self.path)?;
        self.committed_len = self.file.metadata()?.len();
        self.discard_pending();
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact record in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}
