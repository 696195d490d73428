//! Append-only log of state records.
//!
//! Each persisted control value keeps its history in a small log file.
//! Only the last complete record matters on recovery; earlier ones are
//! superseded. A crash can leave a partially written record at the tail,
//! which readers treat as the end of usable data.
//!
//! File layout:
//! ```text
//! [OWST magic: 4B][version: 1B]
//! [record]*
//! ```
//!
//! Record layout:
//! ```text
//! [len: 4B][payload: len bytes][crc32: 4B]
//! ```
//! The CRC32 covers the payload bytes.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::format::{self, FormatError, Marshal};

/// Buffered writer that appends records to a freshly truncated log.
#[derive(Debug)]
pub struct StateLogWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    records: u64,
}

impl StateLogWriter {
    /// Creates the file, discarding any previous content, and writes the
    /// header. The header is flushed and fsynced before returning.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, FormatError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        format::write_header(&mut writer, format::STATE_MAGIC)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(Self {
            writer,
            path,
            records: 0,
        })
    }

    /// Appends a record. Writes len+payload+crc32 into the buffer; call
    /// [`sync`](Self::sync) to make it durable.
    pub fn write_record<S: Marshal>(&mut self, value: &S) -> Result<(), FormatError> {
        let mut payload = Vec::new();
        value.encode(&mut payload)?;
        let checksum = format::crc32(&payload);
        format::write_bytes(&mut self.writer, &payload)?;
        format::write_u32(&mut self.writer, checksum)?;
        self.records += 1;
        Ok(())
    }

    /// Flushes and fsyncs the file to disk.
    pub fn sync(&mut self) -> Result<(), FormatError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of records written since the file was created.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sequential reader over the records of a state log.
#[derive(Debug)]
pub struct StateLogReader {
    reader: BufReader<File>,
    path: PathBuf,
    /// Set once the end of usable data has been reached.
    exhausted: bool,
}

impl StateLogReader {
    /// Opens a state log and validates the header.
    ///
    /// An empty file, or one whose header was cut short, opens fine and
    /// yields no records. A header with the wrong magic is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        let exhausted = match format::read_header(&mut reader, format::STATE_MAGIC) {
            Ok(_) => false,
            Err(FormatError::UnexpectedEof) => true,
            Err(e) => return Err(e),
        };
        Ok(Self {
            reader,
            path,
            exhausted,
        })
    }

    /// Reads the next record.
    ///
    /// Returns `Ok(None)` at end-of-file. A truncated record (crash
    /// mid-append) also returns `Ok(None)`, and every later call does too.
    pub fn read_record<S: Marshal>(&mut self) -> Result<Option<S>, FormatError> {
        if self.exhausted {
            return Ok(None);
        }
        if self.reader.fill_buf()?.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        match self.read_raw_record() {
            Ok((payload, stored_crc)) => {
                format::verify_crc32(&payload, stored_crc)?;
                let value = S::decode(&mut io::Cursor::new(&payload))?;
                Ok(Some(value))
            }
            Err(FormatError::UnexpectedEof) => {
                self.exhausted = true;
                warn!(path = %self.path.display(), "truncated record at end of state log, ignoring");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn read_raw_record(&mut self) -> Result<(Vec<u8>, u32), FormatError> {
        let payload = format::read_bytes(&mut self.reader)?;
        let stored_crc = format::read_u32(&mut self.reader)?;
        Ok((payload, stored_crc))
    }
}

/// Reads every record in the file and returns the last complete one.
pub fn read_last<S: Marshal>(path: impl AsRef<Path>) -> Result<Option<S>, FormatError> {
    let mut reader = StateLogReader::open(path)?;
    let mut last = None;
    while let Some(value) = reader.read_record()? {
        last = Some(value);
    }
    Ok(last)
}
