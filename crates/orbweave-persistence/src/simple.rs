//! Single-value storage for write-once identities.
//!
//! Values like the local member id or the bound cluster id are written
//! once and never change. They don't need the dual-file scheme: the value
//! goes to a `.tmp` file first and is atomically renamed over the final
//! path, so a crash leaves either the old file or the complete new one.
//!
//! File layout:
//! ```text
//! [OWSV magic: 4B][version: 1B][len: 4B][payload][crc32: 4B]
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::format::{self, FormatError, Marshal};

/// A value stored in a single file under `<dir>/<name>-state/<name>`.
#[derive(Debug)]
pub struct SimpleStorage<T> {
    path: PathBuf,
    _value: PhantomData<fn() -> T>,
}

impl<T: Marshal> SimpleStorage<T> {
    /// Creates a handle for the named value. Nothing is touched on disk.
    pub fn new(base: &Path, name: &str) -> Self {
        Self {
            path: base.join(format!("{name}-state")).join(name),
            _value: PhantomData,
        }
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if a value has been written.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the stored value, or `None` if none was ever written.
    pub fn read(&self) -> Result<Option<T>, FormatError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut reader = BufReader::new(File::open(&self.path)?);
        format::read_header(&mut reader, format::SIMPLE_MAGIC)?;
        let payload = format::read_bytes(&mut reader)?;
        let stored_crc = format::read_u32(&mut reader)?;
        format::verify_crc32(&payload, stored_crc)?;
        let value = T::decode(&mut std::io::Cursor::new(&payload))?;
        Ok(Some(value))
    }

    /// Durably writes the value, replacing any previous one.
    pub fn write(&self, value: &T) -> Result<(), FormatError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");

        let mut payload = Vec::new();
        value.encode(&mut payload)?;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            format::write_header(&mut writer, format::SIMPLE_MAGIC)?;
            format::write_bytes(&mut writer, &payload)?;
            format::write_u32(&mut writer, format::crc32(&payload))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
