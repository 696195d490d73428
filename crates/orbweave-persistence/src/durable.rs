//! Crash-safe storage of a single value across two alternating files.
//!
//! Every control value (term, vote, last flushed index, ...) lives in a
//! pair of state logs, `<name>.a` and `<name>.b`, under
//! `<dir>/<name>-state/`. Writes append to the active file. After a fixed
//! number of records the other file is truncated and becomes active, so
//! the file being overwritten never holds the newest confirmed value.
//!
//! Recovery reads the last complete record of each file and keeps the one
//! with the larger ordinal. The file holding the smaller ordinal (or no
//! record at all) is the one that is safe to overwrite next.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::format::{FormatError, Marshal};
use crate::state_log::{self, StateLogWriter};

/// A value persisted through [`DurableStateStorage`].
pub trait DurableState: Marshal {
    /// The value written into both files the first time a store is created.
    fn start_state() -> Self;

    /// Monotonically increasing position of this value (a term, a log
    /// index). Recovery keeps the candidate with the larger ordinal.
    fn ordinal(&self) -> i64;
}

/// Errors from opening, recovering, or writing a dual-file store.
#[derive(Debug, Error)]
pub enum StateError {
    /// Neither file holds a complete record.
    #[error("no recoverable state in {a} or {b}")]
    NothingRecovered { a: PathBuf, b: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// One of the two files of a dual-file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// The other file.
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

/// Outcome of comparing the two candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection<S> {
    /// File that receives the next writes.
    pub active: Side,
    /// The newest value found.
    pub state: S,
}

/// Picks the recovered value and the next active file from the last
/// record of each file.
///
/// Returns `None` when both candidates are missing.
pub fn select_recovered<S: DurableState>(a: Option<S>, b: Option<S>) -> Option<Selection<S>> {
    match (a, b) {
        (None, None) => None,
        (None, Some(state)) => Some(Selection {
            active: Side::A,
            state,
        }),
        (Some(state), None) => Some(Selection {
            active: Side::B,
            state,
        }),
        (Some(a), Some(b)) => {
            if a.ordinal() > b.ordinal() {
                Some(Selection {
                    active: Side::B,
                    state: a,
                })
            } else {
                Some(Selection {
                    active: Side::A,
                    state: b,
                })
            }
        }
    }
}

/// Result of [`recover`]: the newest value and the file to write next.
#[derive(Debug)]
pub struct RecoveredState<S> {
    pub active: Side,
    pub active_path: PathBuf,
    pub state: S,
}

/// Recovers a value from its two files without modifying either.
///
/// A missing file counts as a file without records. Fails with
/// [`StateError::NothingRecovered`] when neither file has a complete
/// record.
pub fn recover<S: DurableState>(file_a: &Path, file_b: &Path) -> Result<RecoveredState<S>, StateError> {
    let a = read_candidate::<S>(file_a)?;
    let b = read_candidate::<S>(file_b)?;

    let selection = select_recovered(a, b).ok_or_else(|| StateError::NothingRecovered {
        a: file_a.to_path_buf(),
        b: file_b.to_path_buf(),
    })?;

    let active_path = match selection.active {
        Side::A => file_a.to_path_buf(),
        Side::B => file_b.to_path_buf(),
    };
    debug!(
        active = %active_path.display(),
        ordinal = selection.state.ordinal(),
        "recovered dual-file state"
    );
    Ok(RecoveredState {
        active: selection.active,
        active_path,
        state: selection.state,
    })
}

fn read_candidate<S: DurableState>(path: &Path) -> Result<Option<S>, StateError> {
    if !path.exists() {
        return Ok(None);
    }
    state_log::read_last(path).map_err(|source| StateError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Returns the directory holding the files of the named value.
pub fn state_dir(base: &Path, name: &str) -> PathBuf {
    base.join(format!("{name}-state"))
}

/// Returns the paths of the two files of the named value.
pub fn state_files(base: &Path, name: &str) -> (PathBuf, PathBuf) {
    let dir = state_dir(base, name);
    (dir.join(format!("{name}.a")), dir.join(format!("{name}.b")))
}

/// Rotating two-file storage for one control value.
///
/// Single owner: callers must not open the same store twice, and must not
/// read its files while it is being written.
#[derive(Debug)]
pub struct DurableStateStorage<S> {
    name: String,
    file_a: PathBuf,
    file_b: PathBuf,
    active: Side,
    writer: StateLogWriter,
    rotation: u64,
    initial_state: Option<S>,
}

impl<S: DurableState> DurableStateStorage<S> {
    /// Opens (creating if needed) the store for `name` under `base`.
    ///
    /// On first use both files are seeded with [`DurableState::start_state`].
    /// The file chosen as active by recovery is truncated right away: it
    /// is behind the other one, which still holds the recovered value.
    pub fn open(base: &Path, name: &str, rotation: u64) -> Result<Self, StateError> {
        let dir = state_dir(base, name);
        fs::create_dir_all(&dir)?;
        let (file_a, file_b) = state_files(base, name);

        if !file_a.exists() && !file_b.exists() {
            info!(name, "creating new state store");
            let start = S::start_state();
            for path in [&file_a, &file_b] {
                let mut writer = StateLogWriter::create(path)?;
                writer.write_record(&start)?;
                writer.sync()?;
            }
        }

        let recovered = recover::<S>(&file_a, &file_b)?;
        let writer = StateLogWriter::create(&recovered.active_path)?;

        Ok(Self {
            name: name.to_owned(),
            file_a,
            file_b,
            active: recovered.active,
            writer,
            rotation: rotation.max(1),
            initial_state: Some(recovered.state),
        })
    }

    /// The value recovered when the store was opened. Taking it leaves
    /// `None` behind; the store does not cache later writes.
    pub fn take_initial_state(&mut self) -> Option<S> {
        self.initial_state.take()
    }

    /// The value recovered when the store was opened, if not yet taken.
    pub fn initial_state(&self) -> Option<&S> {
        self.initial_state.as_ref()
    }

    /// Durably writes a new value. Returns once the record is fsynced.
    pub fn persist(&mut self, state: &S) -> Result<(), StateError> {
        if self.writer.records() >= self.rotation {
            self.switch_file()?;
        }
        self.writer.write_record(state)?;
        self.writer.sync()?;
        Ok(())
    }

    /// Which file currently receives writes.
    pub fn active(&self) -> Side {
        self.active
    }

    /// Path of the file currently receiving writes.
    pub fn active_path(&self) -> &Path {
        self.writer.path()
    }

    fn switch_file(&mut self) -> Result<(), StateError> {
        self.active = self.active.other();
        let path = match self.active {
            Side::A => &self.file_a,
            Side::B => &self.file_b,
        };
        debug!(name = %self.name, path = %path.display(), "rotating state file");
        self.writer = StateLogWriter::create(path)?;
        Ok(())
    }
}
