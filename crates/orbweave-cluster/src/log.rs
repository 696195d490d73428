//! Reading committed log entries for application.
//!
//! Entries committed by consensus are kept in an in-memory
//! [`InFlightCache`] until they have been read for application, because
//! they may not have been flushed to the log file yet. Application reads
//! through an [`InFlightLogEntryReader`], which serves from the cache while
//! it can and falls back to a forward-only log cursor for good once it
//! misses.

use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::LogError;

/// A committed command together with the term it was appended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub content: Bytes,
}

impl LogEntry {
    pub fn new(term: u64, content: impl Into<Bytes>) -> Self {
        Self {
            term,
            content: content.into(),
        }
    }
}

/// Forward-only iteration over log entries.
pub trait LogCursor: Send {
    /// Advances to the next entry, returning it with its index, or `None`
    /// past the end of the log.
    fn next(&mut self) -> Result<Option<(i64, LogEntry)>, LogError>;
}

/// Durable raft log collaborator.
pub trait RaftLog: Send + Sync {
    /// Index of the last appended entry, `-1` when empty.
    fn append_index(&self) -> i64;

    /// Opens a cursor whose first `next()` returns the entry at
    /// `from_index`.
    fn cursor(&self, from_index: i64) -> Result<Box<dyn LogCursor + '_>, LogError>;
}

/// Raft log held entirely in memory.
///
/// Suitable for tests and single-process embedding; it is not durable.
#[derive(Debug, Default)]
pub struct InMemoryRaftLog {
    entries: RwLock<BTreeMap<i64, LogEntry>>,
}

impl InMemoryRaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends after the last entry and returns the new entry's index.
    pub fn append(&self, entry: LogEntry) -> i64 {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let index = entries.keys().next_back().map_or(0, |last| last + 1);
        entries.insert(index, entry);
        index
    }

    /// Stores an entry at an explicit index, replacing any existing one.
    pub fn insert(&self, index: i64, entry: LogEntry) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(index, entry);
    }
}

struct BufferedCursor {
    entries: VecDeque<(i64, LogEntry)>,
}

impl LogCursor for BufferedCursor {
    fn next(&mut self) -> Result<Option<(i64, LogEntry)>, LogError> {
        Ok(self.entries.pop_front())
    }
}

impl RaftLog for InMemoryRaftLog {
    fn append_index(&self) -> i64 {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.keys().next_back().copied().unwrap_or(-1)
    }

    fn cursor(&self, from_index: i64) -> Result<Box<dyn LogCursor + '_>, LogError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let buffered = entries
            .range(from_index..)
            .map(|(i, e)| (*i, e.clone()))
            .collect();
        Ok(Box::new(BufferedCursor { entries: buffered }))
    }
}

/// Committed entries that may not be flushed to the log file yet.
///
/// Owned by the component that appends to the log; everyone else goes
/// through these methods.
#[derive(Debug, Default)]
pub struct InFlightCache {
    entries: DashMap<i64, LogEntry>,
}

impl InFlightCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches an entry. An index that is already cached keeps its first
    /// entry; returns `false` in that case.
    pub fn register(&self, index: i64, entry: LogEntry) -> bool {
        match self.entries.entry(index) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(index, "in-flight entry already registered, keeping the first");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Returns a copy of the cached entry at `index`.
    pub fn get(&self, index: i64) -> Option<LogEntry> {
        self.entries.get(&index).map(|e| e.value().clone())
    }

    /// Removes and returns the cached entry at `index`.
    pub fn unregister(&self, index: i64) -> Option<LogEntry> {
        self.entries.remove(&index).map(|(_, e)| e)
    }

    /// Drops every entry at or after `from_index`, used when the log is
    /// truncated by a new leader.
    pub fn truncate(&self, from_index: i64) {
        self.entries.retain(|index, _| *index < from_index);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads committed entries, preferring the in-flight cache.
///
/// The first cache miss disables the cache for the rest of this reader's
/// life: it means application has fallen behind the cached window, and
/// the window only moves forward. From then on entries come from a log
/// cursor opened at the missed index, so callers must ask for contiguous,
/// increasing indices. Not shared between threads.
pub struct InFlightLogEntryReader<'a> {
    log: &'a dyn RaftLog,
    cache: &'a InFlightCache,
    prune_after_read: bool,
    use_cache: bool,
    cursor: Option<Box<dyn LogCursor + 'a>>,
}

impl<'a> InFlightLogEntryReader<'a> {
    /// Creates a reader. With `prune_after_read`, entries served from the
    /// cache are removed from it.
    pub fn new(log: &'a dyn RaftLog, cache: &'a InFlightCache, prune_after_read: bool) -> Self {
        Self {
            log,
            cache,
            prune_after_read,
            use_cache: true,
            cursor: None,
        }
    }

    /// Returns the entry at `index`, or `None` if it is past the end of
    /// the log.
    pub fn get(&mut self, index: i64) -> Result<Option<LogEntry>, LogError> {
        if self.use_cache {
            let cached = if self.prune_after_read {
                self.cache.unregister(index)
            } else {
                self.cache.get(index)
            };
            if cached.is_some() {
                return Ok(cached);
            }
            debug!(index, "in-flight cache miss, switching to log cursor");
            self.use_cache = false;
        }
        self.get_using_cursor(index)
    }

    fn get_using_cursor(&mut self, index: i64) -> Result<Option<LogEntry>, LogError> {
        let log = self.log;
        let mut cursor = match self.cursor.take() {
            Some(cursor) => cursor,
            None => log.cursor(index)?,
        };
        let next = cursor.next();
        self.cursor = Some(cursor);
        match next? {
            Some((actual, entry)) if actual == index => Ok(Some(entry)),
            Some((actual, _)) => Err(LogError::CursorMismatch {
                expected: index,
                actual,
            }),
            None => Ok(None),
        }
    }

    /// True while entries are still served from the cache.
    pub fn uses_cache(&self) -> bool {
        self.use_cache
    }

    /// True once a log cursor has been opened.
    pub fn has_cursor(&self) -> bool {
        self.cursor.is_some()
    }

    /// Releases the cursor, if one was opened. Dropping the reader does
    /// the same.
    pub fn close(mut self) {
        self.cursor = None;
    }
}
