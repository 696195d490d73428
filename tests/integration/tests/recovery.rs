//! Crash recovery of dual-file control state.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use orbweave_cluster::state::{TermState, VoteState};
use orbweave_cluster::{MemberId, StateKind};
use orbweave_persistence::durable::{recover, state_files};
use orbweave_persistence::state_log::StateLogWriter;
use orbweave_persistence::{DurableStateStorage, FormatError, Side, StateError};

fn open_terms(dir: &tempfile::TempDir) -> DurableStateStorage<TermState> {
    DurableStateStorage::open(dir.path(), StateKind::Term.name(), 4).unwrap()
}

fn persist_terms(dir: &tempfile::TempDir, terms: std::ops::RangeInclusive<u64>) -> PathBuf {
    let mut store = open_terms(dir);
    for term in terms {
        store.persist(&TermState { term }).unwrap();
    }
    store.active_path().to_path_buf()
}

fn reopened_term(dir: &tempfile::TempDir) -> u64 {
    open_terms(dir).take_initial_state().unwrap().term
}

#[test]
fn torn_tail_write_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let active = persist_terms(&dir, 1..=3);

    // a record length followed by only part of its payload
    let mut file = OpenOptions::new().append(true).open(active).unwrap();
    file.write_all(&[8, 0, 0, 0, 0xAA, 0xBB]).unwrap();
    drop(file);

    assert_eq!(reopened_term(&dir), 3);
}

#[test]
fn crash_between_rotation_and_write_keeps_full_file() {
    let dir = tempfile::tempdir().unwrap();
    let active = persist_terms(&dir, 1..=4);

    // the reserve file has been truncated but the new record never landed
    let (a, b) = state_files(dir.path(), StateKind::Term.name());
    let reserve = if active == a { b } else { a };
    StateLogWriter::create(&reserve).unwrap();

    assert_eq!(reopened_term(&dir), 4);
}

#[test]
fn many_rotations_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    for round in 0..5u64 {
        let start = round * 10 + 1;
        persist_terms(&dir, start..=start + 9);
        assert_eq!(reopened_term(&dir), start + 9);
    }
}

#[test]
fn reopen_without_writes_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    persist_terms(&dir, 1..=2);
    for _ in 0..4 {
        assert_eq!(reopened_term(&dir), 2);
    }
}

#[test]
fn recovery_reads_without_modifying() {
    let dir = tempfile::tempdir().unwrap();
    persist_terms(&dir, 1..=6);
    let (a, b) = state_files(dir.path(), StateKind::Term.name());
    let before = (std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());

    let recovered = recover::<TermState>(&a, &b).unwrap();
    assert_eq!(recovered.state.term, 6);
    assert!(matches!(recovered.active, Side::A | Side::B));

    let after = (std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
    assert_eq!(before, after);
}

#[test]
fn corrupt_record_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let active = persist_terms(&dir, 1..=2);

    let mut bytes = std::fs::read(&active).unwrap();
    // header (5) + length prefix (4) puts us on the first payload byte
    bytes[9] ^= 0xFF;
    std::fs::write(&active, bytes).unwrap();

    let (a, b) = state_files(dir.path(), StateKind::Term.name());
    let err = recover::<TermState>(&a, &b).unwrap_err();
    assert!(
        matches!(
            err,
            StateError::Read {
                source: FormatError::ChecksumMismatch { .. },
                ..
            }
        ),
        "{err}"
    );
}

#[test]
fn vote_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let candidate = MemberId::new();
    {
        let mut store =
            DurableStateStorage::<VoteState>::open(dir.path(), StateKind::Vote.name(), 4).unwrap();
        store
            .persist(&VoteState {
                term: 5,
                voted_for: Some(candidate),
            })
            .unwrap();
    }

    let mut store =
        DurableStateStorage::<VoteState>::open(dir.path(), StateKind::Vote.name(), 4).unwrap();
    let vote = store.take_initial_state().unwrap();
    assert_eq!(vote.term, 5);
    assert_eq!(vote.voted_for, Some(candidate));
}
