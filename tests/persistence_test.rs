//! End-to-end persistence tests for RaftLog.
//!
//! These tests write to a log, close it (or drop it as a crash would), damage the
//! files where relevant, reopen the same directory and verify what was recovered.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use rand::{Rng, SeedableRng, rngs::StdRng};
use raft_log::{ApplicationEntry, LogEntry, LogError, RaftLog, RaftLogOptions};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn create_application_entry(low: i64, high: i64) -> LogEntry {
    LogEntry::Application(
        ApplicationEntry::new(low, high, format!("command_{}", high).into_bytes()).unwrap(),
    )
}

fn open_log(dir: &Path, max_segment_size: u64) -> Result<RaftLog, LogError> {
    RaftLog::builder()
        .with_options(RaftLogOptions {
            dir: dir.to_path_buf(),
            name: "partition-1".to_string(),
            max_segment_size,
            ..Default::default()
        })
        .build()
}

fn segment_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    files.sort();
    files
}

#[test]
fn test_log_persistence_across_restarts() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();

    // First run: write, truncate and rewrite part of the tail
    {
        let log = open_log(temp_dir.path(), 256).unwrap();
        log.append(LogEntry::Initial, 1).unwrap();
        for i in 1..=9 {
            log.append(create_application_entry(i * 2 - 1, i * 2), 1).unwrap();
        }
        log.delete_after(6).unwrap();
        log.append(LogEntry::Initial, 2).unwrap();
        log.append(create_application_entry(11, 30), 2).unwrap();
        log.close().unwrap();
    }

    // Second run: everything up to the rewritten tail is back
    {
        let log = open_log(temp_dir.path(), 256).unwrap();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 8);
        assert_eq!(log.term(6), Some(1));
        assert_eq!(log.term(7), Some(2));
        assert_eq!(log.last_flushed_index().unwrap(), 8);

        let entries: Vec<_> = log
            .open_uncommitted_reader()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 8);
        assert_eq!(entries[0].entry(), &LogEntry::Initial);
        assert_eq!(entries[5].asqn(), 10);
        assert_eq!(entries[7].asqn(), 30);

        let mut reader = log.open_uncommitted_reader();
        assert_eq!(reader.seek_to_asqn(12).unwrap(), 8);
        assert_eq!(reader.seek_to_asqn(4).unwrap(), 3);
    }
}

#[test]
fn test_log_persistence_after_reset() {
    let temp_dir = TempDir::new().unwrap();
    {
        let log = open_log(temp_dir.path(), 128).unwrap();
        for i in 1..=10 {
            log.append(create_application_entry(i, i), 1).unwrap();
        }
        log.reset(100).unwrap();
        log.append(create_application_entry(500, 501), 3).unwrap();
        log.close().unwrap();
    }

    let log = open_log(temp_dir.path(), 128).unwrap();
    assert_eq!(log.first_index(), 100);
    assert_eq!(log.last_index(), 100);
    assert_eq!(log.last_entry().unwrap().unwrap().asqn(), 501);
    assert_eq!(segment_files(temp_dir.path()).len(), 1);
}

#[test]
fn test_log_persistence_after_compaction() {
    let temp_dir = TempDir::new().unwrap();
    let first_index;
    {
        let log = open_log(temp_dir.path(), 128).unwrap();
        for i in 1..=30 {
            log.append(create_application_entry(i, i), 1).unwrap();
        }
        log.set_commit_index(20).unwrap();
        assert!(log.compact(20).unwrap());
        first_index = log.first_index();
        log.close().unwrap();
    }

    let log = open_log(temp_dir.path(), 128).unwrap();
    assert_eq!(log.first_index(), first_index);
    assert_eq!(log.last_index(), 30);
    assert!(log.get(first_index - 1).unwrap().is_none());
}

#[test]
fn test_torn_tail_is_discarded() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    {
        let log = open_log(temp_dir.path(), 64 * 1024 * 1024).unwrap();
        for i in 1..=3 {
            log.append(create_application_entry(i, i), 1).unwrap();
        }
        // dropped without close, as after a crash
    }

    let files = segment_files(temp_dir.path());
    let mut file = OpenOptions::new().append(true).open(files.last().unwrap()).unwrap();
    file.write_all(&[0xAB; 21]).unwrap();
    drop(file);

    let log = open_log(temp_dir.path(), 64 * 1024 * 1024).unwrap();
    assert_eq!(log.last_index(), 3);

    // appends continue from the clean tail
    log.append(create_application_entry(4, 4), 1).unwrap();
    log.close().unwrap();

    let log = open_log(temp_dir.path(), 64 * 1024 * 1024).unwrap();
    assert_eq!(log.last_index(), 4);
    assert_eq!(log.get(4).unwrap().unwrap().asqn(), 4);
}

#[test]
fn test_corrupted_sealed_segment_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    {
        let log = open_log(temp_dir.path(), 128).unwrap();
        for i in 1..=20 {
            log.append(create_application_entry(i, i), 1).unwrap();
        }
        log.close().unwrap();
    }

    let files = segment_files(temp_dir.path());
    assert!(files.len() > 1);
    let mut data = fs::read(&files[0]).unwrap();
    data[20] ^= 0xFF;
    fs::write(&files[0], data).unwrap();

    assert!(matches!(
        open_log(temp_dir.path(), 128),
        Err(LogError::Corrupted { .. })
    ));
}

#[test]
fn test_follower_copies_records_verbatim() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader = open_log(leader_dir.path(), 256).unwrap();
    let follower = open_log(follower_dir.path(), 256).unwrap();

    leader.append(LogEntry::Initial, 1).unwrap();
    for i in 1..=5 {
        leader.append(create_application_entry(i, i), 1).unwrap();
    }

    for entry in leader.open_uncommitted_reader() {
        follower
            .append_record(entry.unwrap().into_persisted_record())
            .unwrap();
    }
    follower.close().unwrap();

    let follower = open_log(follower_dir.path(), 256).unwrap();
    for index in 1..=6 {
        assert_eq!(
            follower.get(index).unwrap().unwrap().persisted_record(),
            leader.get(index).unwrap().unwrap().persisted_record()
        );
    }
}

#[test]
fn test_reader_on_another_thread_sees_appends() {
    let temp_dir = TempDir::new().unwrap();
    let log = open_log(temp_dir.path(), 1024).unwrap();

    let consumer = {
        let log = log.clone();
        thread::spawn(move || {
            let mut reader = log.open_uncommitted_reader();
            let mut seen = Vec::new();
            while seen.len() < 50 {
                if reader.has_next() {
                    seen.push(reader.next_entry().unwrap().index());
                } else {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            seen
        })
    };

    for i in 1..=50 {
        log.append(create_application_entry(i, i), 1).unwrap();
    }

    let seen = consumer.join().unwrap();
    assert_eq!(seen, (1..=50).collect::<Vec<u64>>());
}

/// Applies random appends, truncations, commits and restarts to a log and to a
/// plain vector of `(term, asqn)`, and checks that both agree.
#[test]
fn test_random_operations_match_model() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut log = open_log(temp_dir.path(), 512).unwrap();

    let mut model: Vec<(u64, i64)> = Vec::new();
    let mut commit_index = 0u64;
    let mut term = 1u64;
    let mut position = 0i64;

    for _ in 0..400 {
        let last_index = model.len() as u64;
        match rng.random_range(0..100) {
            0..70 => {
                let width = rng.random_range(0..4);
                let entry = create_application_entry(position + 1, position + 1 + width);
                position += 1 + width;
                let appended = log.append(entry, term).unwrap();
                assert_eq!(appended.index(), last_index + 1);
                model.push((term, position));
            }
            70..85 if last_index > commit_index => {
                let index = rng.random_range(commit_index..last_index);
                log.delete_after(index).unwrap();
                model.truncate(index as usize);
                term += 1;
            }
            85..95 => {
                let index = rng.random_range(commit_index..=last_index);
                commit_index = log.set_commit_index(index).unwrap();
                assert_eq!(commit_index, index);
            }
            95..100 => {
                log.close().unwrap();
                log = open_log(temp_dir.path(), 512).unwrap();
                commit_index = 0;
            }
            _ => {}
        }
        assert_eq!(log.last_index(), model.len() as u64);
    }

    let entries: Vec<_> = log
        .open_uncommitted_reader()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(entries.len(), model.len());
    for (entry, (term, asqn)) in entries.iter().zip(&model) {
        assert_eq!(entry.term(), *term);
        assert_eq!(entry.asqn(), *asqn);
    }

    let mut reader = log.open_uncommitted_reader();
    for _ in 0..50 {
        let target = rng.random_range(0..=position + 1);
        let expected = model
            .iter()
            .position(|&(_, asqn)| asqn >= target)
            .unwrap_or(model.len().saturating_sub(1)) as u64
            + 1;
        if model.is_empty() {
            continue;
        }
        assert_eq!(reader.seek_to_asqn(target).unwrap(), expected);
    }
}
