//! Crash recovery tests for the durable queue.

use opsync_core::{CoreError, DurableQueue, MemoryQueue, QueueConfig, QueueStore};
use opsync_protocol::{ErrorKind, OperationType, Payload, QueueEntry, QueueStatus};
use proptest::prelude::*;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

fn entry(n: usize) -> QueueEntry {
    QueueEntry::new(
        OperationType::Update,
        "products",
        Some(format!("p{n}")),
        Payload::new().with("price", n as u64).with("version", 1),
        1024,
    )
    .unwrap()
}

fn log_path(dir: &Path) -> std::path::PathBuf {
    dir.join("queue.log")
}

#[test]
fn partial_final_write_is_discarded() {
    let dir = tempdir().unwrap();
    let kept = entry(1);
    {
        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        queue.add(kept.clone()).unwrap();
    }
    let good_len = fs::metadata(log_path(dir.path())).unwrap().len();

    // A crash mid-append leaves the start of a record behind.
    let mut file = OpenOptions::new()
        .append(true)
        .open(log_path(dir.path()))
        .unwrap();
    file.write_all(b"OPQL\x01\x00\x01\x40\x00\x00\x00partial").unwrap();
    drop(file);

    let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get(&kept.client_id).unwrap(), Some(kept));
    assert_eq!(queue.recovery().truncated_bytes, 18);
    assert_eq!(fs::metadata(log_path(dir.path())).unwrap().len(), good_len);

    // The log keeps working after the repair.
    queue.add(entry(2)).unwrap();
    drop(queue);
    let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.recovery().truncated_bytes, 0);
}

#[test]
fn damaged_record_is_reported_not_dropped() {
    let dir = tempdir().unwrap();
    {
        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        queue.add(entry(1)).unwrap();
        queue.add(entry(2)).unwrap();
    }

    let mut bytes = fs::read(log_path(dir.path())).unwrap();
    bytes[20] ^= 0x5A;
    fs::write(log_path(dir.path()), &bytes).unwrap();

    match DurableQueue::open(dir.path(), QueueConfig::default()) {
        Err(CoreError::ChecksumMismatch { offset, .. }) => assert_eq!(offset, 0),
        Err(other) => panic!("expected checksum mismatch, got {other}"),
        Ok(_) => panic!("expected checksum mismatch"),
    }

    // The damaged log is left as it was for inspection.
    assert_eq!(fs::read(log_path(dir.path())).unwrap(), bytes);
}

#[test]
fn interrupted_compaction_is_cleaned_up() {
    let dir = tempdir().unwrap();
    let e = entry(1);
    {
        let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
        queue.add(e.clone()).unwrap();
    }
    fs::write(dir.path().join("queue.log.compact"), b"OPQL garbage").unwrap();

    let queue = DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();
    assert!(queue.recovery().removed_stale_compaction);
    assert!(!dir.path().join("queue.log.compact").exists());
    assert_eq!(queue.get(&e.client_id).unwrap(), Some(e));
}

#[test]
fn entry_lifecycle_persists_across_restarts() {
    let dir = tempdir().unwrap();
    let mut e = entry(7);

    let open = || DurableQueue::open(dir.path(), QueueConfig::default()).unwrap();

    open().add(e.clone()).unwrap();

    for attempt in 1..=3u32 {
        let queue = open();
        e.mark_processing().unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();
        e.record_failure(ErrorKind::Network, "offline", None).unwrap();
        queue.update(&e.client_id, e.clone()).unwrap();
        drop(queue);

        let stored = open().get(&e.client_id).unwrap().unwrap();
        assert_eq!(stored.attempt_count, attempt);
        assert_eq!(stored.status, QueueStatus::Failed);
    }

    let queue = open();
    let stats = queue.stats(3).unwrap();
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.failures_by_kind["network"], 1);
}

#[derive(Debug, Clone)]
enum Step {
    Add,
    Claim(usize),
    Fail(usize),
    Complete(usize),
    Requeue(usize),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        2 => Just(Step::Add),
        2 => (0usize..8).prop_map(Step::Claim),
        2 => (0usize..8).prop_map(Step::Fail),
        1 => (0usize..8).prop_map(Step::Complete),
        1 => (0usize..8).prop_map(Step::Requeue),
    ]
}

fn apply(step: &Step, ids: &mut Vec<QueueEntry>, stores: &[&dyn QueueStore]) {
    let write = |e: &QueueEntry| {
        for store in stores {
            store.update(&e.client_id, e.clone()).unwrap();
        }
    };
    match step {
        Step::Add => {
            let e = entry(ids.len());
            for store in stores {
                store.add(e.clone()).unwrap();
            }
            ids.push(e);
        }
        Step::Claim(i) => {
            if let Some(e) = ids.get_mut(*i) {
                if e.mark_processing().is_ok() {
                    write(&*e);
                }
            }
        }
        Step::Fail(i) => {
            if let Some(e) = ids.get_mut(*i) {
                if e.record_failure(ErrorKind::Unknown, "500", None).is_ok() {
                    write(&*e);
                }
            }
        }
        Step::Complete(i) => {
            if let Some(e) = ids.get_mut(*i) {
                if e.mark_completed(None).is_ok() {
                    write(&*e);
                }
            }
        }
        Step::Requeue(i) => {
            if let Some(e) = ids.get_mut(*i) {
                if e.requeue().is_ok() {
                    write(&*e);
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn reopened_queue_matches_in_memory_model(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let dir = tempdir().unwrap();
        let config = QueueConfig::default()
            .sync_on_write(false)
            .compact_min_records(8)
            .compact_threshold_ratio(0.5);
        let model = MemoryQueue::new();
        let mut entries = Vec::new();
        {
            let durable = DurableQueue::open(dir.path(), config.clone()).unwrap();
            let stores: [&dyn QueueStore; 2] = [&durable, &model];
            for step in &steps {
                apply(step, &mut entries, &stores);
            }
            durable.sync().unwrap();
        }

        let reopened = DurableQueue::open(dir.path(), config).unwrap();
        let mut got = reopened.get_all().unwrap();
        let mut want = model.get_all().unwrap();
        got.sort_by_key(|e| e.client_id);
        want.sort_by_key(|e| e.client_id);
        prop_assert_eq!(got, want);
        prop_assert!(reopened.verify().unwrap().is_ok());
    }
}
