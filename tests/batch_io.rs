//! Batch I/O integration tests through the public surface.

use concordkv::{
    create_engine, BatchConfig, BatchManager, BatchStatus, EngineConfig, EngineKind, ErrorKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn manager(config: BatchConfig) -> BatchManager {
    let engine = create_engine(&EngineConfig::new(EngineKind::BPlusTree)).unwrap();
    BatchManager::new(engine, config).unwrap()
}

#[test]
fn test_batch_effects_observe_engine_visibility() {
    let engine = create_engine(&EngineConfig::new(EngineKind::Hash)).unwrap();
    let mgr = BatchManager::new(Arc::clone(&engine), BatchConfig::default()).unwrap();

    let batch = mgr.create_batch().unwrap();
    for i in 0..32 {
        batch
            .put(format!("k{:02}", i).as_bytes(), format!("v{}", i).as_bytes())
            .unwrap();
    }
    batch.submit(None).unwrap();
    assert_eq!(
        batch.wait(Duration::from_secs(2)).unwrap(),
        BatchStatus::Completed
    );

    // A batch is not a transaction: its effects are plain engine writes.
    assert_eq!(engine.count(), 32);
    assert_eq!(
        engine.get(b"k07").unwrap(),
        concordkv::Value::from("v7")
    );
    mgr.shutdown();
}

#[test]
fn test_exceeding_max_batch_size_reports_batch_full() {
    let mgr = manager(BatchConfig {
        max_batch_size: 4,
        ..BatchConfig::default()
    });
    let batch = mgr.create_batch().unwrap();
    for i in 0..4 {
        batch.put(format!("k{}", i).as_bytes(), b"v").unwrap();
    }
    assert_eq!(
        batch.put(b"overflow", b"v").unwrap_err().kind(),
        ErrorKind::BatchFull
    );
    mgr.shutdown();
}

#[test]
fn test_completion_callback_and_op_order() {
    let mgr = manager(BatchConfig::default());
    let retired = Arc::new(AtomicUsize::new(0));
    let batch = mgr.create_batch().unwrap();
    for i in 0..10 {
        let retired = Arc::clone(&retired);
        let expected = i;
        batch
            .put_with(
                format!("k{}", i).as_bytes(),
                b"v",
                Box::new(move |_result| {
                    // Ops retire strictly in enqueue order.
                    let seen = retired.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(seen, expected);
                }),
            )
            .unwrap();
    }
    let done = Arc::new(AtomicUsize::new(0));
    let done_flag = Arc::clone(&done);
    batch
        .submit(Some(Box::new(move |status, results| {
            assert_eq!(status, BatchStatus::Completed);
            assert_eq!(results.len(), 10);
            done_flag.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    batch.wait(Duration::from_secs(2)).unwrap();
    assert_eq!(retired.load(Ordering::SeqCst), 10);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    mgr.shutdown();
}

#[test]
fn test_submit_after_cancel_is_invalid_state() {
    let mgr = manager(BatchConfig::default());
    let batch = mgr.create_batch().unwrap();
    batch.put(b"k", b"v").unwrap();
    batch.cancel().unwrap();
    assert_eq!(
        batch.submit(None).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    mgr.shutdown();
}
