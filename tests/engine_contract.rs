//! Engine-contract integration tests: every engine kind behaves
//! identically through the public surface.

use concordkv::{create_engine, EngineConfig, EngineKind, ErrorKind, Key, Value};
use std::sync::Arc;

const IN_MEMORY_KINDS: [EngineKind; 4] = [
    EngineKind::Array,
    EngineKind::Hash,
    EngineKind::RBTree,
    EngineKind::BPlusTree,
];

#[test]
fn test_crud_round_trip_scenario() {
    // B+Tree order 100, the seeded end-to-end scenario.
    let mut config = EngineConfig::new(EngineKind::BPlusTree);
    config.btree.order = 100;
    let engine = create_engine(&config).unwrap();

    engine.put(b"user:1001", b"zhang").unwrap();
    engine.put(b"user:1002", b"li").unwrap();
    engine.update(b"user:1001", b"zhang-v2").unwrap();
    engine.delete(b"user:1002").unwrap();

    assert_eq!(engine.count(), 1);
    assert_eq!(engine.get(b"user:1001").unwrap(), Value::from("zhang-v2"));
    assert_eq!(
        engine.get(b"user:1002").unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn test_count_matches_live_keys_for_all_engines() {
    for kind in IN_MEMORY_KINDS {
        let engine = create_engine(&EngineConfig::new(kind)).unwrap();
        for i in 0..100 {
            engine.put(format!("k{}", i).as_bytes(), b"v1").unwrap();
        }
        for i in 0..50 {
            engine.put(format!("k{}", i).as_bytes(), b"v2").unwrap();
        }
        for i in (0..100).step_by(3) {
            engine.delete(format!("k{}", i).as_bytes()).unwrap();
        }
        // 34 keys deleted (0, 3, ..., 99)
        assert_eq!(engine.count(), 66, "{:?}", kind);
    }
}

#[test]
fn test_put_then_get_returns_byte_identical_value() {
    for kind in IN_MEMORY_KINDS {
        let engine = create_engine(&EngineConfig::new(kind)).unwrap();
        let value: Vec<u8> = (0..=255).collect();
        engine.put(b"binary", &value).unwrap();
        assert_eq!(engine.get(b"binary").unwrap().as_bytes(), value.as_slice());
    }
}

#[test]
fn test_put_overwrite_law() {
    for kind in IN_MEMORY_KINDS {
        let engine = create_engine(&EngineConfig::new(kind)).unwrap();
        engine.put(b"k", b"v1").unwrap();
        engine.put(b"k", b"v2").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Value::from("v2"), "{:?}", kind);
        assert_eq!(engine.count(), 1);
    }
}

#[test]
fn test_double_delete_is_not_found_not_error() {
    for kind in IN_MEMORY_KINDS {
        let engine = create_engine(&EngineConfig::new(kind)).unwrap();
        engine.put(b"k", b"v").unwrap();
        engine.delete(b"k").unwrap();
        let err = engine.delete(b"k").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound, "{:?}", kind);
    }
}

#[test]
fn test_empty_key_and_value_distinguishable_from_absence() {
    for kind in IN_MEMORY_KINDS {
        let engine = create_engine(&EngineConfig::new(kind)).unwrap();
        engine.put(b"", b"").unwrap();
        assert_eq!(engine.get(b"").unwrap(), Value::default(), "{:?}", kind);
        assert_eq!(engine.count(), 1);
        engine.delete(b"").unwrap();
        assert_eq!(engine.get(b"").unwrap_err().kind(), ErrorKind::NotFound);
    }
}

#[test]
fn test_factory_boundary_validation() {
    let mut config = EngineConfig::new(EngineKind::BPlusTree);
    config.btree.order = 2;
    match create_engine(&config) {
        Ok(_) => panic!("expected InvalidArg error"),
        Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidArg),
    }

    let mut config = EngineConfig::new(EngineKind::Hash);
    config.cache.capacity = 0;
    match create_engine(&config) {
        Ok(_) => panic!("expected InvalidArg error"),
        Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidArg),
    }
}

#[test]
fn test_batch_put_visible_through_gets() {
    for kind in IN_MEMORY_KINDS {
        let engine = create_engine(&EngineConfig::new(kind)).unwrap();
        let pairs: Vec<(Key, Value)> = (0..64)
            .map(|i| {
                (
                    Key::from(format!("batch-{:02}", i).as_str()),
                    Value::from(format!("{}", i).as_str()),
                )
            })
            .collect();
        engine.batch_put(&pairs).unwrap();
        assert_eq!(engine.count(), 64);
        assert_eq!(engine.get(b"batch-33").unwrap(), Value::from("33"));
    }
}

#[test]
fn test_engines_agree_under_concurrent_load() {
    for kind in [EngineKind::Hash, EngineKind::BPlusTree] {
        let engine = create_engine(&EngineConfig::new(kind)).unwrap();
        let mut handles = Vec::new();
        for t in 0..8 {
            let engine: Arc<dyn concordkv::KvEngine> = Arc::clone(&engine);
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    let key = format!("t{}-{:03}", t, i);
                    engine.put(key.as_bytes(), b"v").unwrap();
                    assert!(engine.get(key.as_bytes()).is_ok());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(engine.count(), 2000, "{:?}", kind);
    }
}
