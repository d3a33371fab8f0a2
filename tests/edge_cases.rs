use statehist::{
    AttributeTree, Config, HistoryBuilder, ROOT_QUARK, StateSystemError, StateValue,
    TimeRangeError,
};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

/// Test 1: Boundary instants resolve to the later interval
#[test]
fn test_boundary_resolution() {
    let ss = HistoryBuilder::new().build().unwrap();
    let q = ss.quark_absolute_and_add(&["q"]).unwrap();
    ss.modify_attribute(10, "A", q).unwrap();
    ss.modify_attribute(20, "B", q).unwrap();
    ss.modify_attribute(30, StateValue::Null, q).unwrap();
    ss.close_history(30).unwrap();

    assert_eq!(ss.query_single_state(15, q).unwrap().value, StateValue::from("A"));
    assert_eq!(ss.query_single_state(19, q).unwrap().value, StateValue::from("A"));
    assert_eq!(ss.query_single_state(20, q).unwrap().value, StateValue::from("B"));
    assert_eq!(ss.query_single_state(25, q).unwrap().value, StateValue::from("B"));
    assert!(ss.query_single_state(30, q).unwrap().value.is_null());
    assert!(ss.query_single_state(9, q).unwrap().value.is_null());
}

/// Test 2: Writes going back in time abort construction
#[test]
fn test_non_monotonic_write() {
    let ss = HistoryBuilder::new().build().unwrap();
    let q = ss.quark_absolute_and_add(&["q"]).unwrap();
    ss.modify_attribute(100, 1, q).unwrap();

    let err = ss.modify_attribute(50, 2, q).unwrap_err();
    assert!(matches!(
        err,
        StateSystemError::TimeRange(TimeRangeError::NonMonotonic { timestamp: 50, last: 100, .. })
    ));
    assert!(matches!(ss.close_history(200), Err(StateSystemError::BuildAborted)));
}

/// Test 3: Writes before the history start are rejected
#[test]
fn test_write_before_start() {
    let ss = HistoryBuilder::new().start_time(1_000).build().unwrap();
    let q = ss.quark_absolute_and_add(&["q"]).unwrap();
    assert!(ss.modify_attribute(999, 1, q).unwrap_err().is_time_range());
}

/// Test 4: Values of another type are never coerced
#[test]
fn test_value_type_mismatch() {
    let ss = HistoryBuilder::new().build().unwrap();
    let q = ss.quark_absolute_and_add(&["q"]).unwrap();
    ss.modify_attribute(1, 5, q).unwrap();
    let err = ss.modify_attribute(2, 5_i64, q).unwrap_err();
    assert!(matches!(err, StateSystemError::StateValueType(_)));

    // A type error does not stop construction.
    ss.modify_attribute(3, 6, q).unwrap();
    ss.close_history(4).unwrap();
    assert_eq!(ss.query_single_state(3, q).unwrap().value, StateValue::Int(6));
    assert!(ss.query_single_state(3, q).unwrap().value.unbox_str().is_err());
}

/// Test 5: Same-instant rewrites keep a single interval
#[test]
fn test_same_instant_rewrite() {
    let ss = HistoryBuilder::new().build().unwrap();
    let q = ss.quark_absolute_and_add(&["q"]).unwrap();
    ss.modify_attribute(5, "a", q).unwrap();
    ss.modify_attribute(5, "b", q).unwrap();
    ss.modify_attribute(5, "c", q).unwrap();
    ss.close_history(10).unwrap();

    let range = ss.query_history_range(q, 0, 10).unwrap();
    assert_eq!(range.len(), 1);
    assert_eq!(range[0].value, StateValue::from("c"));
}

/// Test 6: An empty history still has a time range
#[test]
fn test_empty_history() {
    let ss = HistoryBuilder::new().start_time(7).build().unwrap();
    ss.close_history(3).unwrap();
    assert_eq!(ss.current_end_time(), 7);
    assert!(ss.query_full_state(7).unwrap().is_empty());
    assert!(ss.query_full_state(8).unwrap_err().is_time_range());
}

/// Test 7: Attributes created while readers resolve paths
#[test]
fn test_concurrent_attribute_creation() {
    let tree = Arc::new(AttributeTree::new());
    let writers: Vec<_> = (0..8)
        .map(|w| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for i in 0..200 {
                    let q = tree
                        .quark_or_add(ROOT_QUARK, &["Threads", &i.to_string(), "Status"])
                        .unwrap();
                    assert_eq!(
                        tree.full_path(q).unwrap(),
                        format!("Threads/{}/Status", i),
                        "writer {w}"
                    );
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    // Threads, 200 thread nodes, 200 status nodes.
    assert_eq!(tree.len(), 401);

    let restored = AttributeTree::from_paths(&tree.to_paths()).unwrap();
    for q in 0..tree.len() as i32 {
        assert_eq!(restored.full_path(q).unwrap(), tree.full_path(q).unwrap());
    }
}

/// Test 8: Long strings and oversized intervals on disk
#[test]
fn test_oversized_values_on_disk() {
    let dir = TempDir::new().unwrap();
    let ss = HistoryBuilder::new()
        .history_tree(dir.path().join("big.ht"))
        .config(Config::default().with_block_size(4096))
        .build()
        .unwrap();
    let q = ss.quark_absolute_and_add(&["blob"]).unwrap();
    ss.modify_attribute(0, "x".repeat(1_000), q).unwrap();
    ss.modify_attribute(1, "y".repeat(8_000), q).unwrap();
    let err = ss.modify_attribute(2, "z", q).unwrap_err();
    assert!(matches!(err, StateSystemError::IntervalTooLarge { .. }));
    assert!(!ss.wait_until_built());
}

/// Test 9: Unknown quarks and a disposed history
#[test]
fn test_unknown_quark_and_disposed() {
    let ss = HistoryBuilder::new().build().unwrap();
    assert!(ss.query_ongoing_state(3).unwrap_err().is_attribute_not_found());
    assert!(ss.attribute_name(-7).unwrap_err().is_attribute_not_found());
    assert!(ss.sub_attributes(12, true).unwrap_err().is_attribute_not_found());

    ss.dispose().unwrap();
    assert!(matches!(
        ss.quark_absolute_and_add(&["x"]),
        Err(StateSystemError::Disposed)
    ));
}

/// Test 10: Invalid configurations are refused at build time
#[test]
fn test_invalid_config() {
    let json = r#"{ "block_size": 4096, "max_children": 400 }"#;
    let config = Config::from_json(json).unwrap();
    assert!(config.validate().is_err());
    let dir = TempDir::new().unwrap();
    let err = HistoryBuilder::new()
        .history_tree(dir.path().join("x.ht"))
        .config(config)
        .build()
        .unwrap_err();
    assert!(matches!(err, StateSystemError::InvalidConfig(_)));

    assert!(Config::from_json(r#"{ "unknown": 1 }"#).is_err());
}
