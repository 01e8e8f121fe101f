//! End-to-end scenarios driving a `Hive` and its workers through the public API only.

use hivemap::{Hive, HiveBuilder, HiveError, Value};
use std::time::Duration;

#[test]
fn slow_worker_does_not_block_add_worker_forever() {
    let mut hive = HiveBuilder::new()
        .ready_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let id = hive
        .add_worker(|sub| {
            // Reports START immediately (inside `Sub::new`'s caller, `run_worker`), then
            // does something slow before actually finishing.
            std::thread::sleep(Duration::from_millis(150));
            sub.push("done")?;
            Ok(())
        })
        .unwrap();
    assert!(id >= 42);

    assert_eq!(hive.listen().unwrap(), Value::from("done"));
    hive.close().unwrap();
}

#[test]
fn worker_start_timeout_is_reported() {
    // A ready timeout of zero can't be satisfied by any worker, since the health
    // listener can never win the race to observe `START` in time.
    let mut hive = HiveBuilder::new()
        .ready_timeout(Duration::from_nanos(1))
        .build()
        .unwrap();

    let result = hive.add_worker(|_sub| Ok(()));
    assert!(matches!(result, Err(HiveError::WorkerStartFailed(_))));
    hive.close().unwrap();
}

#[test]
fn map_contention_many_writers_converge() {
    let mut hive = Hive::new().unwrap();
    let mut ids = Vec::new();
    for worker in 0..2i64 {
        let id = hive
            .add_worker(move |sub| {
                for i in 0..1000i64 {
                    let key = format!("k{i}");
                    // Every worker's CAS loop races the same root (and the parent's own
                    // `set` calls below); every write must still land regardless of how
                    // many retries it takes.
                    sub.set(key, worker * 1000 + i);
                }
                Ok(())
            })
            .unwrap();
        ids.push(id);
    }

    for i in 0..1000i64 {
        hive.set(format!("k{i}"), 2 * 1000 + i).unwrap();
    }

    hive.close().unwrap();
    assert_eq!(ids.len(), 2);

    for i in 0..1000i64 {
        let key = Value::from(format!("k{i}"));
        assert!(hive.contains_key(&key), "missing key k{i} after convergence");
        let value = hive.get(&key).unwrap();
        assert!(
            matches!(value, Value::Int64(n) if n == i || n == 1000 + i || n == 2000 + i),
            "unexpected value for k{i}: {value:?}"
        );
    }
}

#[test]
fn set_then_get_is_visible_to_a_worker() {
    let mut hive = Hive::new().unwrap();
    hive.set("key", 42i64).unwrap();

    hive.add_worker(|sub| {
        let value = sub.get(&Value::from("key"));
        sub.push(value.unwrap())?;
        Ok(())
    })
    .unwrap();

    assert_eq!(hive.listen().unwrap(), Value::Int64(42));
    hive.close().unwrap();
}

#[test]
fn group_error_renders_fixed_framing_text() {
    let mut hive = Hive::new().unwrap();
    hive.add_worker(|_sub| panic!("boom")).unwrap();
    let err = hive.close().unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("unhandled exception during the main() worker call"));
}

