#![deny(rust_2018_idioms, unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

mod error;
mod hamt;
mod hive;
mod queue;
mod refqueue;
mod registry;
mod sub;
mod util;
mod value;
mod worker;

pub use error::{HiveError, MemhiveGroupError, WorkerError, WorkerFailure};
pub use hive::{Hive, HiveBuilder};
pub use queue::{Queue, TryPushError};
pub use refqueue::{HeapId, RefQueue};
pub use sub::Sub;
pub use value::{ForeignHandle, Value};
pub use worker::{WorkerId, WorkerState};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn hive_and_sub_are_send_and_sync() {
        assert_send::<Hive>();
        assert_sync::<Hive>();
        assert_send::<Value>();
        assert_sync::<Value>();
    }

    #[test]
    fn hello_file_scenario() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("hivemap-hello-{}.txt", std::process::id()));
        let path_str = path.to_str().unwrap().to_owned();
        let _ = std::fs::remove_file(&path);

        let mut hive = Hive::new().unwrap();
        hive.set("file", path_str.clone()).unwrap();

        hive.add_worker(|sub| {
            let path = match sub.get(&Value::from("file")) {
                Some(Value::Str(path)) => path,
                other => panic!("expected a path string, got {other:?}"),
            };
            std::fs::write(&path, "hello!").map_err(|e| WorkerError::Other(e.to_string()))?;
            sub.push("done")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(hive.listen().unwrap(), Value::from("done"));
        hive.close().unwrap();

        let contents = std::fs::read_to_string(&path_str).unwrap();
        assert_eq!(contents, "hello!");
        std::fs::remove_file(&path_str).unwrap();
    }

    #[test]
    fn crashing_worker_is_reported_through_close() {
        let mut hive = Hive::new().unwrap();
        hive.add_worker(|_sub| panic!("deliberate failure")).unwrap();
        let err = hive.close().unwrap_err();
        match err {
            HiveError::Workers(group) => {
                assert_eq!(group.failures.len(), 1);
                assert_eq!(group.failures[0].kind, "Panic");
            }
            other => panic!("expected Workers error, got {other}"),
        }
    }

    #[test]
    fn broadcast_reaches_every_worker() {
        let mut hive = Hive::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            hive.add_worker(move |sub| {
                let msg = sub.listen()?;
                tx.send(msg).unwrap();
                Ok(())
            })
            .unwrap();
        }
        hive.broadcast("hi");
        for _ in 0..3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Value::from("hi"));
        }
        hive.close().unwrap();
    }

    #[test]
    fn graceful_drain_processes_every_item_once() {
        let mut hive = Hive::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            hive.add_worker(move |sub| loop {
                match sub.claim_work() {
                    Ok(item) => tx.send(item).unwrap(),
                    Err(HiveError::ClosedQueue) => return Ok(()),
                    Err(other) => return Err(other.into()),
                }
            })
            .unwrap();
        }
        for i in 0..100i64 {
            hive.push(i).unwrap();
        }
        hive.close().unwrap();
        drop(tx);

        let mut received: Vec<i64> = rx
            .iter()
            .map(|v| match v {
                Value::Int64(n) => n,
                other => panic!("unexpected value: {other:?}"),
            })
            .collect();
        received.sort_unstable();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }
}
