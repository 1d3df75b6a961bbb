//! Multi-threaded exercises for the lock-coupled tree.
//!
//! Every test runs its workload on plain threads and reports back over a
//! channel so a deadlock shows up as a timeout instead of a hung test run.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use rand::{Rng, seq::SliceRandom};
use tree_db::store::{Insertion, Removal, TreeStore};

const LIVENESS_BOUND: Duration = Duration::from_secs(20);

/// Runs `workers` closures on their own threads and waits for all of them.
fn run_workers<F>(workers: Vec<F>)
where
    F: FnOnce() + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let count = workers.len();
    for work in workers {
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            work();
            let _ = done_tx.send(());
        });
    }
    for finished in 0..count {
        done_rx
            .recv_timeout(LIVENESS_BOUND)
            .unwrap_or_else(|_| panic!("only {finished} of {count} workers finished"));
    }
}

fn assert_sorted(entries: &[(String, String)]) {
    assert!(
        entries.windows(2).all(|pair| pair[0].0 < pair[1].0),
        "entries out of order or duplicated"
    );
}

#[test]
fn disjoint_writers_leave_exactly_their_surviving_keys() {
    let store = Arc::new(TreeStore::new());
    let threads = 8;
    let per_thread = 200;

    let workers = (0..threads)
        .map(|t| {
            let store = Arc::clone(&store);
            move || {
                let mut keys: Vec<String> = (0..per_thread).map(|i| format!("t{t}-k{i:04}")).collect();
                keys.shuffle(&mut rand::thread_rng());

                for key in &keys {
                    assert_eq!(store.insert(key, key).unwrap(), Insertion::Inserted);
                }
                for key in keys.iter().filter(|key| key.ends_with(['1', '3', '5', '7', '9'])) {
                    assert_eq!(store.remove(key), Removal::Removed);
                }
                for key in &keys {
                    let odd = key.ends_with(['1', '3', '5', '7', '9']);
                    assert_eq!(store.query(key).is_none(), odd, "{key}");
                }
            }
        })
        .collect();
    run_workers(workers);

    let entries = store.entries();
    assert_sorted(&entries);
    assert_eq!(entries.len(), threads * per_thread / 2);
    assert!(entries.iter().all(|(name, value)| name == value));
}

#[test]
fn racing_inserts_of_one_key_have_a_single_winner() {
    let store = Arc::new(TreeStore::new());
    let (result_tx, result_rx) = mpsc::channel();

    let workers = (0..16)
        .map(|t| {
            let store = Arc::clone(&store);
            let result_tx = result_tx.clone();
            move || {
                let outcome = store.insert("shared", &format!("writer-{t}")).unwrap();
                result_tx.send(outcome).unwrap();
            }
        })
        .collect();
    run_workers(workers);
    drop(result_tx);

    let outcomes: Vec<_> = result_rx.iter().collect();
    let winners = outcomes
        .iter()
        .filter(|outcome| **outcome == Insertion::Inserted)
        .count();
    assert_eq!(outcomes.len(), 16);
    assert_eq!(winners, 1);
    assert_eq!(store.entries().len(), 1);
}

#[test]
fn readers_always_see_stable_keys_while_writers_churn() {
    let store = Arc::new(TreeStore::new());
    let stable: Vec<String> = (0..50).map(|i| format!("stable-{i:02}")).collect();
    for key in &stable {
        store.insert(key, "fixed").unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut workers: Vec<Box<dyn FnOnce() + Send>> = Vec::new();

    for t in 0..4 {
        let store = Arc::clone(&store);
        workers.push(Box::new(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..2_000 {
                // Churn keys interleave with the stable ones, so two-child
                // deletes promote successors across stable nodes.
                let key = format!("stable-{:02}-churn-{t}", rng.gen_range(0..50));
                if rng.gen_bool(0.5) {
                    let _ = store.insert(&key, "churn").unwrap();
                } else {
                    let _ = store.remove(&key);
                }
            }
        }));
    }

    for _ in 0..4 {
        let store = Arc::clone(&store);
        let stable = stable.clone();
        let stop = Arc::clone(&stop);
        workers.push(Box::new(move || {
            while !stop.load(Ordering::Relaxed) {
                for key in &stable {
                    assert_eq!(store.query(key).as_deref(), Some("fixed"), "{key}");
                }
            }
        }));
    }

    let (done_tx, done_rx) = mpsc::channel();
    let handles: Vec<_> = workers
        .into_iter()
        .map(|work| {
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                work();
                let _ = done_tx.send(());
            })
        })
        .collect();

    // Writers finish first; readers keep going until told to stop.
    for _ in 0..4 {
        done_rx.recv_timeout(LIVENESS_BOUND).expect("writer finished");
    }
    stop.store(true, Ordering::Relaxed);
    for _ in 0..4 {
        done_rx.recv_timeout(LIVENESS_BOUND).expect("reader finished");
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let entries = store.entries();
    assert_sorted(&entries);
    for key in &stable {
        assert_eq!(store.query(key).as_deref(), Some("fixed"));
    }
}

#[test]
fn dumps_run_alongside_writers_without_deadlock() {
    let store = Arc::new(TreeStore::new());
    let mut workers: Vec<Box<dyn FnOnce() + Send>> = Vec::new();

    for t in 0..4 {
        let store = Arc::clone(&store);
        workers.push(Box::new(move || {
            for i in 0..500 {
                let key = format!("k{:03}-{t}", (i * 37) % 500);
                let _ = store.insert(&key, "v").unwrap();
                if i % 3 == 0 {
                    store.remove(&key);
                }
            }
        }));
    }
    for _ in 0..2 {
        let store = Arc::clone(&store);
        workers.push(Box::new(move || {
            for _ in 0..50 {
                let mut out = Vec::new();
                store.dump(&mut out).unwrap();
                assert!(out.starts_with(b"(root)\n"));
                assert_sorted(&store.entries());
            }
        }));
    }
    run_workers(workers);

    assert_sorted(&store.entries());
}

#[test]
fn shuffled_operations_match_an_ordered_map() {
    let store = TreeStore::new();
    let mut model = BTreeMap::new();
    let mut rng = rand::thread_rng();

    for _ in 0..5_000 {
        let key = format!("key-{}", rng.gen_range(0..300));
        match rng.gen_range(0..3) {
            0 => {
                let value = rng.gen_range(0..1_000).to_string();
                let expected = if model.contains_key(&key) {
                    Insertion::AlreadyPresent
                } else {
                    model.insert(key.clone(), value.clone());
                    Insertion::Inserted
                };
                assert_eq!(store.insert(&key, &value).unwrap(), expected);
            }
            1 => {
                let expected = if model.remove(&key).is_some() {
                    Removal::Removed
                } else {
                    Removal::NotFound
                };
                assert_eq!(store.remove(&key), expected);
            }
            _ => assert_eq!(store.query(&key), model.get(&key).cloned()),
        }
    }

    let expected: Vec<_> = model.into_iter().collect();
    assert_eq!(store.entries(), expected);
}
