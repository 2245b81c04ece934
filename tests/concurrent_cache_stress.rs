//! Concurrent cache stress tests.
//!
//! A shared cache instance is hammered from many threads at once:
//! per-thread keys under sustained set/get churn, contended writers on a
//! single key, and concurrent writers on the external-blob path. The
//! barrier start maximizes contention on the engine lock and on SQLite's
//! own locking.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::fixtures::*;
use sciqlop_cache::Cache;
use tempfile::TempDir;

fn thread_count() -> usize {
    2 * thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[test]
fn test_concurrent_set_get_own_keys() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::new(dir.path(), 1000).unwrap());
    let value = Arc::new(generate_random_bytes(128, 40));

    let threads = thread_count();
    let iterations = 1000;
    let barrier = Arc::new(Barrier::new(threads));

    let mut handles = Vec::new();
    for i in 0..threads {
        let cache = Arc::clone(&cache);
        let value = Arc::clone(&value);
        let barrier = Arc::clone(&barrier);

        handles.push(thread::spawn(move || {
            let key = format!("random/test{i}");
            barrier.wait();

            for _ in 0..iterations {
                assert!(cache.set(&key, &value, None));
                let loaded = cache.get(&key).expect("own key should be present");
                assert_eq!(loaded.len(), value.len());
                assert_eq!(loaded.to_vec(), *value);
            }
        }));
    }

    for handle in handles {
        handle.join().expect("thread should complete");
    }

    assert!(cache.check());
    assert_eq!(cache.count(), threads as u64);
    for i in 0..threads {
        let loaded = cache.get(&format!("random/test{i}")).unwrap();
        assert_eq!(loaded.to_vec(), *value);
    }
}

#[test]
fn test_contended_writers_on_one_key() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::new(dir.path(), 1000).unwrap());

    let threads = thread_count();
    let barrier = Arc::new(Barrier::new(threads));

    let mut handles = Vec::new();
    for i in 0..threads {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);

        handles.push(thread::spawn(move || {
            let value = generate_random_bytes(128, 50 + i as u64);
            barrier.wait();

            for _ in 0..200 {
                assert!(cache.set("contended", &value, None));
                // Another writer may have won; the value is whole either way.
                let loaded = cache.get("contended").expect("key is always present");
                assert_eq!(loaded.len(), 128);
            }
        }));
    }

    for handle in handles {
        handle.join().expect("thread should complete");
    }

    assert_eq!(cache.count(), 1);
    assert!(cache.check());
}

#[test]
fn test_concurrent_external_writers_leave_one_blob_per_key() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::with_file_size_threshold(dir.path(), 1000, TEST_THRESHOLD).unwrap());

    let threads = thread_count();
    let barrier = Arc::new(Barrier::new(threads));

    let mut handles = Vec::new();
    for i in 0..threads {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);

        handles.push(thread::spawn(move || {
            let key = format!("blob/{i}");
            let value = generate_random_bytes(1024, 70 + i as u64);
            barrier.wait();

            for _ in 0..50 {
                assert!(cache.set(&key, &value, None));
                let loaded = cache.get(&key).expect("own key should be present");
                assert_eq!(loaded.to_vec(), value);
            }
        }));
    }

    for handle in handles {
        handle.join().expect("thread should complete");
    }

    assert_eq!(cache.count(), threads as u64);

    // Replaced blobs were reclaimed along the way: one file per live key.
    let mut files = 0usize;
    let mut stack = vec![dir.path().to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if !entry
                .file_name()
                .to_string_lossy()
                .starts_with(sciqlop_cache::DB_FILENAME)
            {
                files += 1;
            }
        }
    }
    assert_eq!(files, threads);
}

#[test]
fn test_readers_and_expire_pass_coexist() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(Cache::new(dir.path(), 1000).unwrap());
    let value = Arc::new(generate_random_bytes(128, 90));

    for i in 0..32 {
        assert!(cache.set(&format!("stable/{i}"), &value, None));
    }

    let threads = thread_count().min(8);
    let barrier = Arc::new(Barrier::new(threads + 1));

    let mut handles = Vec::new();
    for _ in 0..threads {
        let cache = Arc::clone(&cache);
        let value = Arc::clone(&value);
        let barrier = Arc::clone(&barrier);

        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..500 {
                let key = format!("stable/{}", i % 32);
                let loaded = cache.get(&key).expect("stable keys never expire early");
                assert_eq!(loaded.to_vec(), *value);
            }
        }));
    }

    let sweeper = {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..100 {
                cache.expire();
            }
        })
    };

    for handle in handles {
        handle.join().expect("reader should complete");
    }
    sweeper.join().expect("sweeper should complete");

    assert_eq!(cache.count(), 32);
    assert!(cache.check());
}
