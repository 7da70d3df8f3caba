// tests/guard_exclusion.rs

use std::sync::{Arc, Barrier};
use std::thread;

use batchrelay::guard::{ExecutionGuard, FileLockGuard, MemoryGuard};
use batchrelay_test_utils::init_tracing;
use tempfile::tempdir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Race `contenders` threads for `node`; return how many got the lock while
/// every token is still alive.
fn race(guard: Arc<dyn ExecutionGuard>, node: &str, contenders: usize) -> usize {
    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let guard = Arc::clone(&guard);
            let barrier = Arc::clone(&barrier);
            let node = node.to_string();
            thread::spawn(move || {
                barrier.wait();
                let token = guard.try_acquire(&node).expect("guard error");
                // Hold the token until everyone has tried.
                barrier.wait();
                token.is_some()
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("thread panicked"))
        .filter(|acquired| *acquired)
        .count()
}

#[test]
fn memory_guard_admits_exactly_one_concurrent_holder() {
    init_tracing();
    let guard: Arc<dyn ExecutionGuard> = Arc::new(MemoryGuard::new());
    assert_eq!(race(guard, "node-collect", 8), 1);
}

#[test]
fn file_guard_admits_exactly_one_concurrent_holder() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let guard: Arc<dyn ExecutionGuard> = Arc::new(FileLockGuard::new(dir.path()));
    assert_eq!(race(guard, "node-collect", 8), 1);
    Ok(())
}

#[test]
fn memory_guard_releases_on_drop() -> TestResult {
    let guard = MemoryGuard::new();

    let token = guard.try_acquire("n1")?.expect("first acquisition");
    assert_eq!(token.node(), "n1");
    assert!(guard.holder("n1").is_some());
    assert!(guard.try_acquire("n1")?.is_none());

    drop(token);
    assert!(guard.holder("n1").is_none());
    assert!(guard.try_acquire("n1")?.is_some());
    Ok(())
}

#[test]
fn memory_guard_locks_nodes_independently() -> TestResult {
    let guard = MemoryGuard::new();
    let _a = guard.try_acquire("n1")?.expect("n1");
    let _b = guard.try_acquire("n2")?.expect("n2 is a different node");
    Ok(())
}

#[test]
fn file_guard_releases_on_drop_and_stamps_owner() -> TestResult {
    let dir = tempdir()?;
    let lock = dir.path().join("custom").join("collect.lock");
    let guard = FileLockGuard::new(dir.path()).with_path("n1", &lock);
    assert_eq!(guard.lock_path("n1"), lock);
    assert_eq!(guard.lock_path("n2"), dir.path().join("n2.lock"));

    let token = guard.try_acquire("n1")?.expect("first acquisition");
    let contents = std::fs::read_to_string(&lock)?;
    assert!(contents.starts_with(&std::process::id().to_string()));
    assert!(guard.try_acquire("n1")?.is_none());

    drop(token);
    assert!(guard.try_acquire("n1")?.is_some());
    Ok(())
}

#[test]
fn separate_file_guards_on_the_same_path_exclude_each_other() -> TestResult {
    let dir = tempdir()?;
    let first = FileLockGuard::new(dir.path());
    let second = FileLockGuard::new(dir.path());

    let _held = first.try_acquire("n1")?.expect("first acquisition");
    assert!(second.try_acquire("n1")?.is_none());
    Ok(())
}
