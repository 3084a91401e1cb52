//! Purpose: Per-key counter stores and the registry that hands them out.
//! Exports: `CounterStore`, `StoreLocator`, `Registry`, `DEFAULT_IO_TIMEOUT`.
//! Role: The serializing unit of state for one identity over a shared `Backend`.
//! Invariants: Operations on one key run in a single total order; distinct keys
//! never share a lock across an operation.
//! Invariants: A store reports a value only when the backend committed it; a timed
//! out increment either never commits or is awaited until its commit finishes.
//! Invariants: Resolving the same key twice yields stores over the same lock.
//! Invariants: A timed-out operation releases the key lock when it returns, even
//! while its blocking backend call is still running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinError;
use tokio::time::{Instant, timeout_at};

use crate::core::backend::{Backend, CommitGate};
use crate::core::error::{Error, ErrorKind};
use crate::core::key::CounterKey;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

// Idle entries are dropped from the registry once it grows past this size.
const PRUNE_THRESHOLD: usize = 4096;

#[derive(Clone)]
pub struct CounterStore {
    key: CounterKey,
    backend: Arc<dyn Backend>,
    lock: Arc<RwLock<()>>,
    timeout: Duration,
}

impl CounterStore {
    pub fn key(&self) -> &CounterKey {
        &self.key
    }

    /// Current value, `0` if the key was never incremented.
    pub async fn get(&self) -> Result<u64, Error> {
        let deadline = Instant::now() + self.timeout;
        let _guard = timeout_at(deadline, self.lock.read())
            .await
            .map_err(|_| self.timeout_error("timed out waiting for counter lock"))?;

        let backend = self.backend.clone();
        let key = self.key.clone();
        let task = tokio::task::spawn_blocking(move || backend.load(&key));
        // A read has no side effects, so a stalled load is left behind unlocked.
        match timeout_at(deadline, task).await {
            Ok(joined) => flatten(joined),
            Err(_) => Err(self.timeout_error("timed out reading counter")),
        }
    }

    /// Adds one and returns the committed value.
    pub async fn increment(&self) -> Result<u64, Error> {
        let deadline = Instant::now() + self.timeout;
        let _guard = timeout_at(deadline, self.lock.write())
            .await
            .map_err(|_| self.timeout_error("timed out waiting for counter lock"))?;

        let gate = Arc::new(CommitGate::new());
        let _abandon = AbandonOnDrop(gate.clone());
        let task_gate = gate.clone();
        let backend = self.backend.clone();
        let key = self.key.clone();
        let mut task =
            tokio::task::spawn_blocking(move || backend.increment(&key, &task_gate));

        let outcome = timeout_at(deadline, &mut task).await;
        let value = match outcome {
            Ok(joined) => flatten(joined)?,
            // The task can no longer commit; the key lock is released on return.
            Err(_) if gate.abandon() => {
                tracing::warn!(key = %self.key, "increment abandoned before commit");
                return Err(self.timeout_error("timed out updating counter"));
            }
            Err(_) => flatten(task.await)?,
        };
        tracing::debug!(key = %self.key, value, "counter incremented");
        Ok(value)
    }

    fn timeout_error(&self, message: &str) -> Error {
        Error::new(ErrorKind::Timeout)
            .with_message(message)
            .with_key(self.key.as_str())
            .with_hint(format!(
                "No change was committed within {} ms; retry later.",
                self.timeout.as_millis()
            ))
    }
}

// Closes the gate when the caller stops waiting, including when its future is
// dropped mid-operation. A no-op once the backend has entered its commit.
struct AbandonOnDrop(Arc<CommitGate>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

fn flatten(joined: Result<Result<u64, Error>, JoinError>) -> Result<u64, Error> {
    joined.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("counter task failed")
            .with_source(err)
    })?
}

/// Maps a canonical key to its store.
pub trait StoreLocator: Send + Sync {
    fn locate(&self, key: &CounterKey) -> CounterStore;
}

/// In-process locator: one lazily created lock per key over a shared backend.
pub struct Registry {
    backend: Arc<dyn Backend>,
    timeout: Duration,
    locks: Mutex<HashMap<CounterKey, Arc<RwLock<()>>>>,
}

impl Registry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            timeout: DEFAULT_IO_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of keys with a cached lock.
    pub fn cached_keys(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }
}

impl StoreLocator for Registry {
    fn locate(&self, key: &CounterKey) -> CounterStore {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if locks.len() >= PRUNE_THRESHOLD && !locks.contains_key(key) {
            // Only the map holds these locks, so nobody is mid-operation on them.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        let lock = locks.entry(key.clone()).or_default().clone();
        CounterStore {
            key: key.clone(),
            backend: self.backend.clone(),
            lock,
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PRUNE_THRESHOLD, Registry, StoreLocator};
    use crate::core::backend::{Backend, CommitGate, FileBackend};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::key::{CounterKey, normalize};
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// In-memory backend with switchable failure and stalls.
    #[derive(Default)]
    struct TestBackend {
        values: Mutex<HashMap<CounterKey, u64>>,
        fail_commit: AtomicBool,
        stall_load: Mutex<Option<Duration>>,
        stall_before_commit: Mutex<Option<Duration>>,
    }

    fn stall(setting: &Mutex<Option<Duration>>) {
        let delay = *setting.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }

    impl Backend for TestBackend {
        fn load(&self, key: &CounterKey) -> Result<u64, Error> {
            stall(&self.stall_load);
            Ok(*self.values.lock().unwrap().get(key).unwrap_or(&0))
        }

        // Read-modify-write under the map lock, so increments serialize here too.
        fn increment(&self, key: &CounterKey, gate: &CommitGate) -> Result<u64, Error> {
            stall(&self.stall_before_commit);
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::Io).with_message("disk unavailable"));
            }
            let mut values = self.values.lock().unwrap();
            let next = values.get(key).copied().unwrap_or(0) + 1;
            gate.enter_commit()?;
            values.insert(key.clone(), next);
            Ok(next)
        }
    }

    fn file_registry(dir: &std::path::Path) -> Registry {
        Registry::new(Arc::new(FileBackend::open(dir).expect("open")))
    }

    #[tokio::test]
    async fn fresh_key_reads_zero_then_counts_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = file_registry(dir.path());
        let store = registry.locate(&normalize("my-song"));
        assert_eq!(store.get().await.expect("get"), 0);
        assert_eq!(store.increment().await.expect("hit"), 1);
        assert_eq!(store.increment().await.expect("hit"), 2);
        assert_eq!(store.get().await.expect("get"), 2);
    }

    #[tokio::test]
    async fn repeated_resolution_shares_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = file_registry(dir.path());
        let first = registry.locate(&normalize("shared"));
        let second = registry.locate(&normalize("  shared  "));
        first.increment().await.expect("hit");
        assert_eq!(second.get().await.expect("get"), 1);
        assert_eq!(registry.cached_keys(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_linearizable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(file_registry(dir.path()));
        let key = normalize("hot");
        registry.locate(&key).increment().await.expect("seed");

        let workers = 32;
        let mut handles = Vec::new();
        for _ in 0..workers {
            let registry = registry.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                registry.locate(&key).increment().await
            }));
        }
        let mut seen = BTreeSet::new();
        for handle in handles {
            let value = handle.await.expect("join").expect("hit");
            assert!(seen.insert(value), "duplicate value {value}");
        }
        let expected: BTreeSet<u64> = (2..=workers + 1).collect();
        assert_eq!(seen, expected);
        assert_eq!(
            registry.locate(&key).get().await.expect("get"),
            workers + 1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_keys_count_independently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(file_registry(dir.path()));
        let mut handles = Vec::new();
        for i in 0..40 {
            let registry = registry.clone();
            let key = if i % 2 == 0 { normalize("left") } else { normalize("right") };
            handles.push(tokio::spawn(async move {
                (key.clone(), registry.locate(&key).increment().await)
            }));
        }
        let mut left = BTreeSet::new();
        let mut right = BTreeSet::new();
        for handle in handles {
            let (key, value) = handle.await.expect("join");
            let value = value.expect("hit");
            let set = if key.as_str() == "left" { &mut left } else { &mut right };
            assert!(set.insert(value));
        }
        let expected: BTreeSet<u64> = (1..=20).collect();
        assert_eq!(left, expected);
        assert_eq!(right, expected);
    }

    #[tokio::test]
    async fn values_survive_a_fresh_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = normalize("durable");
        {
            let registry = file_registry(dir.path());
            let store = registry.locate(&key);
            for _ in 0..3 {
                store.increment().await.expect("hit");
            }
        }
        let registry = file_registry(dir.path());
        assert_eq!(registry.locate(&key).get().await.expect("get"), 3);
    }

    #[tokio::test]
    async fn failed_commit_keeps_previous_value() {
        let backend = Arc::new(TestBackend::default());
        let registry = Registry::new(backend.clone());
        let store = registry.locate(&normalize("flaky"));
        store.increment().await.expect("hit");

        backend.fail_commit.store(true, Ordering::SeqCst);
        let err = store.increment().await.expect_err("failure");
        assert_eq!(err.kind(), ErrorKind::Io);

        backend.fail_commit.store(false, Ordering::SeqCst);
        assert_eq!(store.get().await.expect("get"), 1);
        assert_eq!(store.increment().await.expect("hit"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_increment_never_commits() {
        let backend = Arc::new(TestBackend::default());
        let registry =
            Registry::new(backend.clone()).with_timeout(Duration::from_millis(50));
        let store = registry.locate(&normalize("slow"));
        store.increment().await.expect("hit");

        *backend.stall_before_commit.lock().unwrap() = Some(Duration::from_millis(300));
        let err = store.increment().await.expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.hint().is_some());

        // The abandoned task is still sleeping, but the key is free again.
        *backend.stall_before_commit.lock().unwrap() = None;
        assert_eq!(store.increment().await.expect("hit"), 2);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.get().await.expect("get"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_read_does_not_block_the_key() {
        let backend = Arc::new(TestBackend::default());
        let registry =
            Registry::new(backend.clone()).with_timeout(Duration::from_millis(100));
        let store = registry.locate(&normalize("hung-read"));

        *backend.stall_load.lock().unwrap() = Some(Duration::from_secs(2));
        let err = store.get().await.expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Timeout);

        *backend.stall_load.lock().unwrap() = None;
        let started = std::time::Instant::now();
        assert_eq!(store.increment().await.expect("hit"), 1);
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "increment waited {:?} on a stalled read",
            started.elapsed()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_increment_cannot_commit_later() {
        let backend = Arc::new(TestBackend::default());
        let registry = Registry::new(backend.clone());
        let store = registry.locate(&normalize("cancelled"));

        *backend.stall_before_commit.lock().unwrap() = Some(Duration::from_millis(200));
        let pending = tokio::time::timeout(Duration::from_millis(50), store.increment()).await;
        assert!(pending.is_err());

        *backend.stall_before_commit.lock().unwrap() = None;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get().await.expect("get"), 0);
    }

    #[test]
    fn idle_locks_are_pruned_past_threshold() {
        let backend = Arc::new(TestBackend::default());
        let registry = Registry::new(backend);
        let held = registry.locate(&normalize("held"));
        for i in 0..PRUNE_THRESHOLD {
            let _ = registry.locate(&normalize(&format!("k{i}")));
        }
        assert!(registry.cached_keys() < PRUNE_THRESHOLD);

        let again = registry.locate(held.key());
        assert!(Arc::ptr_eq(&held.lock, &again.lock));
    }
}
