use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Lock table: path -> queue of waiters. An entry exists while the path is
/// held; its queue holds everyone waiting behind the current holder.
type LockTable = HashMap<PathBuf, VecDeque<oneshot::Sender<()>>>;

/// In-process mutex keyed by file path.
///
/// - Operations on the same path run one at a time, in arrival order (FIFO)
/// - Operations on different paths never wait on each other
/// - The lock is released when the returned guard drops, so an error, a panic
///   or a cancelled future inside the critical section cannot leak it
///
/// Nothing is shared across processes; restarting clears all lock state.
#[derive(Clone, Default)]
pub struct PathLock {
    table: Arc<Mutex<LockTable>>,
}

impl fmt::Debug for PathLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathLock")
            .field("tracked_paths", &self.tracked_paths())
            .finish()
    }
}

fn lock_table(table: &Mutex<LockTable>) -> MutexGuard<'_, LockTable> {
    // The table is only touched in short non-panicking sections.
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hand the path to the next live waiter, or forget the path if nobody waits.
fn release(table: &Mutex<LockTable>, path: &Path) {
    let mut table = lock_table(table);
    if let Some(queue) = table.get_mut(path) {
        while let Some(next) = queue.pop_front() {
            // A closed receiver belongs to a waiter that gave up; skip it.
            if next.send(()).is_ok() {
                debug!("Handed lock on {} to next waiter", path.display());
                return;
            }
        }
    }
    table.remove(path);
    debug!("Released lock on {}", path.display());
}

impl PathLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `path` is free, then hold it until the guard drops.
    pub async fn acquire(&self, path: impl AsRef<Path>) -> PathLockGuard {
        let path = path.as_ref().to_path_buf();
        loop {
            let rx = {
                let mut table = lock_table(&self.table);
                match table.entry(path.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(VecDeque::new());
                        debug!("Acquired lock on {}", path.display());
                        None
                    }
                    Entry::Occupied(mut slot) => {
                        let (tx, rx) = oneshot::channel();
                        slot.get_mut().push_back(tx);
                        debug!(
                            "Lock on {} busy, queued behind {} waiter(s)",
                            path.display(),
                            slot.get().len() - 1
                        );
                        Some(rx)
                    }
                }
            };

            let Some(rx) = rx else {
                return PathLockGuard::new(self.table.clone(), path);
            };

            let mut waiter = Waiter {
                table: self.table.clone(),
                path: path.clone(),
                rx,
                granted: false,
            };
            if (&mut waiter.rx).await.is_ok() {
                waiter.granted = true;
                debug!("Acquired lock on {} after waiting", path.display());
                return PathLockGuard::new(self.table.clone(), path);
            }
            // Holders never drop a sender without sending; start over if one did.
            warn!("Lock waiter on {} lost its sender, retrying", path.display());
        }
    }

    /// Like [`PathLock::acquire`], but give up after `timeout`.
    ///
    /// A waiter that times out leaves the queue without delaying the waiters
    /// behind it.
    pub async fn acquire_timeout(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<PathLockGuard, StoreError> {
        let path = path.as_ref();
        tokio::time::timeout(timeout, self.acquire(path))
            .await
            .map_err(|_| {
                StoreError::LockTimeout(format!(
                    "Timed out after {:?} waiting for {}",
                    timeout,
                    path.display()
                ))
            })
    }

    /// Run `f` while holding `path`. The lock is released on every exit.
    pub async fn run_exclusive<F, Fut, T>(&self, path: impl AsRef<Path>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(path).await;
        f().await
    }

    /// Run a fallible `f` while holding `path`, optionally bounding the wait
    /// for the lock. Errors from `f` propagate after the lock is released.
    pub async fn run_exclusive_within<F, Fut, T>(
        &self,
        path: impl AsRef<Path>,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let _guard = match timeout {
            Some(timeout) => self.acquire_timeout(path, timeout).await?,
            None => self.acquire(path).await,
        };
        f().await
    }

    /// Whether some operation currently holds `path`.
    pub fn is_locked(&self, path: impl AsRef<Path>) -> bool {
        lock_table(&self.table).contains_key(path.as_ref())
    }

    /// Number of live waiters queued behind the holder of `path`.
    pub fn waiters(&self, path: impl AsRef<Path>) -> usize {
        lock_table(&self.table)
            .get(path.as_ref())
            .map(|queue| queue.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of paths with bookkeeping. Zero once every lock has drained.
    pub fn tracked_paths(&self) -> usize {
        lock_table(&self.table).len()
    }
}

/// A queued acquisition. If it is dropped before completing (timeout or
/// cancellation), any lock already handed to it is passed on.
struct Waiter {
    table: Arc<Mutex<LockTable>>,
    path: PathBuf,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            debug!("Cancelled waiter on {} passes the lock on", self.path.display());
            release(&self.table, &self.path);
        }
    }
}

/// Exclusive hold on one path. Dropping it releases the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct PathLockGuard {
    table: Arc<Mutex<LockTable>>,
    path: PathBuf,
}

impl PathLockGuard {
    fn new(table: Arc<Mutex<LockTable>>, path: PathBuf) -> Self {
        Self { table, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for PathLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathLockGuard")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        release(&self.table, &self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_for_waiters(lock: &PathLock, path: &str, expected: usize) {
        for _ in 0..1000 {
            if lock.waiters(path) == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {} waiters on {}", expected, path);
    }

    #[tokio::test]
    async fn test_acquire_release_clears_bookkeeping() {
        let lock = PathLock::new();

        let guard = lock.acquire("a.json").await;
        assert!(lock.is_locked("a.json"));
        assert_eq!(guard.path(), Path::new("a.json"));
        assert_eq!(lock.tracked_paths(), 1);

        drop(guard);
        assert!(!lock.is_locked("a.json"));
        assert_eq!(lock.tracked_paths(), 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_fifo_order() {
        let lock = PathLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = lock.acquire("level-1.json").await;

        let mut handles = vec![];
        for i in 0..5 {
            let task_lock = lock.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = task_lock.acquire("level-1.json").await;
                order.lock().unwrap().push(i);
                tokio::task::yield_now().await;
            }));
            wait_for_waiters(&lock, "level-1.json", i + 1).await;
        }

        drop(guard);
        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(lock.tracked_paths(), 0);
    }

    #[tokio::test]
    async fn test_joined_sections_run_in_issue_order() {
        let lock = PathLock::new();
        let order = Mutex::new(Vec::new());

        let sections = (0..5).map(|i| {
            let order = &order;
            lock.run_exclusive("upgrade-crit.json", move || async move {
                tokio::task::yield_now().await;
                order.lock().unwrap().push(i);
            })
        });
        futures::future::join_all(sections).await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(lock.tracked_paths(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_critical_sections_never_overlap() {
        let lock = PathLock::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        const NUM_TASKS: usize = 20;
        let mut handles = vec![];
        for _ in 0..NUM_TASKS {
            let lock = lock.clone();
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            let completed = Arc::clone(&completed);
            handles.push(tokio::spawn(async move {
                lock.run_exclusive("shared.json", || async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            }));
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), NUM_TASKS);
        assert_eq!(lock.tracked_paths(), 0);
    }

    #[tokio::test]
    async fn test_different_paths_do_not_block() {
        let lock = PathLock::new();
        let _a = lock.acquire("a.json").await;

        let b = tokio::time::timeout(Duration::from_millis(100), lock.acquire("b.json")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_error_in_critical_section_releases() {
        let lock = PathLock::new();

        let result: Result<(), StoreError> = lock
            .run_exclusive_within("x.json", None, || async {
                Err(StoreError::Internal("boom".to_string()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Internal(_))));
        assert!(!lock.is_locked("x.json"));
    }

    #[tokio::test]
    async fn test_panic_in_critical_section_releases() {
        let lock = PathLock::new();

        let task_lock = lock.clone();
        let result = tokio::spawn(async move {
            task_lock
                .run_exclusive("x.json", || async {
                    let missing: Option<()> = None;
                    missing.expect("critical section failed")
                })
                .await
        })
        .await;
        assert!(result.is_err());

        let again = tokio::time::timeout(Duration::from_millis(100), lock.acquire("x.json")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_leaves_queue_usable() {
        let lock = PathLock::new();
        let guard = lock.acquire("slow.json").await;

        let err = lock
            .acquire_timeout("slow.json", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));
        assert_eq!(lock.waiters("slow.json"), 0);

        let patient = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire("slow.json").await;
            })
        };
        wait_for_waiters(&lock, "slow.json", 1).await;

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), patient)
            .await
            .expect("waiter behind a timed-out waiter stalled")
            .expect("task panicked");
        assert_eq!(lock.tracked_paths(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_stall_successors() {
        let lock = PathLock::new();
        let guard = lock.acquire("c.json").await;

        let cancelled = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire("c.json").await;
            })
        };
        wait_for_waiters(&lock, "c.json", 1).await;

        let survivor = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire("c.json").await;
            })
        };
        wait_for_waiters(&lock, "c.json", 2).await;

        cancelled.abort();
        let _ = cancelled.await;
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), survivor)
            .await
            .expect("survivor stalled")
            .expect("task panicked");
        assert_eq!(lock.tracked_paths(), 0);
    }
}
