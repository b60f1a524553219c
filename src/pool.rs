/*!
 * Worker pool and pending-result handles
 *
 * Provisioning actions block their thread for the whole remote call, so each
 * fan-out gets a rayon pool sized to the number of nodes involved. Detached
 * actions report through a one-shot crossbeam channel wrapped in a
 * [`PendingResult`]; barrier-style fan-outs use [`WorkerPool::for_each`],
 * which returns only after every task finished.
 */

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{CdaError, Result};

/// Node name to in-flight provisioning action
pub type PendingMap = BTreeMap<String, PendingResult>;

pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// Pool with `size` threads (at least one)
    pub fn new(size: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size.max(1))
            .thread_name(|i| format!("cda-worker-{}", i))
            .build()
            .map_err(|e| CdaError::Pool(format!("Failed to create thread pool: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn size(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Start `task` in the background
    ///
    /// A panicking task is reported as [`CdaError::Pool`] through its handle.
    pub fn spawn<F>(&self, task: F) -> PendingResult
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.pool.spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                Err(CdaError::Pool(message))
            });
            // The receiver may already be gone if the run was aborted
            let _ = tx.send(outcome);
        });
        PendingResult::waiting(rx)
    }

    /// Run `f` over every item concurrently and wait for all of them
    ///
    /// Every item gets its own task. Returns the first error in item order.
    pub fn for_each<T, F>(&self, items: &[T], f: F) -> Result<()>
    where
        T: Sync,
        F: Fn(&T) -> Result<()> + Send + Sync,
    {
        let results: Vec<Result<()>> = self.pool.install(|| items.par_iter().with_max_len(1).map(&f).collect());
        results.into_iter().collect()
    }
}

/// Barrier fan-out on a pool sized to `items`
pub fn fan_out<T, F>(items: &[T], f: F) -> Result<()>
where
    T: Sync,
    F: Fn(&T) -> Result<()> + Send + Sync,
{
    if items.is_empty() {
        return Ok(());
    }
    WorkerPool::new(items.len())?.for_each(items, f)
}

/// Handle to an action that may still be running
#[derive(Debug)]
pub struct PendingResult {
    rx: Option<Receiver<Result<()>>>,
    outcome: Option<Result<()>>,
}

impl PendingResult {
    fn waiting(rx: Receiver<Result<()>>) -> Self {
        Self {
            rx: Some(rx),
            outcome: None,
        }
    }

    /// An already successful handle; placeholder for nodes with nothing in flight
    pub fn completed() -> Self {
        Self {
            rx: None,
            outcome: Some(Ok(())),
        }
    }

    /// Non-blocking check; `Some` once the action finished
    pub fn poll(&mut self) -> Option<&Result<()>> {
        if self.outcome.is_none() {
            if let Some(rx) = &self.rx {
                match rx.try_recv() {
                    Ok(outcome) => self.outcome = Some(outcome),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        self.outcome = Some(Err(CdaError::Pool(
                            "task ended without reporting".to_string(),
                        )))
                    }
                }
            }
        }
        self.outcome.as_ref()
    }

    pub fn is_done(&mut self) -> bool {
        self.poll().is_some()
    }

    /// Whether the action finished with an error
    pub fn failed(&mut self) -> bool {
        matches!(self.poll(), Some(Err(_)))
    }

    /// Block until the action finished and return its outcome
    pub fn join(mut self) -> Result<()> {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.rx.take() {
            Some(rx) => rx.recv().unwrap_or_else(|_| {
                Err(CdaError::Pool("task ended without reporting".to_string()))
            }),
            None => Ok(()),
        }
    }
}

/// Join every handle, returning the first failure in name order
pub fn join_all(pending: &mut PendingMap) -> Result<()> {
    let mut first_err = None;
    for (_, handle) in std::mem::take(pending) {
        if let Err(e) = handle.join() {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Join and return the first handle that already failed, if any
pub fn take_failure(pending: &mut PendingMap) -> Option<CdaError> {
    let name = pending
        .iter_mut()
        .find_map(|(name, handle)| handle.failed().then(|| name.clone()))?;
    pending.remove(&name).and_then(|handle| handle.join().err())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn test_spawn_and_join() {
        let pool = WorkerPool::new(2).unwrap();
        let ok = pool.spawn(|| Ok(()));
        let bad = pool.spawn(|| Err(CdaError::Boot("no media".into())));
        assert!(ok.join().is_ok());
        assert!(matches!(bad.join(), Err(CdaError::Boot(_))));
    }

    #[test]
    fn test_panic_becomes_pool_error() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.spawn(|| panic!("boom"));
        match handle.join() {
            Err(CdaError::Pool(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_poll_does_not_block() {
        let pool = WorkerPool::new(1).unwrap();
        let gate = Arc::new(Barrier::new(2));
        let task_gate = Arc::clone(&gate);
        let mut handle = pool.spawn(move || {
            task_gate.wait();
            Ok(())
        });
        assert!(!handle.is_done());
        gate.wait();
        while !handle.is_done() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.join().is_ok());
    }

    #[test]
    fn test_completed_placeholder() {
        let mut handle = PendingResult::completed();
        assert!(handle.is_done());
        assert!(!handle.failed());
        assert!(handle.join().is_ok());
    }

    #[test]
    fn test_for_each_runs_concurrently_and_waits() {
        let items: Vec<usize> = (0..4).collect();
        let gate = Barrier::new(4);
        let done = AtomicUsize::new(0);
        // Deadlocks unless all four run at once
        fan_out(&items, |_| {
            gate.wait();
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_for_each_first_error_in_order() {
        let items = vec![1, 2, 3];
        let err = fan_out(&items, |i| {
            if *i >= 2 {
                Err(CdaError::Network(format!("host {}", i)))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "network: host 2");
    }

    #[test]
    fn test_join_all_and_take_failure() {
        let pool = WorkerPool::new(2).unwrap();
        let mut pending = PendingMap::new();
        pending.insert("a".into(), pool.spawn(|| Ok(())));
        pending.insert("b".into(), pool.spawn(|| Err(CdaError::Boot("b".into()))));

        // Wait for both to land, then pick out the failure
        while !pending.values_mut().all(|h| h.is_done()) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(take_failure(&mut pending), Some(CdaError::Boot(_))));
        assert_eq!(pending.len(), 1);
        assert!(join_all(&mut pending).is_ok());
        assert!(pending.is_empty());
    }
}
