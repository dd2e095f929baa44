//! Effect scheduler.
//!
//! Every scheduled effect runs on its own tokio task and resolves to exactly
//! one completion value, sent to the dispatch loop over an unbounded channel.
//! Panics and timeouts do not swallow the completion: the caller-supplied
//! `settle` closure turns them into a regular completion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use parley_core::EffectKey;
use parley_logging::{parley_debug, parley_warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a task ended when it did not produce its own completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Cancelled,
    TimedOut,
    Panicked,
}

/// Signals cancellation to a scheduled task. Cancellation is cooperative.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct KeyedEntry {
    id: u64,
    token: CancellationToken,
}

type KeyedTokens = Arc<Mutex<HashMap<EffectKey, KeyedEntry>>>;

pub struct Scheduler<T> {
    completions: mpsc::UnboundedSender<T>,
    root: CancellationToken,
    keyed: KeyedTokens,
    next_id: AtomicU64,
}

impl<T: Send + 'static> Scheduler<T> {
    pub fn new(completions: mpsc::UnboundedSender<T>) -> Self {
        Self {
            completions,
            root: CancellationToken::new(),
            keyed: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Runs `task` on a new tokio task. With a `key` the task can later be
    /// cancelled through [`Scheduler::cancel`]. With a `timeout` the task is
    /// dropped once it expires and `settle(Resolution::TimedOut)` is sent instead.
    pub fn schedule<F, Fut, S>(
        &self,
        key: Option<EffectKey>,
        timeout: Option<Duration>,
        task: F,
        settle: S,
    ) -> CancelHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        S: FnOnce(Resolution) -> T + Send + 'static,
    {
        let token = self.root.child_token();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(key) = key {
            let entry = KeyedEntry {
                id,
                token: token.clone(),
            };
            if let Some(previous) = lock(&self.keyed).insert(key, entry) {
                parley_warn!("Effect {:?} rescheduled; cancelling the previous run", key);
                previous.token.cancel();
            }
        }

        let work = task(token.clone());
        let completions = self.completions.clone();
        let keyed = Arc::clone(&self.keyed);
        let task_token = token.clone();

        tokio::spawn(async move {
            let inner = tokio::spawn(async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, work).await.ok(),
                    None => Some(work.await),
                }
            });

            let completion = match inner.await {
                Ok(Some(done)) => done,
                Ok(None) => {
                    task_token.cancel();
                    parley_debug!("Effect {:?} timed out after {:?}", key, timeout);
                    settle(Resolution::TimedOut)
                }
                Err(err) if err.is_panic() => {
                    parley_warn!("Effect {:?} panicked", key);
                    settle(Resolution::Panicked)
                }
                Err(_) => settle(Resolution::Cancelled),
            };

            if let Some(key) = key {
                let mut tokens = lock(&keyed);
                if tokens.get(&key).is_some_and(|entry| entry.id == id) {
                    tokens.remove(&key);
                }
            }
            if completions.send(completion).is_err() {
                parley_debug!("Completion for {:?} dropped: dispatch loop is gone", key);
            }
        });

        CancelHandle { token }
    }

    /// Requests cancellation of the keyed task. Returns false when no such task is running.
    pub fn cancel(&self, key: EffectKey) -> bool {
        match lock(&self.keyed).remove(&key) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every task scheduled so far, keyed or not.
    pub fn cancel_all(&self) {
        self.root.cancel();
        lock(&self.keyed).clear();
    }

    /// Number of keyed tasks still running.
    pub fn keyed_in_flight(&self) -> usize {
        lock(&self.keyed).len()
    }
}

fn lock(keyed: &KeyedTokens) -> MutexGuard<'_, HashMap<EffectKey, KeyedEntry>> {
    keyed.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producer half of a progress stream.
#[derive(Debug)]
pub struct ProgressSender<P> {
    tx: mpsc::UnboundedSender<P>,
}

impl<P> Clone for ProgressSender<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<P> ProgressSender<P> {
    /// Returns false once the consumer is gone.
    pub fn send(&self, item: P) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Consumer half of a progress stream. Each `next` call is awaited by one
/// scheduled effect; the loop re-arms the effect after every item.
#[derive(Debug)]
pub struct ProgressStream<P> {
    rx: mpsc::UnboundedReceiver<P>,
}

impl<P> ProgressStream<P> {
    /// `None` once every sender has been dropped and the buffer is drained.
    pub async fn next(&mut self) -> Option<P> {
        self.rx.recv().await
    }
}

pub fn progress_channel<P>() -> (ProgressSender<P>, ProgressStream<P>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressStream { rx })
}
