// Coalesces concurrent calls into one in-flight execution

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::error::AuthError;
use crate::utils::LockExt;

type Outcome<T> = Result<T, AuthError>;
type Waiters<T> = Vec<oneshot::Sender<Outcome<T>>>;

/// Runs at most one producer at a time and hands its outcome to every caller
/// that arrived while it was running.
///
/// The first caller of an idle coalescer becomes the leader: it invokes the
/// producer and the resulting future is driven on its own task, so dropping
/// any caller (leader included) never strands the others. Once the producer
/// completes, every registered waiter receives a clone of the same outcome and
/// the coalescer returns to idle; the next call starts a fresh execution.
pub struct RequestCoalescer<T> {
    // `None` while idle, `Some` while a producer is in flight
    waiters: Arc<Mutex<Option<Waiters<T>>>>,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a producer is currently in flight
    pub fn is_busy(&self) -> bool {
        self.waiters.lock_or_recover().is_some()
    }

    /// Join the in-flight execution, or start one with `producer` when idle
    pub async fn run<F, Fut>(&self, producer: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let is_leader = {
            let mut slot = self.waiters.lock_or_recover();
            match slot.as_mut() {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    *slot = Some(vec![tx]);
                    true
                }
            }
        };

        if is_leader {
            let flight = Flight {
                waiters: Arc::clone(&self.waiters),
                completed: false,
            };
            let work = producer();
            tokio::spawn(async move {
                let outcome = work.await;
                flight.complete(outcome);
            });
        } else {
            tracing::trace!("Joined in-flight execution");
        }

        rx.await.unwrap_or(Err(AuthError::Abandoned))
    }

    /// Wait for the in-flight execution, if any, without starting one
    pub async fn settled(&self) {
        let rx = {
            let mut slot = self.waiters.lock_or_recover();
            match slot.as_mut() {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => return,
            }
        };
        let _ = rx.await;
    }
}

impl<T> Default for RequestCoalescer<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the busy period; resets to idle even if the producer task is torn down
struct Flight<T> {
    waiters: Arc<Mutex<Option<Waiters<T>>>>,
    completed: bool,
}

impl<T: Clone> Flight<T> {
    fn complete(mut self, outcome: Outcome<T>) {
        self.completed = true;
        let pending = self.waiters.lock_or_recover().take().unwrap_or_default();
        tracing::trace!(waiters = pending.len(), "Delivering coalesced outcome");

        for tx in pending {
            // Receiver gone means that caller was dropped; nothing to deliver
            let _ = tx.send(outcome.clone());
        }
    }
}

impl<T> Drop for Flight<T> {
    fn drop(&mut self) {
        // Panic or runtime shutdown: dropping the senders resolves every receiver as abandoned
        if !self.completed {
            self.waiters.lock_or_recover().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counted_producer(
        calls: Arc<AtomicUsize>,
        outcome: Outcome<String>,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Outcome<String>> {
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                outcome
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let coalescer = RequestCoalescer::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..16).map(|_| {
            coalescer.run(counted_producer(calls.clone(), Ok("token-1".to_string())))
        });
        let results = join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok("token-1".to_string())));
        assert!(!coalescer.is_busy());
    }

    #[tokio::test]
    async fn test_error_is_fanned_out_and_coalescer_resets() {
        let coalescer = RequestCoalescer::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = AuthError::Store("disk full".to_string());

        let results = join_all((0..4).map(|_| {
            coalescer.run(counted_producer(calls.clone(), Err(failure.clone())))
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Err(failure.clone())));

        // Next call after the busy period runs a fresh execution
        let next = coalescer
            .run(counted_producer(calls.clone(), Ok("token-2".to_string())))
            .await;
        assert_eq!(next, Ok("token-2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idle_coalescer_does_no_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coalescer = RequestCoalescer::<String>::new();
        let _producer = counted_producer(calls.clone(), Ok("unused".to_string()));

        coalescer.settled().await;
        assert!(!coalescer.is_busy());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_leader_does_not_strand_waiters() {
        let coalescer = Arc::new(RequestCoalescer::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                coalescer
                    .run(counted_producer(calls, Ok("token".to_string())))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(coalescer.is_busy());

        let waiter = coalescer.run(counted_producer(calls.clone(), Ok("other".to_string())));
        leader.abort();

        assert_eq!(waiter.await, Ok("token".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    async fn exploding_producer() -> Outcome<String> {
        panic!("producer blew up")
    }

    #[tokio::test]
    async fn test_panicking_producer_abandons_waiters() {
        let coalescer = RequestCoalescer::<String>::new();

        let result = coalescer.run(exploding_producer).await;

        assert_eq!(result, Err(AuthError::Abandoned));
        assert!(!coalescer.is_busy());
    }

    #[tokio::test]
    async fn test_settled_waits_for_in_flight_execution() {
        let coalescer = Arc::new(RequestCoalescer::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let running = {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                coalescer
                    .run(counted_producer(calls, Ok("token".to_string())))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        coalescer.settled().await;
        assert!(!coalescer.is_busy());
        assert_eq!(running.await.unwrap(), Ok("token".to_string()));
    }
}
