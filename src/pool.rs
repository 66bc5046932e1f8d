//! Bounded task pool shared by probing and ingestion.
//!
//! Two instances run with different sizes: a moderate one for network
//! probes and a large one for file reads. Tasks are independent. A task
//! that fails or panics is logged and never cancels its siblings; the pool
//! returns only after every submitted task has finished.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};

/// What a drain produced. Results arrive in completion order.
#[derive(Debug)]
pub struct Drained<T> {
    pub results: Vec<T>,
    pub submitted: usize,
    /// Tasks that panicked or were cancelled by the runtime.
    pub lost: usize,
    /// Submission stopped early because shutdown was requested.
    pub interrupted: bool,
}

pub struct WorkerPool {
    name: &'static str,
    size: usize,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` over every item with at most `size` tasks in flight.
    pub async fn drain<I, F, Fut, T>(&self, items: I, f: F) -> Drained<T>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.drain_until(items, f, None).await
    }

    /// Like [`drain`](Self::drain), but stops submitting new items once
    /// `shutdown` flips to `true`. In-flight tasks still run to completion.
    pub async fn drain_until<I, F, Fut, T>(
        &self,
        items: I,
        mut f: F,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Drained<T>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        tracing::debug!("[{}] starting with {} workers", self.name, self.size());
        let semaphore = Arc::new(Semaphore::new(self.size()));
        let mut set = JoinSet::new();
        let mut drained = Drained {
            results: Vec::new(),
            submitted: 0,
            lost: 0,
            interrupted: false,
        };

        for item in items {
            if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                drained.interrupted = true;
                break;
            }

            // Acquire before spawning so at most `size` tasks exist at once
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let fut = f(item);
            set.spawn(async move {
                let out = fut.await;
                drop(permit);
                out
            });
            drained.submitted += 1;

            while let Some(joined) = set.try_join_next() {
                self.collect(joined, &mut drained);
            }
        }

        if drained.interrupted {
            tracing::warn!(
                "[{}] shutdown requested, waiting for {} in-flight tasks",
                self.name,
                set.len()
            );
        }

        while let Some(joined) = set.join_next().await {
            self.collect(joined, &mut drained);
        }

        tracing::debug!(
            "[{}] drained {} tasks ({} lost)",
            self.name,
            drained.submitted,
            drained.lost
        );
        drained
    }

    fn collect<T>(&self, joined: Result<T, JoinError>, drained: &mut Drained<T>) {
        match joined {
            Ok(out) => drained.results.push(out),
            Err(e) => {
                drained.lost += 1;
                if e.is_panic() {
                    tracing::error!("[{}] task panicked: {}", self.name, e);
                } else {
                    tracing::warn!("[{}] task cancelled: {}", self.name, e);
                }
            }
        }
    }
}
