//! Fixed-size worker pools over removable pending queues.

use super::request::RequestToken;
use futures::future::join_all;
use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Unbounded FIFO of request tokens waiting for a worker
pub struct WorkQueue {
    name: &'static str,
    pending: Mutex<VecDeque<RequestToken>>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RequestToken>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, token: RequestToken) {
        self.lock().push_back(token);
        trace!("Queued {} on {} queue", token, self.name);
        self.notify.notify_one();
    }

    /// Remove a not-yet-started request. Returns whether it was pending.
    pub fn remove(&self, token: RequestToken) -> bool {
        let mut pending = self.lock();
        match pending.iter().position(|t| *t == token) {
            Some(index) => {
                pending.remove(index);
                trace!("Removed {} from {} queue", token, self.name);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait for the next token, or `None` once `shutdown` fires.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<RequestToken> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // wait is not missed
            notified.as_mut().enable();

            let next = self.lock().pop_front();
            if next.is_some() {
                return next;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }
}

/// A fixed number of tasks draining one [`WorkQueue`]
pub struct WorkerPool {
    name: &'static str,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<F, Fut>(
        name: &'static str,
        size: usize,
        queue: Arc<WorkQueue>,
        shutdown: CancellationToken,
        handler: F,
    ) -> Self
    where
        F: Fn(RequestToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let size = size.max(1);
        let handles = (0..size)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let shutdown = shutdown.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    while let Some(token) = queue.pop(&shutdown).await {
                        trace!("{} worker {} picked up {}", name, worker, token);
                        (*handler)(token).await;
                    }
                    trace!("{} worker {} stopped", name, worker);
                })
            })
            .collect();
        debug!("Started {} pool with {} workers", name, size);
        Self { name, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit. Workers stop once the shutdown token fires.
    pub async fn join(mut self) {
        for result in join_all(mem::take(&mut self.handles)).await {
            if let Err(e) = result
                && !e.is_cancelled()
            {
                warn!("{} worker ended abnormally: {}", self.name, e);
            }
        }
        debug!("{} pool stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
