use futures_util::future::BoxFuture;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default depth of a connection's serial queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Per-connection work queue. Jobs run strictly one at a time in
/// submission order, so every frame from a connection observes the
/// effects of the frames before it.
pub struct SerialQueue {
    tx: mpsc::Sender<BoxFuture<'static, ()>>,
    worker: JoinHandle<()>,
}

impl SerialQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<BoxFuture<'static, ()>>(depth.max(1));
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { tx, worker }
    }

    /// Enqueues a job. Returns false when the queue is full, which the
    /// connection treats as the client outrunning the server.
    pub fn enqueue<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.try_send(Box::pin(job)).is_ok()
    }

}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let queue = SerialQueue::new(16);
        let log = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let done = Arc::new(Notify::new());
        for index in 0..5u32 {
            let log = Arc::clone(&log);
            let done = Arc::clone(&done);
            assert!(queue.enqueue(async move {
                // Later jobs sleeping less would expose reordering.
                sleep(Duration::from_millis((5 - index as u64) * 2)).await;
                log.lock().await.push(index);
                if index == 4 {
                    done.notify_one();
                }
            }));
        }
        timeout(Duration::from_secs(2), done.notified())
            .await
            .expect("queue drained");
        assert_eq!(*log.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let queue = SerialQueue::new(1);
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        assert!(queue.enqueue(async move {
            release.notified().await;
        }));
        // The worker holds the first job; fill the single slot, then the
        // next enqueue must report full.
        let mut accepted = 0usize;
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            if queue.enqueue(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }) {
                accepted += 1;
            }
        }
        assert!(accepted < 3);
        gate.notify_one();
    }
}
