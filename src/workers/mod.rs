//! Fixed-size worker pool over a bounded queue.
//!
//! Workers share one receiver and drain items FIFO; nothing else is shared
//! between them. Enqueueing is a try-send with a timeout so a full queue
//! turns into `server_busy` instead of unbounded buffering. Closing the
//! sender starts the drain: workers finish the backlog and exit.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use lapin::acker::Acker;
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::General;
use crate::dispatch::DeadlineBudget;
use crate::errors::Error;
use crate::protocol::{Request, RequestKind};

/// One admitted request travelling from the consumer to a worker. The
/// broker acker rides along so acknowledgement happens only after the
/// reply is published.
pub struct WorkItem {
    pub request: Request,
    pub kind: RequestKind,
    pub reply_to: Option<String>,
    pub acker: Option<Acker>,
    pub received_at: quanta::Instant,
    /// Clamped total deadline; queue wait counts against it.
    pub deadline: Duration,
}

impl WorkItem {
    pub fn budget(&self) -> DeadlineBudget {
        DeadlineBudget {
            total: self.deadline,
            remaining: self.deadline.saturating_sub(self.received_at.elapsed()),
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.request.id)
            .field("kind", &self.kind)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Clamps the client-supplied deadline to the configured window.
pub fn clamp_deadline(deadline_ms: u64, general: &General) -> Duration {
    let requested = if deadline_ms == 0 {
        general.default_deadline.as_std()
    } else {
        Duration::from_millis(deadline_ms)
    };
    requested.min(general.max_deadline.as_std())
}

/// What a worker does with each item. The single implementation dispatches
/// and publishes; tests substitute stubs.
pub trait WorkHandler: Send + Sync + 'static {
    fn handle(&self, item: WorkItem) -> BoxFuture<'static, ()>;
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>;

pub struct WorkerPool {
    tx: parking_lot::Mutex<Option<mpsc::Sender<WorkItem>>>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

async fn worker_loop(id: usize, rx: SharedReceiver, handler: Arc<dyn WorkHandler>) {
    loop {
        // The lock is held only while waiting for the next item; processing
        // happens outside it so workers run in parallel.
        let item = { rx.lock().await.recv().await };
        match item {
            Some(item) => handler.handle(item).await,
            None => break,
        }
    }
    debug!("worker {id} drained and exited");
}

impl WorkerPool {
    pub fn spawn(workers: usize, queue_size: usize, handler: Arc<dyn WorkHandler>) -> WorkerPool {
        let (tx, rx) = mpsc::channel(queue_size);
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|id| tokio::spawn(worker_loop(id, rx.clone(), handler.clone())))
            .collect();

        WorkerPool {
            tx: parking_lot::Mutex::new(Some(tx)),
            handles: parking_lot::Mutex::new(handles),
        }
    }

    /// Queues one item, waiting at most `wait` for space. On failure the
    /// item comes back so the caller can still publish its rejection.
    pub async fn enqueue(&self, item: WorkItem, wait: Duration) -> Result<(), (Error, WorkItem)> {
        let tx = match self.tx.lock().clone() {
            Some(tx) => tx,
            None => return Err((Error::ShuttingDown, item)),
        };

        let result = match tokio::time::timeout(wait, tx.reserve()).await {
            Err(_) => Err((Error::ServerBusy, item)),
            Ok(Err(_)) => Err((Error::ShuttingDown, item)),
            Ok(Ok(permit)) => {
                permit.send(item);
                Ok(())
            }
        };
        result
    }

    /// Closes the queue and waits up to `drain` for the backlog. Returns
    /// whether the drain completed; stragglers are aborted otherwise.
    /// Safe to call more than once.
    pub async fn shutdown(&self, drain: Duration) -> bool {
        self.tx.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return true;
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let joined = futures::future::join_all(handles);
        match tokio::time::timeout(drain, joined).await {
            Ok(_) => true,
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn item(id: &str) -> WorkItem {
        WorkItem {
            request: Request {
                id: id.into(),
                kind: "command".into(),
                payload: "echo".into(),
                params: Vec::new(),
                client_id: "c".into(),
                deadline_ms: 0,
            },
            kind: RequestKind::Command,
            reply_to: None,
            acker: None,
            received_at: clock::now(),
            deadline: Duration::from_secs(5),
        }
    }

    struct Recording {
        seen: SyncMutex<Vec<String>>,
        count: AtomicUsize,
    }

    impl WorkHandler for Recording {
        fn handle(&self, item: WorkItem) -> BoxFuture<'static, ()> {
            self.seen.lock().push(item.request.id.clone());
            self.count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    struct Gated {
        gate: Arc<Notify>,
        count: AtomicUsize,
    }

    impl WorkHandler for Gated {
        fn handle(&self, _item: WorkItem) -> BoxFuture<'static, ()> {
            let gate = self.gate.clone();
            self.count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                gate.notified().await;
            })
        }
    }

    #[tokio::test]
    async fn drains_everything_on_shutdown() {
        let handler = Arc::new(Recording {
            seen: SyncMutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(4, 16, handler.clone());

        for i in 0..10 {
            pool.enqueue(item(&format!("r{i}")), Duration::from_millis(100))
                .await
                .unwrap();
        }
        assert!(pool.shutdown(Duration::from_secs(2)).await);
        assert_eq!(handler.count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn single_worker_preserves_fifo_order() {
        let handler = Arc::new(Recording {
            seen: SyncMutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(1, 16, handler.clone());

        for i in 0..5 {
            pool.enqueue(item(&format!("r{i}")), Duration::from_millis(100))
                .await
                .unwrap();
        }
        pool.shutdown(Duration::from_secs(2)).await;
        assert_eq!(*handler.seen.lock(), ["r0", "r1", "r2", "r3", "r4"]);
    }

    #[tokio::test]
    async fn full_queue_is_server_busy() {
        let gate = Arc::new(Notify::new());
        let handler = Arc::new(Gated {
            gate: gate.clone(),
            count: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(1, 1, handler.clone());

        // First item is taken by the (blocked) worker, second fills the
        // queue; the third cannot fit inside its wait budget.
        pool.enqueue(item("a"), Duration::from_millis(200)).await.unwrap();
        while handler.count.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.enqueue(item("b"), Duration::from_millis(200)).await.unwrap();

        let (err, returned) = pool
            .enqueue(item("c"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerBusy));
        assert_eq!(returned.request.id, "c");

        gate.notify_waiters();
        gate.notify_one();
        assert!(pool.shutdown(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let handler = Arc::new(Recording {
            seen: SyncMutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(2, 4, handler);
        assert!(pool.shutdown(Duration::from_millis(500)).await);

        let (err, _) = pool
            .enqueue(item("late"), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let handler = Arc::new(Recording {
            seen: SyncMutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(2, 4, handler);
        assert!(pool.shutdown(Duration::from_millis(500)).await);
        assert!(pool.shutdown(Duration::from_millis(500)).await);
    }

    #[test]
    fn deadline_clamping() {
        let general = General::default(); // default 30s, max 30s
        assert_eq!(clamp_deadline(0, &general), Duration::from_secs(30));
        assert_eq!(clamp_deadline(500, &general), Duration::from_millis(500));
        assert_eq!(clamp_deadline(120_000, &general), Duration::from_secs(30));
    }
}
