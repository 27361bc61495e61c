//! Ordered task queue: the single serialization point for event dispatch.
//!
//! Any number of producers push tasks; one consumer drains them strictly in
//! submission order, one at a time. A task that fails is logged and never
//! retried. On stop, queued-but-undelivered tasks are abandoned.

#![forbid(unsafe_code)]

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// An opaque unit of deferred work wrapping one event's dispatch.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Producer handle. Cheap to clone; submission order across clones follows
/// channel send order.
#[derive(Clone)]
pub struct OrderedQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl OrderedQueue {
    /// Create the queue and the runner that will drain it.
    pub fn new() -> (Self, QueueRunner) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, QueueRunner { rx })
    }

    pub fn push(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("queue consumer gone; task dropped");
        }
    }
}

/// Single consumer end of the queue.
pub struct QueueRunner {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl QueueRunner {
    /// Drain tasks until the stop signal flips or every producer is dropped.
    /// Tasks still queued when stop flips are not executed.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        if *stop.borrow() {
            debug!("queue stopped before start");
            return;
        }
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!("queue stopped; abandoning pending tasks");
                        break;
                    }
                }
                maybe = self.rx.recv() => match maybe {
                    Some(task) => {
                        if let Err(e) = task() {
                            warn!(error = %e, "queue task failed; continuing with next");
                        }
                    }
                    None => {
                        debug!("all producers dropped; queue drained");
                        break;
                    }
                },
            }
        }
    }
}
