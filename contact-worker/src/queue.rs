//! Bounded FIFO queues connecting the pipeline stages.
//!
//! A thin layer over `tokio::sync::mpsc` that keeps a depth counter readable from outside the
//! stages. The depth is incremented before an item is handed to the channel and decremented after
//! it is received, so it never underflows.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use tokio::sync::mpsc;

#[derive(Clone, Debug, Default)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

pub struct StageSender<T> {
    name: &'static str,
    sender: mpsc::Sender<T>,
    depth: QueueDepth,
}

pub struct StageReceiver<T> {
    name: &'static str,
    receiver: mpsc::Receiver<T>,
    depth: QueueDepth,
}

pub enum Received<T> {
    Item(T),
    /// Nothing arrived within the timeout, the queue is still open.
    Timeout,
    /// The queue is empty and its sender is gone.
    Closed,
}

/// Create a queue holding at most `capacity` items. `depth` is reset, so the same counter can
/// be reused across pipeline runs.
///
/// Panics if `capacity` is zero, like `mpsc::channel`.
pub fn bounded<T>(
    name: &'static str,
    capacity: usize,
    depth: QueueDepth,
) -> (StageSender<T>, StageReceiver<T>) {
    let (sender, receiver) = mpsc::channel(capacity);
    depth.reset();

    (
        StageSender {
            name,
            sender,
            depth: depth.clone(),
        },
        StageReceiver {
            name,
            receiver,
            depth,
        },
    )
}

impl<T> StageSender<T> {
    /// Waits while the queue is full. Fails, returning the item, once the receiver is gone.
    /// Cancel safe: dropping the future before it completes leaves the queue untouched.
    pub async fn send(&self, item: T) -> Result<(), T> {
        match self.sender.reserve().await {
            Ok(permit) => {
                self.depth.0.fetch_add(1, Ordering::Relaxed);
                permit.send(item);
                self.report_depth();
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    fn report_depth(&self) {
        metrics::gauge!("contact_queue_depth", &[("queue", self.name)]).set(self.depth.get() as f64);
    }
}

impl<T> StageReceiver<T> {
    pub async fn recv_timeout(&mut self, timeout: time::Duration) -> Received<T> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(item)) => {
                self.depth.0.fetch_sub(1, Ordering::Relaxed);
                metrics::gauge!("contact_queue_depth", &[("queue", self.name)])
                    .set(self.depth.get() as f64);
                Received::Item(item)
            }
            Ok(None) => Received::Closed,
            Err(_) => Received::Timeout,
        }
    }
}
