//! Delayed work queues with a fixed worker pool.
//!
//! The same shape serves three consumers: the responder pool draining
//! inbound socket messages, and the two broadcasters draining channel
//! notifications.  Items submitted with a delay sit in a due-time heap
//! until a feeder task promotes them onto the ready queue; `workers`
//! consumer tasks drain the ready queue one item at a time.
//!
//! All tasks observe the stop latch and exit promptly, finishing at most
//! the item they already hold.

use crate::lifecycle::Stopped;
use futures_util::future::BoxFuture;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::debug;

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct DelayedCaller<T> {
    label: &'static str,
    intake: mpsc::UnboundedSender<(Option<Duration>, T)>,
}

impl<T: Send + 'static> DelayedCaller<T> {
    /// Spawn the feeder and `workers` consumer tasks.  Must be called from
    /// within a tokio runtime.
    pub fn start(
        label: &'static str,
        workers: usize,
        stopped: Stopped,
        handler: Handler<T>,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        tokio::spawn(feed(label, intake_rx, ready_tx, stopped.clone()));

        let ready_rx = Arc::new(Mutex::new(ready_rx));
        for _ in 0..workers.max(1) {
            let ready_rx = Arc::clone(&ready_rx);
            let handler = Arc::clone(&handler);
            let stopped = stopped.clone();
            tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = stopped.wait() => break,
                        received = async { ready_rx.lock().await.recv().await } => {
                            match received {
                                Some(item) => item,
                                None => break,
                            }
                        }
                    };
                    handler(item).await;
                }
            });
        }

        DelayedCaller { label, intake: intake_tx }
    }

    /// Queue an item for immediate dispatch.
    pub fn submit(&self, item: T) {
        if self.intake.send((None, item)).is_err() {
            debug!(queue = self.label, "dropping item submitted after shutdown");
        }
    }

    /// Queue an item to become ready after `delay`.
    pub fn submit_after(&self, item: T, delay: Duration) {
        let delay = (!delay.is_zero()).then_some(delay);
        if self.intake.send((delay, item)).is_err() {
            debug!(queue = self.label, "dropping item submitted after shutdown");
        }
    }
}

// ---------------------------------------------------------------------------
// Feeder task
// ---------------------------------------------------------------------------

struct Delayed<T> {
    due: Instant,
    seq: u64,
    item: T,
}

// Min-heap by due time; `seq` keeps same-instant items FIFO.
impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then(other.seq.cmp(&self.seq))
    }
}
impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl<T> Eq for Delayed<T> {}

async fn feed<T: Send>(
    label: &'static str,
    mut intake: mpsc::UnboundedReceiver<(Option<Duration>, T)>,
    ready: mpsc::UnboundedSender<T>,
    stopped: Stopped,
) {
    let mut heap: BinaryHeap<Delayed<T>> = BinaryHeap::new();
    let mut seq: u64 = 0;
    loop {
        let next_due = heap.peek().map(|d| d.due);
        tokio::select! {
            _ = stopped.wait() => break,
            received = intake.recv() => {
                match received {
                    None => break,
                    Some((None, item)) => {
                        if ready.send(item).is_err() {
                            break;
                        }
                    }
                    Some((Some(delay), item)) => {
                        heap.push(Delayed { due: Instant::now() + delay, seq, item });
                        seq += 1;
                    }
                }
            }
            () = async {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending().await,
                }
            }, if next_due.is_some() => {
                let now = Instant::now();
                while heap.peek().is_some_and(|d| d.due <= now) {
                    let delayed = heap.pop().expect("peeked entry exists");
                    if ready.send(delayed.item).is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!(queue = label, "feeder exiting");
}
