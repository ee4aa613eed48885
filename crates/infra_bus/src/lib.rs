//! Event plumbing between producers, the dispatcher and presentation.
//!
//! [`EventBus`] is the single-consumer FIFO pipe every producer publishes
//! into. [`RingBus`] is a lossy broadcast topic used to fan display events
//! out to any number of presentation subscribers.

use core_types::BusError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Producer handle of the event bus. Cheap to clone; every producer task
/// owns one.
#[derive(Debug)]
pub struct EventBus<T> {
    tx: mpsc::Sender<T>,
    closed: CancellationToken,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

/// The one and only consumer side of an [`EventBus`].
#[derive(Debug)]
pub struct EventReceiver<T> {
    rx: mpsc::Receiver<T>,
    closed: CancellationToken,
}

impl<T: Send + 'static> EventBus<T> {
    pub fn new(capacity: usize) -> (Self, EventReceiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(16));
        let closed = CancellationToken::new();
        (
            Self {
                tx,
                closed: closed.clone(),
            },
            EventReceiver { rx, closed },
        )
    }

    /// Enqueue an event, waiting while the queue is full. A producer blocked
    /// here is released with [`BusError::Closed`] when the bus closes.
    pub async fn publish(&self, event: T) -> Result<(), BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(BusError::Closed),
            sent = self.tx.send(event) => {
                sent.map_err(|_| BusError::Closed)?;
                metrics::counter!("bus.published").increment(1);
                Ok(())
            }
        }
    }

    /// Non-waiting variant of [`EventBus::publish`].
    pub fn try_publish(&self, event: T) -> Result<(), BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        match self.tx.try_send(event) {
            Ok(()) => {
                metrics::counter!("bus.published").increment(1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(BusError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::Closed),
        }
    }

    /// Stop accepting events. Already queued events are still delivered,
    /// after which [`EventReceiver::consume`] yields `None`.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::info!("event bus closing");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl<T: Send + 'static> EventReceiver<T> {
    /// Next event in arrival order, or `None` once the bus is closed and
    /// drained (or every producer handle is gone).
    pub async fn consume(&mut self) -> Option<T> {
        tokio::select! {
            biased;
            event = self.rx.recv() => event,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }
}

/// Broadcast topic. Slow subscribers lag and drop old events; publishing
/// never waits.
#[derive(Clone)]
pub struct RingBus<T: Clone + Send + Sync + 'static> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> RingBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Returns how many subscribers received the event. Having none is fine.
    pub fn publish(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }
}
