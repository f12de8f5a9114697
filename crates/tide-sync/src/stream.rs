//! # Data Stream
//!
//! Single-producer, single-consumer bridge between a transport task and the
//! sync state machine, plus the credit accounting that bounds how much the
//! server may send ahead of the consumer.
//!
//! ## Flow Control
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   server ──lines──► transport ──enqueue()──► [ queue ] ──read()──► sm   │
//! │     ▲                   │                        │                      │
//! │     │                   │ events                 │ len <= low_water     │
//! │     │                   ◄──── LowWater ──────────┘                      │
//! │     │                   ◄──── Closed  (close() from either side)        │
//! │     │                   │                                               │
//! │     └── request_n(k) ───┘  k = batch - outstanding, only when           │
//! │                            outstanding <= low_water                     │
//! │                                                                         │
//! │  buffered + outstanding never exceeds batch + low_water, however slow   │
//! │  the consumer is.                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Notifications delivered to stream listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStreamEvent {
    /// The consumer drained the queue to the low-water mark.
    LowWater,
    /// The stream was closed. Sent exactly once.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStreamOptions {
    pub low_water: usize,
    /// Producers that can pause (HTTP) stop reading upstream at this length.
    pub high_water: usize,
}

impl Default for DataStreamOptions {
    fn default() -> Self {
        DataStreamOptions {
            low_water: 5,
            high_water: 10,
        }
    }
}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    listeners: Vec<mpsc::UnboundedSender<DataStreamEvent>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    readable: Notify,
    options: DataStreamOptions,
}

/// Queue of items with close signalling. Cheap to clone; clones share the queue.
pub struct DataStream<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DataStream<T> {
    fn clone(&self) -> Self {
        DataStream {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for DataStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DataStream")
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Default for DataStream<T> {
    fn default() -> Self {
        Self::new(DataStreamOptions::default())
    }
}

impl<T> DataStream<T> {
    pub fn new(options: DataStreamOptions) -> Self {
        DataStream {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    closed: false,
                    listeners: Vec::new(),
                }),
                readable: Notify::new(),
                options,
            }),
        }
    }

    pub fn options(&self) -> DataStreamOptions {
        self.inner.options
    }

    /// Registers a listener. A listener added after close receives `Closed` immediately.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DataStreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        if state.closed {
            let _ = tx.send(DataStreamEvent::Closed);
        } else {
            state.listeners.push(tx);
        }
        rx
    }

    /// Appends an item. Never blocks. Returns `false` once the stream is closed.
    pub fn enqueue(&self, item: T) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return false;
            }
            state.queue.push_back(item);
        }
        self.inner.readable.notify_one();
        true
    }

    /// Next item, waiting while the queue is empty.
    ///
    /// Items queued before close are still returned; `None` after that.
    pub async fn read(&self) -> Option<T> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    if state.queue.len() <= self.inner.options.low_water && !state.closed {
                        emit(&mut state.listeners, DataStreamEvent::LowWater);
                    }
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.inner.readable.notified().await;
        }
    }

    /// Closes the stream. Idempotent; listeners see `Closed` once.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            emit(&mut state.listeners, DataStreamEvent::Closed);
            state.listeners.clear();
        }
        self.inner.readable.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when a pausable producer should stop reading upstream.
    pub fn is_full(&self) -> bool {
        self.len() >= self.inner.options.high_water
    }
}

fn emit(listeners: &mut Vec<mpsc::UnboundedSender<DataStreamEvent>>, event: DataStreamEvent) {
    listeners.retain(|listener| listener.send(event).is_ok());
}

// =============================================================================
// Credit Window
// =============================================================================

/// Credit granted to the server but not yet used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditWindow {
    batch: usize,
    low_water: usize,
    outstanding: usize,
}

impl CreditWindow {
    pub fn new(batch: usize, low_water: usize) -> Self {
        CreditWindow {
            batch,
            low_water,
            outstanding: 0,
        }
    }

    /// Credit for the first request frame.
    pub fn initial(&mut self) -> usize {
        self.outstanding = self.batch;
        self.batch
    }

    /// Records one line received from the server.
    pub fn on_item(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Credit to grant when the consumer reaches low water, if any.
    pub fn on_low_water(&mut self) -> Option<usize> {
        if self.outstanding > self.low_water {
            return None;
        }
        let grant = self.batch - self.outstanding;
        if grant == 0 {
            return None;
        }
        self.outstanding = self.batch;
        Some(grant)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_enqueue_read_close() {
        let stream = DataStream::new(DataStreamOptions { low_water: 0, high_water: 4 });
        assert!(stream.enqueue(1));
        assert!(stream.enqueue(2));
        stream.close();
        stream.close();
        assert!(!stream.enqueue(3));

        assert_eq!(stream.read().await, Some(1));
        assert_eq!(stream.read().await, Some(2));
        assert_eq!(stream.read().await, None);
    }

    #[tokio::test]
    async fn test_read_waits_for_producer() {
        let stream: DataStream<u32> = DataStream::default();
        let producer = stream.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(7);
        });
        assert_eq!(stream.read().await, Some(7));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_events() {
        let stream = DataStream::new(DataStreamOptions { low_water: 1, high_water: 3 });
        let mut events = stream.subscribe();
        for i in 0..3 {
            stream.enqueue(i);
        }
        assert!(stream.is_full());

        stream.read().await;
        assert!(events.try_recv().is_err());
        stream.read().await;
        assert_eq!(events.try_recv().unwrap(), DataStreamEvent::LowWater);

        stream.close();
        stream.close();
        assert_eq!(events.recv().await, Some(DataStreamEvent::Closed));
        assert_eq!(events.recv().await, None);

        let mut late = stream.subscribe();
        assert_eq!(late.recv().await, Some(DataStreamEvent::Closed));
    }

    #[test]
    fn test_credit_window_bounds_outstanding() {
        let mut window = CreditWindow::new(10, 5);
        assert_eq!(window.initial(), 10);

        // Nothing to grant while plenty is outstanding.
        for _ in 0..4 {
            window.on_item();
        }
        assert_eq!(window.on_low_water(), None);

        window.on_item();
        assert_eq!(window.on_low_water(), Some(5));
        assert_eq!(window.outstanding(), 10);

        // Repeated low-water signals without new items grant nothing more.
        assert_eq!(window.on_low_water(), None);
    }

    #[test]
    fn test_stalled_consumer_gets_no_extra_credit() {
        let mut window = CreditWindow::new(10, 5);
        window.initial();
        // The server uses all credit; the consumer never drains, so no
        // low-water events arrive and outstanding stays at zero.
        for _ in 0..10 {
            window.on_item();
        }
        assert_eq!(window.outstanding(), 0);
        // One replenishment once the consumer catches up.
        assert_eq!(window.on_low_water(), Some(10));
        assert_eq!(window.on_low_water(), None);
    }
}
