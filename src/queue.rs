/*!
This module provides `BatchQueue` that collects items pushed from any number of threads and
hands them to a consumer callback in batches of up to `batch_size` items or after `timeout` has
elapsed since the first item of the batch was pushed.

# Example

```rust
use batch_queue::BatchQueue;
use std::sync::{Arc, Mutex};
use std::time::Duration;

let batches = Arc::new(Mutex::new(Vec::new()));
let sink = batches.clone();

// Batches of up to 4 items, emitted at latest 200 ms after first item was pushed
let queue = BatchQueue::new(move |batch: std::vec::Drain<'_, u32>| {
    sink.lock().unwrap().push(batch.collect::<Vec<_>>());
}, 4, Duration::from_millis(200)).unwrap();

for i in 1..=6 {
    queue.push(i).unwrap();
}

// Remaining items are emitted before close returns
queue.close().unwrap();

assert_eq!(*batches.lock().unwrap(), [vec![1, 2, 3, 4], vec![5, 6]]);
```
!*/

use crate::batch::Batch;
use crate::dedupe::{self, Dedupe};
use crate::error::{BuildError, CloseError, ClosedError};
use crate::worker::{Consumer, Shared, Stamped, Worker};
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, warn};

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use std::vec::Drain;

const DEFAULT_THREAD_NAME: &str = "batch-queue worker";

/// Configures and starts `BatchQueue`.
pub struct Builder<I> {
    batch_size: usize,
    timeout: Duration,
    consume: Option<Consumer<I>>,
    dedupe: Option<Dedupe<I>>,
    thread_name: String,
}

impl<I: Send + 'static> Builder<I> {
    /// Creates builder given maximum number of items in a batch (`batch_size`) and maximum
    /// duration (`timeout`) a batch can be collecting items for since its first item was pushed.
    pub fn new(batch_size: usize, timeout: Duration) -> Builder<I> {
        Builder {
            batch_size,
            timeout,
            consume: None,
            dedupe: None,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }

    /// Sets callback that will be called on the worker thread with each complete batch.
    ///
    /// Items not taken out of the `Drain` iterator are dropped when the callback returns.
    /// Without a consumer batches are dropped.
    pub fn consume(mut self, consume: impl FnMut(Drain<'_, I>) + Send + 'static) -> Builder<I> {
        self.consume = Some(Box::new(consume));
        self
    }

    /// Sets hook that rewrites the whole pending buffer after every pushed item.
    pub fn dedupe(mut self, dedupe: impl FnMut(&mut Vec<I>) + Send + 'static) -> Builder<I> {
        self.dedupe = Some(Box::new(dedupe));
        self
    }

    /// Drops repeated items from pending buffer keeping the first pushed one.
    pub fn dedupe_first_seen(self) -> Builder<I>
    where
        I: Hash + Eq,
    {
        self.dedupe(dedupe::first_seen::<I>)
    }

    /// Sets name of the worker thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Builder<I> {
        self.thread_name = name.into();
        self
    }

    /// Validates configuration and starts the worker thread.
    pub fn build(self) -> Result<BatchQueue<I>, BuildError> {
        if self.batch_size == 0 {
            return Err(BuildError::ZeroBatchSize);
        }

        if self.timeout == Duration::from_secs(0) {
            return Err(BuildError::ZeroTimeout);
        }

        let consume: Consumer<I> = match self.consume {
            Some(consume) => consume,
            None => Box::new(|_batch: Drain<'_, I>| ()),
        };

        // Zero capacity makes push a hand-off to the worker
        let (items_tx, items_rx) = crossbeam_channel::bounded(0);
        let (flush_tx, flush_rx) = crossbeam_channel::bounded(1);
        let (close_tx, close_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(Shared::default());

        let worker = Worker::new(
            Batch::new(self.batch_size, self.timeout),
            consume,
            self.dedupe,
            items_rx,
            flush_rx,
            close_rx,
            shared.clone(),
        );

        let thread = std::thread::Builder::new()
            .name(self.thread_name)
            .spawn(move || worker.run())
            .map_err(BuildError::Spawn)?;

        debug!(
            "started batch queue with batch size {} and timeout {:?}",
            self.batch_size, self.timeout
        );

        Ok(BatchQueue {
            items: items_tx,
            flush_signal: flush_tx,
            close_signal: close_tx,
            shared,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(thread)),
            batch_size: self.batch_size,
            timeout: self.timeout,
        })
    }
}

impl<I> fmt::Debug for Builder<I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Builder")
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .field("consume", &self.consume.is_some())
            .field("dedupe", &self.dedupe.is_some())
            .field("thread_name", &self.thread_name)
            .finish()
    }
}

/// Collects pushed items into batches and calls consumer with each batch on a background worker
/// thread.
///
/// Batch is complete when:
/// * `batch_size` items were collected,
/// * `timeout` has elapsed since the first item of the batch was pushed,
/// * `flush()` was called,
/// * `close()` was called or the queue was dropped.
///
/// `push()` blocks until the worker takes the item so a slow consumer slows down producers.
/// Queue can be shared between threads with `Arc`.
pub struct BatchQueue<I> {
    items: Sender<Stamped<I>>,
    // Wakes the worker up; requests themselves are recorded in `shared`
    flush_signal: Sender<()>,
    close_signal: Sender<()>,
    shared: Arc<Shared>,
    // Set by first call to close
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<usize>>>,
    batch_size: usize,
    timeout: Duration,
}

impl<I: Send + 'static> BatchQueue<I> {
    /// Creates queue calling `consume` with batches of up to `batch_size` items or after `timeout`
    /// since the first item of the batch was pushed.
    ///
    /// Returns error if `batch_size` or `timeout` is zero.
    pub fn new(
        consume: impl FnMut(Drain<'_, I>) + Send + 'static,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<BatchQueue<I>, BuildError> {
        Builder::new(batch_size, timeout).consume(consume).build()
    }

    /// Creates `Builder` to configure the queue with.
    pub fn builder(batch_size: usize, timeout: Duration) -> Builder<I> {
        Builder::new(batch_size, timeout)
    }
}

impl<I> BatchQueue<I> {
    /// Hands item over to the worker.
    ///
    /// This call will block until the worker is ready to take the item.
    ///
    /// Returns `Err(ClosedError(item))` after `close()` was called or if the worker thread is gone.
    pub fn push(&self, item: I) -> Result<(), ClosedError<I>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClosedError(item));
        }

        let stamp = self.shared.tick();
        self.items
            .send((stamp, item))
            .map_err(|err| ClosedError(err.into_inner().1))
    }

    /// Requests current batch to be emitted now regardless of its size and age.
    ///
    /// Does not wait for the batch to be consumed. Requests made while another one is still
    /// pending are merged with it. Nothing happens if there are no buffered items.
    pub fn flush(&self) {
        self.shared.request_flush();

        match self.flush_signal.try_send(()) {
            Ok(()) => (),
            Err(TrySendError::Full(())) => debug!("flush already pending"),
            Err(TrySendError::Disconnected(())) => debug!("flush on a closed queue"),
        }
    }

    /// Stops accepting items, emits buffered items as the last batch and waits for the
    /// worker thread to finish.
    ///
    /// Once this returns no more calls to consumer will be made.
    ///
    /// Returns:
    /// * `Err(CloseError::AlreadyClosed)` if called again,
    /// * `Err(CloseError::ConsumerPanicked { batches })` if consumer panicked on some of the
    ///   batches; remaining batches were still consumed,
    /// * `Err(CloseError::WorkerPanicked)` if the worker thread died; buffered items are lost.
    pub fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(CloseError::AlreadyClosed);
        }

        self.shutdown()
    }

    /// Returns number of currently buffered items.
    ///
    /// This is a snapshot; the worker may be appending or flushing at the same time.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn shutdown(&self) -> Result<(), CloseError> {
        // Worker will be gone already if it has panicked
        let _ = self.close_signal.try_send(());

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match worker.map(JoinHandle::join) {
            Some(Ok(0)) => {
                debug!("batch queue closed");
                Ok(())
            }
            Some(Ok(batches)) => Err(CloseError::ConsumerPanicked { batches }),
            Some(Err(_panic)) => Err(CloseError::WorkerPanicked),
            // Only one caller gets past closed flag
            None => Err(CloseError::AlreadyClosed),
        }
    }
}

impl<I> Drop for BatchQueue<I> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        warn!("batch queue dropped without close; flushing buffered items");
        if let Err(err) = self.shutdown() {
            warn!("failed to close batch queue on drop: {}", err);
        }
    }
}

impl<I> fmt::Debug for BatchQueue<I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BatchQueue")
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .field("len", &self.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
