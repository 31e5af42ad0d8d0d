//! Background worker that owns the pending batch and calls the consumer.
use crate::batch::{Batch, PollResult};
use crate::dedupe::Dedupe;
use crossbeam_channel::{after, never, select, Receiver};
use log::{debug, error, trace};

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::vec::Drain;

/// Boxed consumer callback as stored by the worker.
pub type Consumer<I> = Box<dyn FnMut(Drain<'_, I>) + Send>;

/// Pushed item with the stamp taken before it was handed over.
pub(crate) type Stamped<I> = (u64, I);

/// State shared between the queue handle and the worker.
///
/// Pushes and flush requests are stamped from the same counter so the worker can tell whether
/// a pending flush request was made before or after an item was pushed.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    // Published buffer length
    len: AtomicUsize,
    clock: AtomicU64,
    // Stamp of the latest flush request; 0 if none
    flush_requested: AtomicU64,
}

impl Shared {
    pub(crate) fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn request_flush(&self) {
        let stamp = self.tick();
        self.flush_requested.fetch_max(stamp, Ordering::SeqCst);
    }

    fn flush_requested(&self) -> u64 {
        self.flush_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn set_len(&self, len: usize) {
        self.len.store(len, Ordering::Release);
    }
}

/// Why a batch was handed to the consumer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FlushReason {
    MaxSize,
    MaxDuration,
    Signal,
    Close,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            FlushReason::MaxSize => "max size",
            FlushReason::MaxDuration => "max duration",
            FlushReason::Signal => "flush signal",
            FlushReason::Close => "close",
        })
    }
}

// What woke the worker up.
enum Event<I> {
    Item(Stamped<I>),
    Flush,
    Timer,
    Close,
    Disconnected,
}

pub(crate) struct Worker<I> {
    items: Receiver<Stamped<I>>,
    flush_signal: Receiver<()>,
    close_signal: Receiver<()>,
    batch: Batch<I>,
    consume: Consumer<I>,
    dedupe: Option<Dedupe<I>>,
    shared: Arc<Shared>,
    // Stamp of the latest flush request already acted upon
    flush_handled: u64,
    // Number of batches consumer panicked on
    panicked: usize,
}

impl<I> Worker<I> {
    pub(crate) fn new(
        batch: Batch<I>,
        consume: Consumer<I>,
        dedupe: Option<Dedupe<I>>,
        items: Receiver<Stamped<I>>,
        flush_signal: Receiver<()>,
        close_signal: Receiver<()>,
        shared: Arc<Shared>,
    ) -> Worker<I> {
        Worker {
            items,
            flush_signal,
            close_signal,
            batch,
            consume,
            dedupe,
            shared,
            flush_handled: 0,
            panicked: 0,
        }
    }

    /// Runs until close signal is received or the queue handle is gone.
    ///
    /// Returns number of batches consumer panicked on.
    pub(crate) fn run(mut self) -> usize {
        loop {
            // Remaining time is recomputed from the batch start on every pass so a stale
            // timer can only make us poll again
            let timer = match self.batch.poll() {
                PollResult::Ready => {
                    self.flush(FlushReason::MaxDuration);
                    continue;
                }
                PollResult::NotReady(Some(ready_after)) => after(ready_after),
                // No outstanding items; wait for first one
                PollResult::NotReady(None) => never(),
            };

            let event = select! {
                recv(self.items) -> item => {
                    item.map(Event::Item).unwrap_or(Event::Disconnected)
                },
                recv(self.flush_signal) -> signal => {
                    signal.map(|()| Event::Flush).unwrap_or(Event::Disconnected)
                },
                recv(self.close_signal) -> _ => Event::Close,
                recv(timer) -> _ => Event::Timer,
            };

            if !self.handle(event) {
                break;
            }
        }

        // Release producers blocked on push before running the last batch
        self.items = never();

        if !self.batch.is_empty() {
            self.flush(FlushReason::Close);
        }

        debug!("queue worker exiting");
        self.panicked
    }

    /// Returns `false` when the worker should stop accepting items.
    fn handle(&mut self, event: Event<I>) -> bool {
        match event {
            Event::Item((pushed, item)) => {
                let requested = self.shared.flush_requested();
                if requested > self.flush_handled {
                    self.flush_handled = requested;

                    if requested < pushed {
                        // Requested before this item was pushed; applies to earlier items only
                        self.flush_requested();
                        self.append(item);
                    } else {
                        self.append(item);
                        self.flush_requested();
                    }
                } else {
                    self.append(item);
                }
            }
            Event::Flush => {
                let requested = self.shared.flush_requested();
                if requested > self.flush_handled {
                    self.flush_handled = requested;
                    self.flush_requested();
                }
            }
            // Checked by poll on next pass
            Event::Timer => (),
            Event::Close => return false,
            // Queue handle gone
            Event::Disconnected => return false,
        }
        true
    }

    fn append(&mut self, item: I) {
        self.batch.append(item);

        if let Some(dedupe) = self.dedupe.as_mut() {
            self.batch.rewrite(|items| dedupe(items));
        }

        let len = self.batch.len();
        self.shared.set_len(len);
        trace!("appended item; {} item(s) buffered", len);

        if len >= self.batch.max_size() {
            self.flush(FlushReason::MaxSize);
        }
    }

    fn flush_requested(&mut self) {
        if !self.batch.is_empty() {
            self.flush(FlushReason::Signal);
        }
    }

    fn flush(&mut self, reason: FlushReason) {
        let size = self.batch.len();
        debug!("flushing batch of {} item(s) due to {}", size, reason);

        let consume = &mut self.consume;
        let drain = self.batch.drain();
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| consume(drain))) {
            self.panicked += 1;
            error!(
                "batch consumer panicked on batch of {} item(s): {}",
                size,
                panic_message(panic.as_ref())
            );
        }

        // Consumer may have leaked the drain iterator
        self.batch.clear();
        self.shared.set_len(0);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    pub use super::*;
    use crossbeam_channel::{bounded, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Harness {
        items: Sender<Stamped<u32>>,
        flush: Sender<()>,
        close: Sender<()>,
        shared: Arc<Shared>,
        batches: Arc<Mutex<Vec<Vec<u32>>>>,
    }

    impl Harness {
        fn push(&self, item: u32) {
            self.items.send((self.shared.tick(), item)).unwrap();
        }

        fn flush(&self) {
            self.shared.request_flush();
            let _ = self.flush.try_send(());
        }

        fn batches(&self) -> Vec<Vec<u32>> {
            self.batches.lock().unwrap().clone()
        }
    }

    fn worker(
        max_size: usize,
        max_duration: Duration,
        dedupe: Option<Dedupe<u32>>,
    ) -> (Harness, Worker<u32>) {
        let (items_tx, items_rx) = bounded(0);
        let (flush_tx, flush_rx) = bounded(1);
        let (close_tx, close_rx) = bounded(1);
        let shared = Arc::new(Shared::default());
        let batches = Arc::new(Mutex::new(Vec::new()));

        let sink = batches.clone();
        let consume: Consumer<u32> = Box::new(move |batch: Drain<'_, u32>| {
            sink.lock().unwrap().push(batch.collect());
        });

        let worker = Worker::new(
            Batch::new(max_size, max_duration),
            consume,
            dedupe,
            items_rx,
            flush_rx,
            close_rx,
            shared.clone(),
        );

        (
            Harness {
                items: items_tx,
                flush: flush_tx,
                close: close_tx,
                shared,
                batches,
            },
            worker,
        )
    }

    #[test]
    fn test_worker_max_size() {
        let (harness, worker) = worker(2, Duration::from_secs(10), None);
        let thread = std::thread::spawn(move || worker.run());

        for i in 1..=5 {
            harness.push(i);
        }
        harness.close.send(()).unwrap();

        assert_eq!(thread.join().unwrap(), 0);
        assert_eq!(harness.batches(), [vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(harness.shared.len(), 0);
    }

    #[test]
    fn test_worker_flush_signal() {
        let (harness, worker) = worker(10, Duration::from_secs(10), None);
        let thread = std::thread::spawn(move || worker.run());

        // nothing to flush yet
        harness.flush();

        harness.push(1);
        harness.push(2);
        harness.flush();
        harness.push(3);
        harness.close.send(()).unwrap();

        assert_eq!(thread.join().unwrap(), 0);
        assert_eq!(harness.batches(), [vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_worker_flush_signal_before_items() {
        let (harness, worker) = worker(10, Duration::from_secs(10), None);

        // pending before the worker gets to select
        harness.flush();
        let thread = std::thread::spawn(move || worker.run());

        harness.push(1);
        harness.push(2);
        harness.close.send(()).unwrap();

        assert_eq!(thread.join().unwrap(), 0);
        assert_eq!(harness.batches(), [vec![1, 2]]);
    }

    #[test]
    fn test_worker_flush_signal_between_items() {
        let (harness, worker) = worker(10, Duration::from_secs(10), None);
        let thread = std::thread::spawn(move || worker.run());

        harness.push(1);
        harness.flush();
        harness.push(2);
        harness.close.send(()).unwrap();

        assert_eq!(thread.join().unwrap(), 0);
        assert_eq!(harness.batches(), [vec![1], vec![2]]);
    }

    #[test]
    fn test_worker_flush_request_ordering() {
        let (harness, mut worker) = worker(10, Duration::from_secs(10), None);

        // request made before the item was pushed does not cover it
        harness.shared.request_flush();
        let pushed = harness.shared.tick();
        assert!(worker.handle(Event::Item((pushed, 1))));
        assert!(harness.batches().is_empty());
        assert_eq!(harness.shared.len(), 1);

        // request made after the item was pushed but before the worker took it covers it
        let pushed = harness.shared.tick();
        harness.shared.request_flush();
        assert!(worker.handle(Event::Item((pushed, 2))));
        assert_eq!(harness.batches(), [vec![1, 2]]);

        // signal for a request already acted upon does nothing
        assert!(worker.handle(Event::Item((harness.shared.tick(), 3))));
        assert!(worker.handle(Event::Flush));
        assert_eq!(harness.batches(), [vec![1, 2]]);

        harness.shared.request_flush();
        assert!(worker.handle(Event::Flush));
        assert_eq!(harness.batches(), [vec![1, 2], vec![3]]);

        assert!(!worker.handle(Event::Close));
    }

    #[test]
    fn test_worker_max_duration() {
        let (harness, worker) = worker(10, Duration::from_millis(100), None);
        let thread = std::thread::spawn(move || worker.run());

        harness.push(1);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(harness.batches(), [vec![1]]);

        harness.close.send(()).unwrap();
        assert_eq!(thread.join().unwrap(), 0);
        assert_eq!(harness.batches().len(), 1);
    }

    #[test]
    fn test_worker_dedupe_before_size_check() {
        let dedupe: Dedupe<u32> = Box::new(crate::dedupe::first_seen::<u32>);
        let (harness, worker) = worker(3, Duration::from_secs(10), Some(dedupe));
        let thread = std::thread::spawn(move || worker.run());

        for i in [1, 1, 1, 2, 2, 3, 4].iter() {
            harness.push(*i);
        }
        harness.close.send(()).unwrap();

        assert_eq!(thread.join().unwrap(), 0);
        assert_eq!(harness.batches(), [vec![1, 2, 3], vec![4]]);
    }

    #[test]
    fn test_worker_handle_gone() {
        let (harness, worker) = worker(10, Duration::from_secs(10), None);
        let thread = std::thread::spawn(move || worker.run());

        harness.push(1);
        let batches = harness.batches.clone();
        drop(harness);

        assert_eq!(thread.join().unwrap(), 0);
        assert_eq!(*batches.lock().unwrap(), [vec![1]]);
    }

    #[test]
    fn test_worker_consumer_panic() {
        let (items_tx, items_rx) = bounded(0);
        let (_flush_tx, flush_rx) = bounded(1);
        let (close_tx, close_rx) = bounded(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let consume: Consumer<u32> = Box::new(move |batch: Drain<'_, u32>| {
            let batch: Vec<u32> = batch.collect();
            if batch.contains(&13) {
                panic!("unlucky batch");
            }
            sink.lock().unwrap().push(batch);
        });

        let worker = Worker::new(
            Batch::new(2, Duration::from_secs(10)),
            consume,
            None,
            items_rx,
            flush_rx,
            close_rx,
            Arc::new(Shared::default()),
        );
        let thread = std::thread::spawn(move || worker.run());

        for i in [1, 2, 13, 14, 5].iter() {
            items_tx.send((0, *i)).unwrap();
        }
        close_tx.send(()).unwrap();

        assert_eq!(thread.join().unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), [vec![1, 2], vec![5]]);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"boom".to_owned()), "boom");
        assert_eq!(panic_message(&42u8), "<non-string panic payload>");
    }
}
