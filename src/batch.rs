//! Pending buffer of the queue worker along with the `Instant` its current batch was started at.
use std::time::{Duration, Instant};
use std::vec::Drain;

/// Represents result from `Batch.poll()` where batch is `Ready` to be consumed or `NotReady` yet.
#[derive(Debug, PartialEq, Eq)]
pub enum PollResult {
    /// Batch has reached `max_size` or `max_duration` limit.
    Ready,
    /// Batch is not ready yet.
    /// Provides `Duration` after which `max_duration` limit will be reached
    /// if batch has at least one item.
    NotReady(Option<Duration>),
}

/// Buffers items up to `max_size` or until `max_duration` has elapsed since the first item
/// appended to the batch.
///
/// This base implementation does not handle actual awaiting for batch duration timeout.
#[derive(Debug)]
pub struct Batch<I> {
    items: Vec<I>,
    // Set when first item lands in empty buffer; cleared with the items
    first_item: Option<Instant>,
    max_size: usize,
    max_duration: Duration,
}

impl<I> Batch<I> {
    /// Creates batch given maximum batch size in number of items (`max_size`)
    /// and maximum duration a batch can last (`max_duration`) since first item appended to it.
    ///
    /// Panics if `max_size == 0`.
    pub fn new(max_size: usize, max_duration: Duration) -> Batch<I> {
        assert!(max_size > 0, "Batch::new bad max_size");

        Batch {
            items: Vec::with_capacity(max_size),
            first_item: None,
            max_size,
            max_duration,
        }
    }

    /// Checks if batch has reached one of its limits.
    ///
    /// Returns:
    /// * `PollResult::Ready` - batch has reached one of its limit and is ready to be consumed,
    /// * `PollResult::NotReady(None)` - batch is not ready yet and has no items appended yet,
    /// * `PollResult::NotReady(Some(duration))` - batch is not ready yet but it will be ready
    ///   after duration due to duration limit.
    pub fn poll(&self) -> PollResult {
        debug_assert!(self.items.is_empty() ^ self.first_item.is_some());

        if self.items.len() >= self.max_size {
            return PollResult::Ready;
        }

        if let Some(first_item) = self.first_item {
            let since_start = first_item.elapsed();

            if since_start >= self.max_duration {
                return PollResult::Ready;
            }

            return PollResult::NotReady(Some(self.max_duration - since_start));
        }

        PollResult::NotReady(None)
    }

    /// Appends item to batch.
    ///
    /// Duration limit is counted from the item appended to an empty batch.
    pub fn append(&mut self, item: I) {
        self.first_item.get_or_insert_with(Instant::now);
        self.items.push(item);
    }

    /// Rewrites buffered items in place with `f`.
    ///
    /// Batch keeps its start `Instant` unless `f` leaves no items behind.
    pub fn rewrite(&mut self, f: impl FnOnce(&mut Vec<I>)) {
        f(&mut self.items);

        if self.items.is_empty() {
            self.first_item = None;
        }
    }

    /// Consumes batch by draining items from internal buffer.
    ///
    /// Next appended item will start a new batch.
    pub fn drain(&mut self) -> Drain<'_, I> {
        self.first_item = None;
        self.items.drain(0..)
    }

    /// Starts new batch dropping all buffered items.
    pub fn clear(&mut self) {
        self.first_item = None;
        self.items.clear();
    }

    /// Returns slice from internal item buffer.
    pub fn as_slice(&self) -> &[I] {
        self.items.as_slice()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }
}
