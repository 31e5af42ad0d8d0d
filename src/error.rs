use std::error::Error;
use std::fmt;
use std::io;

/// The error returned by `Builder::build` when the queue can not be started.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("batch timeout must be greater than zero")]
    ZeroTimeout,
    #[error("failed to spawn queue worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// The error returned by `BatchQueue::push` when close of the queue has begun or the worker is
/// gone.
///
/// Contains the item that could not be pushed.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct ClosedError<I>(pub I);

impl<I> ClosedError<I> {
    /// Returns the item that could not be pushed.
    pub fn into_inner(self) -> I {
        self.0
    }
}

impl<I> fmt::Debug for ClosedError<I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClosedError { .. }")
    }
}

impl<I> fmt::Display for ClosedError<I> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "push item to a closed queue")
    }
}

impl<I> Error for ClosedError<I> {}

/// The error returned by `BatchQueue::close`.
#[derive(PartialEq, Eq, Clone, Copy, Debug, thiserror::Error)]
pub enum CloseError {
    /// Close was already called on this queue.
    #[error("queue is already closed")]
    AlreadyClosed,
    /// Queue was drained but consumer panicked while processing some of the batches.
    #[error("consumer panicked on {batches} batch(es)")]
    ConsumerPanicked { batches: usize },
    /// Worker thread died before draining the queue; outstanding items are lost.
    #[error("queue worker thread panicked")]
    WorkerPanicked,
}
