/*!
In-process queue that collects items pushed by producers into batches and hands each complete
batch to a consumer callback.

A batch is complete when it reaches the maximum size or when the timeout has elapsed since its first
item was pushed, whichever comes first. Batches can also be flushed on demand and the last
partial batch is always flushed on close.

See `BatchQueue` for details.
!*/
pub mod batch;
pub mod dedupe;
pub mod error;
pub mod queue;
mod worker;

pub use error::{BuildError, CloseError, ClosedError};
pub use queue::{BatchQueue, Builder};
pub use worker::Consumer;
