//! sift-embed — embedding plumbing for the sift workspace.
//!
//! The centerpiece is [`EmbeddingBatcher`]: a priority-queued, time- and
//! size-triggered batching layer over any [`sift_core::EmbeddingService`],
//! with bounded parallelism, retry/backoff, per-request oneshot delivery,
//! cancellation, and running stats. Alongside it:
//! - [`EmbeddingCache`]: bounded LRU of text fingerprints to vectors.
//! - [`CancellationToken`]: watch-channel cancellation observed between
//!   indexing stages.
//! - [`EmbedError`]: clonable error kind so one terminal failure can reject
//!   an entire batch.

pub mod batcher;
pub mod cache;
pub mod cancel_token;
pub mod error;

pub use batcher::{BatcherConfig, BatcherStats, EmbeddingBatcher};
pub use cache::EmbeddingCache;
pub use cancel_token::{CancellationHandle, CancellationToken};
pub use error::EmbedError;
