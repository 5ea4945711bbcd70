//! Reliable queue: persistent items, exclusive claims, bounded retries with
//! exponential backoff, dead-lettering.

pub mod in_memory;
pub mod postgres;
pub mod processor;
pub mod prune;
pub mod registry;
pub mod store;

pub use in_memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;
pub use processor::{
    NO_HANDLER, ProcessorConfig, ProcessorStats, QueueProcessor, QueueProcessorJob, StepOutcome,
};
pub use prune::QueuePruneJob;
pub use registry::{HandlerError, HandlerRegistry, ItemHandler};
pub use store::{QueueStats, QueueStore, QueueStoreError};
