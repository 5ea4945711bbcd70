//! Runtime state: the persisted key/value store behind kill switches,
//! `next_run_at` slots and tracked sub-job records.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use r#trait::{
    RuntimeState, StateStore, StateStoreError, StateStoreExt, format_time, parse_time,
};
