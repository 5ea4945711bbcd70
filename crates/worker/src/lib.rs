//! Worker process assembly: backends, handlers, built-in jobs, driver.

pub mod app;

pub use app::{Backends, RunningWorker, WorkerApp};
