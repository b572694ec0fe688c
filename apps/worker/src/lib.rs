//! romvault background tasks
//!
//! Job queue, worker pool, cron scheduler and the built-in library tasks
//! shared by the `romvault-worker` and `romvault-scheduler` binaries.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tasks;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use context::AppContext;
pub use error::{WorkerError, WorkerResult};
pub use service::TaskService;
