pub mod api;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod store;

pub use collector::{Collected, Outcome};
pub use config::{CoordinatorConfig, ServerConfig};
pub use coordinator::{Coordinator, JobResult, JobView, Summary, SweepReport};
pub use error::{CoordinatorError, ErrorKind, Result};
