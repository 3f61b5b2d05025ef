pub mod collector;
pub mod config;
pub mod db;
pub mod logger;
pub mod maintenance;
pub mod queue;
pub mod state;
pub mod supervisor;
pub mod writer;

pub const PROGRAM_NAME: &str = "pg_statsinfod";
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use config::{Config, ConfigHandle, Messages};
pub use queue::{QueueItem, QueueKind, WriterQueue};
pub use state::{Shared, ShutdownState};
