pub mod agent;
pub mod archive;
pub mod backup;
pub mod compose;
pub mod config;
pub mod constants;
pub mod error;
pub mod ledger;
pub mod scheduler;
pub mod storage;
pub mod task;

pub use agent::BackupAgent;
pub use error::{AgentError, Result};
