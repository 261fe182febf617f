mod app;
mod cli;
mod utils;

pub use app::AgentApp;
pub use cli::Cli;
pub use utils::{LOG_FILE_ENV, setup_logging};
