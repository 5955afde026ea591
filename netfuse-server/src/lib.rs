//! Server half of netfuse: the request dispatcher (C8) and the process
//! orchestrator that runs a pool of dispatchers behind a fan-out queue
//! device (C9).

pub mod auth;
pub mod logging;
pub mod orchestrator;
mod posix_ext;
pub mod worker;

pub use auth::AuthorizedKeys;
pub use orchestrator::{OrchestratorConfig, OrchestratorError, DEFAULT_NUM_WORKERS, MAX_NUM_WORKERS};
pub use worker::Worker;
