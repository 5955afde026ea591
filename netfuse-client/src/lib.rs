//! FUSE client: translates kernel filesystem calls into protocol requests
//! against a netfuse server.

mod attr_cache;
mod engine;
mod error;
mod filesystem;
mod socket_pool;

pub use attr_cache::AttrCache;
pub use engine::{Engine, InterruptFlags};
pub use error::EngineError;
pub use filesystem::NetfuseClient;
pub use socket_pool::{SocketPool, SocketPoolConfig};
