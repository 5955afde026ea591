//! Wire protocol, portable POSIX mappings, and payload compression shared
//! by the netfuse client and server.
//!
//! This crate owns everything that has to agree bit-for-bit between the two
//! sides of the connection: the protobuf message shapes ([`netfuse`]), the
//! total conversions between those shapes and local POSIX values
//! ([`mapping`]), the optionally-compressed payload container
//! ([`datablock`]), framing and field validation ([`message`]), and the
//! server-side path joiner ([`path`]).

pub mod datablock;
pub mod error;
pub mod mapping;
pub mod message;
pub mod path;

pub use error::ProtoError;

/// Generated protobuf types (`Opcode`, `PortableErrno`, `Request`,
/// `Response`, ...), compiled from `proto/netfuse.proto` by `build.rs`.
pub mod netfuse {
    include!(concat!(env!("OUT_DIR"), "/netfuse.rs"));
}
