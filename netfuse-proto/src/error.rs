use thiserror::Error;

/// Failures that can occur while building, validating or framing a message,
/// as distinct from the POSIX-flavoured [`crate::netfuse::PortableErrno`]
/// that travels *inside* a successfully decoded response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// A request was missing a field its opcode requires. Carries the
    /// name of the first field found absent.
    #[error("request missing required field `{0}`")]
    InvalidRequest(&'static str),
    /// A frame off the transport could not be decoded as a protobuf
    /// message at all.
    #[error("frame could not be deserialized")]
    Unserializable,
}
