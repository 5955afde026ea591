use thiserror::Error;

/// Failures internal to the client engine and its socket pool. Never
/// crosses the `fuser::Filesystem` boundary directly — every public
/// operation translates one of these (or a decoded `PortableErrno`) into a
/// raw POSIX errno before returning, per the engine's propagation policy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
    #[error("request abandoned: kernel adapter signalled interruption")]
    Interrupted,
    #[error("request timed out")]
    TimedOut,
    #[error("response could not be decoded")]
    Undecodable,
}

impl EngineError {
    /// Maps an engine failure to the local errno the kernel adapter
    /// should see, per spec §7's error taxonomy.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            EngineError::Transport(_) | EngineError::Undecodable => libc::EIO,
            EngineError::Interrupted => libc::EINTR,
            EngineError::TimedOut => libc::EAGAIN,
        }
    }

    /// Whether this failure should cause the calling socket to be
    /// renewed before the next request (the "Lazy Pirate" rule: any
    /// ambiguous send/receive outcome discards the endpoint).
    pub fn is_transport_ambiguous(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Undecodable | EngineError::TimedOut)
    }
}
