//! Authorized-keys lookup and the CURVE ZAP (ZeroMQ Authentication
//! Protocol) handler thread.
//!
//! Grounded in spec.md §4.9's authentication note — "the orchestrator runs
//! an extra responder that answers the transport library's authentication
//! protocol by consulting an authorised-keys file" — and in
//! `original_source/src/server/main.c`'s overall "one more thing started
//! alongside the worker pool" shape. The ZAP wire format itself (RFC 27) is
//! the transport library's concern, not this crate's, per spec.md's
//! explicit delegation.

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("could not read authorized-keys file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("invalid z85 key on line {0} of authorized-keys file")]
    InvalidKey(usize),
}

/// The set of client CURVE public keys (raw 32-byte form) allowed to
/// connect.
pub struct AuthorizedKeys {
    keys: HashSet<[u8; 32]>,
}

impl AuthorizedKeys {
    /// Parses one z85-encoded public key per non-empty, non-`#`-comment
    /// line.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path).map_err(|e| AuthError::ReadFile(path.display().to_string(), e))?;
        let mut keys = HashSet::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let decoded = zmq::z85_decode(line).map_err(|_| AuthError::InvalidKey(lineno + 1))?;
            let key: [u8; 32] = decoded.try_into().map_err(|_| AuthError::InvalidKey(lineno + 1))?;
            keys.insert(key);
        }
        Ok(Self { keys })
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        <[u8; 32]>::try_from(key).map(|key| self.keys.contains(&key)).unwrap_or(false)
    }
}

/// Runs the ZAP responder loop on the given context until the context is
/// terminated. Binds `inproc://zeromq.zap.01`, per RFC 27 — libzmq routes
/// every CURVE handshake to whatever is bound there before letting the
/// connection through.
pub fn run_zap_handler(context: &zmq::Context, authorized: AuthorizedKeys) -> Result<(), zmq::Error> {
    let socket = context.socket(zmq::ROUTER)?;
    socket.bind("inproc://zeromq.zap.01")?;

    loop {
        let request = match socket.recv_multipart(0) {
            Ok(parts) => parts,
            Err(zmq::Error::ETERM) => return Ok(()),
            Err(e) => return Err(e),
        };
        if let Some(reply) = handle_zap_request(&request, &authorized) {
            socket.send_multipart(reply, 0)?;
        }
    }
}

/// Builds the ZAP reply frames for one request, or `None` if the request
/// is too malformed to even address a reply to.
fn handle_zap_request(request: &[Vec<u8>], authorized: &AuthorizedKeys) -> Option<Vec<Vec<u8>>> {
    // ROUTER prefixes the peer identity; RFC 27's own frames follow:
    // [version, sequence, domain, address, identity, mechanism, client_key]
    let (routing_id, rest) = request.split_first()?;
    if rest.len() < 6 {
        return None;
    }
    let version = &rest[0];
    let sequence = &rest[1];
    let mechanism = &rest[5];
    let client_key = rest.get(6);

    let (status_code, status_text): (&[u8], &[u8]) = if mechanism != b"CURVE" {
        (b"400", b"only CURVE authentication is supported")
    } else {
        match client_key {
            Some(key) if authorized.contains(key) => (b"200", b"OK"),
            _ => (b"400", b"unrecognized client key"),
        }
    };

    Some(vec![
        routing_id.clone(),
        version.clone(),
        sequence.clone(),
        status_code.to_vec(),
        status_text.to_vec(),
        Vec::new(), // user-id metadata
        Vec::new(), // metadata
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_keys_skipping_blank_lines_and_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let public = zmq::CurveKeyPair::new().unwrap().public_key;
        let encoded = zmq::z85_encode(&public).unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{encoded}").unwrap();
        let authorized = AuthorizedKeys::load(file.path()).unwrap();
        assert!(authorized.contains(&public));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let authorized = AuthorizedKeys { keys: HashSet::new() };
        assert!(!authorized.contains(&[0u8; 32]));
    }

    #[test]
    fn zap_request_with_authorized_curve_key_is_admitted() {
        let public = [7u8; 32];
        let mut keys = HashSet::new();
        keys.insert(public);
        let authorized = AuthorizedKeys { keys };

        let request = vec![
            b"routing-id".to_vec(),
            b"1.0".to_vec(),
            b"seq".to_vec(),
            b"domain".to_vec(),
            b"address".to_vec(),
            b"identity".to_vec(),
            b"CURVE".to_vec(),
            public.to_vec(),
        ];
        let reply = handle_zap_request(&request, &authorized).unwrap();
        assert_eq!(reply[3], b"200");
    }

    #[test]
    fn zap_request_with_unknown_curve_key_is_denied() {
        let authorized = AuthorizedKeys { keys: HashSet::new() };
        let request = vec![
            b"routing-id".to_vec(),
            b"1.0".to_vec(),
            b"seq".to_vec(),
            b"domain".to_vec(),
            b"address".to_vec(),
            b"identity".to_vec(),
            b"CURVE".to_vec(),
            vec![9u8; 32],
        ];
        let reply = handle_zap_request(&request, &authorized).unwrap();
        assert_eq!(reply[3], b"400");
    }
}
