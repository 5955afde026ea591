//! Typed helpers around the prost-generated [`Request`]/[`Response`] for
//! framing and for the opcode field-requirement matrix from the protocol
//! design: requests missing a field their opcode requires are rejected with
//! `INVALID_REQUEST` before a server ever touches the filesystem.

use crate::netfuse::{Opcode, PortableErrno, Request, Response, Version};
use crate::ProtoError;
use prost::Message;

/// The protocol version this crate speaks. Bumped in lockstep with
/// incompatible wire changes; the client engine should refuse to talk to a
/// server advertising a different major version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Builds a bare request for `opcode`, stamped with [`PROTOCOL_VERSION`] and
/// every optional field left absent. Callers fill in what their opcode
/// requires.
pub fn new_request(opcode: Opcode) -> Request {
    Request {
        version: Some(PROTOCOL_VERSION),
        opcode: opcode as i32,
        path: None,
        path_to: None,
        size: None,
        offset: None,
        permissions: None,
        openflags: None,
        timestamps: None,
        filetype: None,
        datablock: None,
    }
}

/// Builds a bare, successful response for `opcode`.
pub fn new_response(opcode: Opcode) -> Response {
    Response {
        version: Some(PROTOCOL_VERSION),
        opcode: opcode as i32,
        errno: PortableErrno::None as i32,
        attrs: None,
        directory_entries: Vec::new(),
        link_target: None,
        size: None,
        datablock: None,
        statfs: None,
    }
}

/// Encodes a request into one length-delimited transport frame.
pub fn encode_request(request: &Request) -> Vec<u8> {
    request.encode_to_vec()
}

/// Decodes a request frame off the transport, reporting malformed bytes as
/// a distinct error rather than panicking.
pub fn decode_request(frame: &[u8]) -> Result<Request, ProtoError> {
    Request::decode(frame).map_err(|_| ProtoError::Unserializable)
}

/// Encodes a response into one length-delimited transport frame.
pub fn encode_response(response: &Response) -> Vec<u8> {
    response.encode_to_vec()
}

/// Decodes a response frame off the transport.
pub fn decode_response(frame: &[u8]) -> Result<Response, ProtoError> {
    Response::decode(frame).map_err(|_| ProtoError::Unserializable)
}

/// Validates that `request` carries every field its opcode requires,
/// per the field-requirement matrix. Returns `Ok(())` when the request is
/// well-formed, or `Err(INVALID_REQUEST)` naming the first missing field.
pub fn validate_required_fields(request: &Request) -> Result<(), ProtoError> {
    let opcode = Opcode::try_from(request.opcode).unwrap_or(Opcode::Unknown);

    let need_path = !matches!(opcode, Opcode::Ping);
    if need_path && request.path.is_none() {
        return Err(ProtoError::InvalidRequest("path"));
    }

    let need_path_to = matches!(opcode, Opcode::Rename | Opcode::Link | Opcode::Symlink);
    if need_path_to && request.path_to.is_none() {
        return Err(ProtoError::InvalidRequest("path_to"));
    }

    let need_size = matches!(opcode, Opcode::Read | Opcode::Write);
    if need_size && request.size.is_none() {
        return Err(ProtoError::InvalidRequest("size"));
    }

    let need_offset = matches!(opcode, Opcode::Read | Opcode::Write | Opcode::Truncate);
    if need_offset && request.offset.is_none() {
        return Err(ProtoError::InvalidRequest("offset"));
    }

    let need_permissions = matches!(
        opcode,
        Opcode::Mkdir | Opcode::Access | Opcode::Create | Opcode::Chmod | Opcode::Mknod
    );
    if need_permissions && request.permissions.is_none() {
        return Err(ProtoError::InvalidRequest("permissions"));
    }

    let need_openflags = matches!(opcode, Opcode::Open);
    if need_openflags && request.openflags.is_none() {
        return Err(ProtoError::InvalidRequest("openflags"));
    }

    let need_timestamps = matches!(opcode, Opcode::Utimens);
    if need_timestamps && request.timestamps.is_none() {
        return Err(ProtoError::InvalidRequest("timestamps"));
    }

    let need_data = matches!(opcode, Opcode::Write);
    if need_data && request.datablock.is_none() {
        return Err(ProtoError::InvalidRequest("datablock"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfuse::{OpenFlags, Permissions};

    #[test]
    fn ping_needs_nothing() {
        let request = new_request(Opcode::Ping);
        assert!(validate_required_fields(&request).is_ok());
    }

    #[test]
    fn getattr_without_path_is_rejected() {
        let request = new_request(Opcode::Getattr);
        assert!(matches!(validate_required_fields(&request), Err(ProtoError::InvalidRequest("path"))));
    }

    #[test]
    fn getattr_with_path_is_accepted() {
        let mut request = new_request(Opcode::Getattr);
        request.path = Some("foo".to_string());
        assert!(validate_required_fields(&request).is_ok());
    }

    #[test]
    fn write_requires_path_size_offset_and_datablock() {
        let mut request = new_request(Opcode::Write);
        request.path = Some("foo".to_string());
        request.size = Some(4);
        request.offset = Some(0);
        assert!(matches!(validate_required_fields(&request), Err(ProtoError::InvalidRequest("datablock"))));

        request.datablock = Some(crate::datablock::from_bytes(b"data"));
        assert!(validate_required_fields(&request).is_ok());
    }

    #[test]
    fn rename_requires_path_to() {
        let mut request = new_request(Opcode::Rename);
        request.path = Some("foo".to_string());
        assert!(matches!(validate_required_fields(&request), Err(ProtoError::InvalidRequest("path_to"))));
        request.path_to = Some("bar".to_string());
        assert!(validate_required_fields(&request).is_ok());
    }

    #[test]
    fn open_requires_openflags() {
        let mut request = new_request(Opcode::Open);
        request.path = Some("foo".to_string());
        assert!(matches!(validate_required_fields(&request), Err(ProtoError::InvalidRequest("openflags"))));
        request.openflags = Some(OpenFlags::default());
        assert!(validate_required_fields(&request).is_ok());
    }

    #[test]
    fn mkdir_requires_permissions() {
        let mut request = new_request(Opcode::Mkdir);
        request.path = Some("foo".to_string());
        assert!(matches!(validate_required_fields(&request), Err(ProtoError::InvalidRequest("permissions"))));
        request.permissions = Some(Permissions::default());
        assert!(validate_required_fields(&request).is_ok());
    }

    #[test]
    fn request_frame_round_trips() {
        let mut request = new_request(Opcode::Getattr);
        request.path = Some("some/file".to_string());
        let frame = encode_request(&request);
        let decoded = decode_request(&frame).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn malformed_frame_is_unserializable() {
        let garbage = vec![0xFFu8; 3];
        assert!(matches!(decode_request(&garbage), Err(ProtoError::Unserializable)));
    }
}
