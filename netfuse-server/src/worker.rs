//! Per-opcode request handlers: C8.
//!
//! Grounded in `original_source/src/server/servedir.c`'s `ServeDir_op_*`
//! family — one handler per opcode, each performing a single (or small
//! bounded group of) privileged syscall against a path resolved under the
//! served root, filling the response on success and translating `errno` on
//! failure. `MKNOD`, `SYMLINK`, `READLINK` and `STATFS` have no counterpart
//! in the original (a stub `rhizofs.c` never got that far); they're
//! authored directly from spec.md's field matrix and this crate's own
//! `Open Question resolutions` (see `SPEC_FULL.md`).

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use netfuse_proto::mapping;
use netfuse_proto::netfuse::{Attrs, Opcode, PortableErrno, Request, Response, StatFs, TimeSet};
use netfuse_proto::{datablock, message, path as wire_path};

use crate::posix_ext;

/// Permissions ORed onto every newly created regular file, matching the
/// original's `default_file_creation_permissions`/`CREATE`'s forced
/// owner-write bit — the server re-opens the file for later writes.
const OWNER_WRITE: libc::mode_t = libc::S_IWUSR;

pub struct Worker {
    root: PathBuf,
}

impl Worker {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Decodes one request frame, dispatches it, and returns the encoded
    /// response frame. Never fails: a malformed frame or an opcode the
    /// dispatcher rejects both become a well-formed error response.
    pub fn handle_frame(&self, frame: &[u8]) -> Vec<u8> {
        let response = match message::decode_request(frame) {
            Ok(request) => self.handle(request),
            Err(_) => {
                let mut response = message::new_response(Opcode::Unknown);
                response.errno = PortableErrno::Unserializable as i32;
                response
            }
        };
        message::encode_response(&response)
    }

    fn handle(&self, request: Request) -> Response {
        let opcode = Opcode::try_from(request.opcode).unwrap_or(Opcode::Unknown);
        let mut response = message::new_response(opcode);

        if opcode == Opcode::Ping {
            return response;
        }

        if let Err(e) = message::validate_required_fields(&request) {
            log::warn!("rejecting malformed request: {e}");
            response.errno = PortableErrno::InvalidRequest as i32;
            return response;
        }

        let Some(path) = request.path.as_deref().and_then(|p| wire_path::join(&self.root, p)) else {
            response.errno = PortableErrno::InvalidRequest as i32;
            return response;
        };

        let result = match opcode {
            Opcode::Readdir => self.op_readdir(&path, &mut response),
            Opcode::Rmdir => Self::op_rmdir(&path),
            Opcode::Unlink => Self::op_unlink(&path),
            Opcode::Access => Self::op_access(&path, &request),
            Opcode::Rename => self.op_rename(&path, &request),
            Opcode::Link => self.op_link(&path, &request),
            Opcode::Mkdir => Self::op_mkdir(&path, &request),
            Opcode::Mknod => Self::op_mknod(&path, &request),
            Opcode::Getattr => Self::op_getattr(&path, &mut response),
            Opcode::Open => Self::op_open(&path, &request),
            Opcode::Read => Self::op_read(&path, &request, &mut response),
            Opcode::Write => Self::op_write(&path, &request, &mut response),
            Opcode::Create => Self::op_create(&path, &request),
            Opcode::Truncate => Self::op_truncate(&path, &request),
            Opcode::Chmod => Self::op_chmod(&path, &request),
            Opcode::Utimens => Self::op_utimens(&path, &request),
            Opcode::Symlink => self.op_symlink(&path, &request),
            Opcode::Readlink => Self::op_readlink(&path, &mut response),
            Opcode::Statfs => Self::op_statfs(&path, &mut response),
            Opcode::Ping | Opcode::Invalid | Opcode::Unknown => {
                response.errno = PortableErrno::InvalidRequest as i32;
                return response;
            }
        };

        if let Err(errno) = result {
            response.errno = mapping::errno_from_local(errno) as i32;
        }
        response
    }

    /// `std::fs::read_dir` never yields `.`/`..` the way `readdir(3)` does,
    /// so both are synthesized here: `.` stat'd from `path` itself, `..`
    /// from its parent (falling back to `path` at the served root, which
    /// has no parent within the tree).
    fn op_readdir(&self, path: &Path, response: &mut Response) -> Result<(), libc::c_int> {
        let dot_meta = std::fs::metadata(path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        response.directory_entries.push(attrs_from_metadata(&dot_meta, Some(".".to_string())));

        let dotdot_meta = std::fs::metadata(path.join("..")).unwrap_or_else(|_| dot_meta.clone());
        response.directory_entries.push(attrs_from_metadata(&dotdot_meta, Some("..".to_string())));

        let entries = std::fs::read_dir(path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata() {
                Ok(meta) => response.directory_entries.push(attrs_from_metadata(&meta, Some(name))),
                Err(e) => {
                    log::warn!("could not stat directory entry {name}: {e}");
                }
            }
        }
        Ok(())
    }

    fn op_rmdir(path: &Path) -> Result<(), libc::c_int> {
        std::fs::remove_dir(path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    fn op_unlink(path: &Path) -> Result<(), libc::c_int> {
        std::fs::remove_file(path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    fn op_access(path: &Path, request: &Request) -> Result<(), libc::c_int> {
        let permissions = request.permissions.as_ref().expect("validated");
        let mode = mapping::permissions_to_mode(permissions);
        let cpath = cstring_path(path)?;
        let rc = unsafe { libc::access(cpath.as_ptr(), mode as libc::c_int) };
        if rc == -1 {
            Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            Ok(())
        }
    }

    fn op_rename(&self, from: &Path, request: &Request) -> Result<(), libc::c_int> {
        let to = request
            .path_to
            .as_deref()
            .and_then(|p| wire_path::join(&self.root, p))
            .ok_or(libc::EINVAL)?;
        std::fs::rename(from, to).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    fn op_link(&self, from: &Path, request: &Request) -> Result<(), libc::c_int> {
        let to = request
            .path_to
            .as_deref()
            .and_then(|p| wire_path::join(&self.root, p))
            .ok_or(libc::EINVAL)?;
        std::fs::hard_link(from, to).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    fn op_symlink(&self, link_path: &Path, request: &Request) -> Result<(), libc::c_int> {
        let target = request.path_to.as_deref().ok_or(libc::EINVAL)?;
        std::os::unix::fs::symlink(target, link_path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    fn op_readlink(path: &Path, response: &mut Response) -> Result<(), libc::c_int> {
        let target = std::fs::read_link(path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        response.link_target = Some(target.to_string_lossy().into_owned());
        Ok(())
    }

    fn op_mkdir(path: &Path, request: &Request) -> Result<(), libc::c_int> {
        let mode = mapping::permissions_to_mode(request.permissions.as_ref().expect("validated"));
        let cpath = cstring_path(path)?;
        let rc = unsafe { libc::mkdir(cpath.as_ptr(), mode) };
        if rc == -1 {
            Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            Ok(())
        }
    }

    /// Restricted to regular files: any other requested file type is
    /// rejected, per spec.md §4.8.
    fn op_mknod(path: &Path, request: &Request) -> Result<(), libc::c_int> {
        if request.filetype.map(|f| f != netfuse_proto::netfuse::PortableFileType::RegularFile as i32).unwrap_or(false) {
            return Err(libc::EPERM);
        }
        let mode = mapping::permissions_to_mode(request.permissions.as_ref().expect("validated"));
        let cpath = cstring_path(path)?;
        let rc = unsafe { libc::mknod(cpath.as_ptr(), mode | libc::S_IFREG, 0) };
        if rc == -1 {
            Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            Ok(())
        }
    }

    fn op_getattr(path: &Path, response: &mut Response) -> Result<(), libc::c_int> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        response.attrs = Some(attrs_from_metadata(&meta, None));
        Ok(())
    }

    /// Opens and immediately closes: this server never holds a file
    /// descriptor open between requests, so `OPEN` is purely a
    /// reachability/permission check.
    fn op_open(path: &Path, request: &Request) -> Result<(), libc::c_int> {
        let flags = mapping::openflags_to_bitmask(request.openflags.as_ref().expect("validated"));
        let cpath = cstring_path(path)?;
        let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o600) };
        if fd == -1 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        unsafe { libc::close(fd) };
        Ok(())
    }

    fn op_read(path: &Path, request: &Request, response: &mut Response) -> Result<(), libc::c_int> {
        use std::os::unix::fs::FileExt;
        let size = request.size.expect("validated") as usize;
        let offset = request.offset.expect("validated");
        let file = std::fs::File::open(path).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        let mut buf = vec![0u8; size];
        let bytes_read = file.read_at(&mut buf, offset as u64).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        buf.truncate(bytes_read);
        response.datablock = Some(datablock::from_bytes(&buf));
        Ok(())
    }

    fn op_write(path: &Path, request: &Request, response: &mut Response) -> Result<(), libc::c_int> {
        use std::os::unix::fs::FileExt;
        let size = request.size.expect("validated");
        let offset = request.offset.expect("validated");
        let block = request.datablock.as_ref().expect("validated");
        if block.uncompressed_size != size {
            return Err(libc::EINVAL);
        }
        let data = datablock::to_bytes(block).map_err(|_| libc::EINVAL)?;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        file.write_at(&data, offset as u64).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        response.size = Some(data.len() as u64);
        Ok(())
    }

    /// `O_CREAT` mode is OR-ed with owner-write so a later `WRITE` can
    /// re-open the file, per spec.md §4.8.
    fn op_create(path: &Path, request: &Request) -> Result<(), libc::c_int> {
        let mode = mapping::permissions_to_mode(request.permissions.as_ref().expect("validated")) | OWNER_WRITE;
        let cpath = cstring_path(path)?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, mode) };
        if fd == -1 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        unsafe { libc::close(fd) };
        Ok(())
    }

    fn op_truncate(path: &Path, request: &Request) -> Result<(), libc::c_int> {
        let offset = request.offset.expect("validated");
        let cpath = cstring_path(path)?;
        let rc = unsafe { libc::truncate(cpath.as_ptr(), offset) };
        if rc == -1 {
            Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            Ok(())
        }
    }

    fn op_chmod(path: &Path, request: &Request) -> Result<(), libc::c_int> {
        let mode = mapping::permissions_to_mode(request.permissions.as_ref().expect("validated"));
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode as u32))
            .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    fn op_utimens(path: &Path, request: &Request) -> Result<(), libc::c_int> {
        let ts = request.timestamps.as_ref().expect("validated");
        let cpath = cstring_path(path)?;
        let times = [
            libc::timeval { tv_sec: ts.access_sec as libc::time_t, tv_usec: ts.access_usec as libc::suseconds_t },
            libc::timeval {
                tv_sec: ts.modification_sec as libc::time_t,
                tv_usec: ts.modification_usec as libc::suseconds_t,
            },
        ];
        let rc = unsafe { libc::utimes(cpath.as_ptr(), times.as_ptr()) };
        if rc == -1 {
            Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            Ok(())
        }
    }

    fn op_statfs(path: &Path, response: &mut Response) -> Result<(), libc::c_int> {
        let cpath = cstring_path(path)?;
        let mut sv: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut sv) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        response.statfs = Some(StatFs {
            blocks: sv.f_blocks as u64,
            bfree: sv.f_bfree as u64,
            bavail: sv.f_bavail as u64,
            files: sv.f_files as u64,
            ffree: sv.f_ffree as u64,
            bsize: sv.f_bsize as u32,
            namelen: sv.f_namemax as u32,
            frsize: sv.f_frsize as u32,
        });
        Ok(())
    }
}

fn cstring_path(path: &Path) -> Result<CString, libc::c_int> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)
}

fn attrs_from_metadata(meta: &std::fs::Metadata, name: Option<String>) -> Attrs {
    let mode = meta.permissions().mode() as libc::mode_t;
    let filetype = if meta.file_type().is_symlink() {
        netfuse_proto::netfuse::PortableFileType::Symlink
    } else {
        mapping::filetype_from_local(mode)
    };
    Attrs {
        size: meta.size(),
        filetype: filetype as i32,
        permissions: Some(mapping::permissions_from_mode(mode)),
        timestamps: Some(TimeSet {
            access_sec: meta.atime(),
            access_usec: meta.atime_nsec() / 1000,
            modification_sec: meta.mtime(),
            modification_usec: meta.mtime_nsec() / 1000,
            creation_sec: None,
            creation_usec: None,
        }),
        is_owner: posix_ext::is_owner(meta.uid()),
        is_in_group: posix_ext::is_in_group(meta.gid()),
        name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netfuse_proto::message;
    use netfuse_proto::netfuse::{OpenFlags, Permissions};
    use tempfile::TempDir;

    fn worker_with_root() -> (Worker, TempDir) {
        let dir = TempDir::new().unwrap();
        (Worker::new(dir.path().to_path_buf()), dir)
    }

    #[test]
    fn ping_always_succeeds() {
        let (worker, _dir) = worker_with_root();
        let request = message::new_request(Opcode::Ping);
        let response = worker.handle(request);
        assert_eq!(response.errno(), PortableErrno::None);
    }

    #[test]
    fn getattr_on_missing_path_reports_noent() {
        let (worker, _dir) = worker_with_root();
        let mut request = message::new_request(Opcode::Getattr);
        request.path = Some("nope".to_string());
        let response = worker.handle(request);
        assert_eq!(response.errno(), PortableErrno::Noent);
    }

    #[test]
    fn create_then_write_then_read_round_trips() {
        let (worker, dir) = worker_with_root();

        let mut create = message::new_request(Opcode::Create);
        create.path = Some("hello".to_string());
        create.permissions = Some(Permissions::default());
        assert_eq!(worker.handle(create).errno(), PortableErrno::None);
        assert!(dir.path().join("hello").exists());

        let mut write = message::new_request(Opcode::Write);
        write.path = Some("hello".to_string());
        write.size = Some(2);
        write.offset = Some(0);
        write.datablock = Some(datablock::from_bytes(b"hi"));
        let response = worker.handle(write);
        assert_eq!(response.errno(), PortableErrno::None);
        assert_eq!(response.size, Some(2));

        let mut read = message::new_request(Opcode::Read);
        read.path = Some("hello".to_string());
        read.size = Some(4096);
        read.offset = Some(0);
        let response = worker.handle(read);
        assert_eq!(response.errno(), PortableErrno::None);
        let bytes = datablock::to_bytes(response.datablock.as_ref().unwrap()).unwrap();
        assert_eq!(bytes, b"hi");
    }

    #[test]
    fn write_rejects_size_mismatch() {
        let (worker, _dir) = worker_with_root();
        let mut write = message::new_request(Opcode::Write);
        write.path = Some("hello".to_string());
        write.size = Some(999);
        write.offset = Some(0);
        write.datablock = Some(datablock::from_bytes(b"hi"));
        let response = worker.handle(write);
        assert_eq!(response.errno(), PortableErrno::Inval);
    }

    #[test]
    fn mknod_rejects_non_regular_filetype() {
        let (worker, _dir) = worker_with_root();
        let mut request = message::new_request(Opcode::Mknod);
        request.path = Some("dev".to_string());
        request.permissions = Some(Permissions::default());
        request.filetype = Some(netfuse_proto::netfuse::PortableFileType::CharacterDevice as i32);
        let response = worker.handle(request);
        assert_eq!(response.errno(), PortableErrno::Perm);
    }

    #[test]
    fn readdir_lists_entries_with_names() {
        let (worker, dir) = worker_with_root();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();

        let mut request = message::new_request(Opcode::Readdir);
        request.path = Some(String::new());
        let response = worker.handle(request);
        assert_eq!(response.errno(), PortableErrno::None);
        let mut names: Vec<_> = response.directory_entries.iter().map(|a| a.name.clone().unwrap()).collect();
        names.sort();
        assert_eq!(names, vec![".".to_string(), "..".to_string(), "a".to_string(), "b".to_string()]);
    }

    #[test]
    fn path_escaping_the_root_is_rejected() {
        let (worker, _dir) = worker_with_root();
        let mut request = message::new_request(Opcode::Getattr);
        request.path = Some("../../etc/passwd".to_string());
        let response = worker.handle(request);
        assert_eq!(response.errno(), PortableErrno::InvalidRequest);
    }

    #[test]
    fn malformed_frame_yields_unserializable() {
        let (worker, _dir) = worker_with_root();
        let response_frame = worker.handle_frame(&[0xFF, 0xFF, 0xFF]);
        let response = message::decode_response(&response_frame).unwrap();
        assert_eq!(response.errno(), PortableErrno::Unserializable);
    }

    #[test]
    fn open_nonexistent_file_reports_noent() {
        let (worker, _dir) = worker_with_root();
        let mut request = message::new_request(Opcode::Open);
        request.path = Some("nope".to_string());
        request.openflags = Some(OpenFlags { rdonly: true, ..Default::default() });
        let response = worker.handle(request);
        assert_eq!(response.errno(), PortableErrno::Noent);
    }
}
