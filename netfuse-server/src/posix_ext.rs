//! Small local-identity helpers used when building `Attrs` responses.
//!
//! Grounded in `original_source/src/posix.c`'s `posix_current_user_in_group`
//! and `mapping.c`'s `Attrs_create`: ownership/group membership is judged
//! against the *server process's own* credentials, not anything a client
//! supplies — the wire protocol never carries a uid/gid at all.

/// Whether the server process's effective uid equals `uid`.
pub fn is_owner(uid: u32) -> bool {
    unsafe { libc::geteuid() == uid }
}

/// Whether the server process's effective gid, or any of its supplementary
/// groups, equals `gid`.
pub fn is_in_group(gid: u32) -> bool {
    if unsafe { libc::getegid() } == gid {
        return true;
    }
    let n = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    if n <= 0 {
        return false;
    }
    let mut groups = vec![0u32; n as usize];
    let got = unsafe { libc::getgroups(n, groups.as_mut_ptr()) };
    if got <= 0 {
        return false;
    }
    groups[..got as usize].contains(&gid)
}
