//! Filesystem metadata helpers.
//!
//! Collects the POSIX fields stored in directory/file headers (mode, uid/gid,
//! owner and group names, timestamps) and restores mode and timestamps on
//! extraction. Owner/group names are resolved through libc and cached per id,
//! since every file of a tree usually shares a handful of owners.
//!
//! On non-Unix targets ids are 0, names are empty and the mode is synthesised
//! from the read-only flag.

use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
#[cfg(not(unix))]
use std::time::UNIX_EPOCH;

use filetime::FileTime;

use crate::format::DirectorySection;

/// Permission bits (including setuid/setgid/sticky) of an entry.
#[cfg(unix)]
pub fn unix_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn unix_mode(meta: &Metadata) -> u32 {
    let base = if meta.is_dir() { 0o755 } else { 0o644 };
    if meta.permissions().readonly() {
        base & !0o222
    } else {
        base
    }
}

#[cfg(unix)]
fn ids(meta: &Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid())
}

#[cfg(not(unix))]
fn ids(_meta: &Metadata) -> (u32, u32) {
    (0, 0)
}

/// (mtime, ctime, atime) as unix seconds; pre-epoch times clamp to 0.
#[cfg(unix)]
fn times(meta: &Metadata) -> (u64, u64, u64) {
    use std::os::unix::fs::MetadataExt;
    let clamp = |t: i64| t.max(0) as u64;
    (clamp(meta.mtime()), clamp(meta.ctime()), clamp(meta.atime()))
}

#[cfg(not(unix))]
fn times(meta: &Metadata) -> (u64, u64, u64) {
    let secs = |t: io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    };
    (secs(meta.modified()), secs(meta.created()), secs(meta.accessed()))
}

static USER_NAMES: OnceLock<Mutex<HashMap<u32, String>>> = OnceLock::new();
static GROUP_NAMES: OnceLock<Mutex<HashMap<u32, String>>> = OnceLock::new();

fn cached(table: &OnceLock<Mutex<HashMap<u32, String>>>, id: u32, lookup: fn(u32) -> Option<String>) -> String {
    let table = table.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(names) = table.lock() {
        if let Some(name) = names.get(&id) {
            return name.clone();
        }
    }
    let name = lookup(id).unwrap_or_default();
    if let Ok(mut names) = table.lock() {
        names.insert(id, name.clone());
    }
    name
}

/// User name for `uid`, empty when unknown.
pub fn user_name(uid: u32) -> String {
    cached(&USER_NAMES, uid, lookup_user)
}

/// Group name for `gid`, empty when unknown.
pub fn group_name(gid: u32) -> String {
    cached(&GROUP_NAMES, gid, lookup_group)
}

#[cfg(unix)]
fn lookup_user(uid: u32) -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 1024];
    loop {
        // SAFETY: all pointers reference live, correctly sized locals; the name
        // pointer in `pwd` points into `buf`, which outlives the CStr borrow.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(uid as libc::uid_t, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf.len() < (1 << 20) {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
            return None;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}

#[cfg(unix)]
fn lookup_group(gid: u32) -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 1024];
    loop {
        // SAFETY: see lookup_user.
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrgid_r(gid as libc::gid_t, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf.len() < (1 << 20) {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() || grp.gr_name.is_null() {
            return None;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(grp.gr_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}

#[cfg(not(unix))]
fn lookup_user(_uid: u32) -> Option<String> {
    None
}

#[cfg(not(unix))]
fn lookup_group(_gid: u32) -> Option<String> {
    None
}

/// Builds the header record for an entry stored under `path`.
pub fn describe(path: String, meta: &Metadata) -> DirectorySection {
    let (uid, gid) = ids(meta);
    let (mtime, ctime, atime) = times(meta);
    DirectorySection {
        path,
        uid,
        gid,
        owner: user_name(uid),
        group: group_name(gid),
        mtime,
        ctime,
        atime,
        mode: unix_mode(meta) as u64,
    }
}

#[cfg(unix)]
/// Set POSIX permission bits on Unix.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
/// Only the write bit survives off Unix.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    std::fs::set_permissions(path, perms)
}

/// Applies the stored mode and access/modification times to an extracted entry.
pub fn restore(path: &Path, section: &DirectorySection) -> io::Result<()> {
    let atime = FileTime::from_unix_time(section.atime as i64, 0);
    let mtime = FileTime::from_unix_time(section.mtime as i64, 0);
    filetime::set_file_times(path, atime, mtime)?;
    set_unix_permissions(path, (section.mode & 0o7777) as u32)
}

/// Creates a symbolic link at `link` pointing to `target`.
#[cfg(unix)]
pub fn symlink(target: &str, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
pub fn symlink(_target: &str, link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("symbolic links are not supported here: {}", link.display()),
    ))
}

/// Seconds since the epoch, used for the archive header timestamp.
pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn describe_captures_mode_and_times() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::File::create(&path).unwrap().write_all(b"hi").unwrap();
        set_unix_permissions(&path, 0o640).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        let section = describe("x.txt".into(), &meta);
        assert_eq!(section.path, "x.txt");
        #[cfg(unix)]
        assert_eq!(section.mode, 0o640);
        assert!(section.mtime > 0);
    }

    #[test]
    fn restore_applies_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("y");
        std::fs::write(&path, b"y").unwrap();
        let section = DirectorySection {
            path: "y".into(),
            mtime: 1_000_000_000,
            atime: 1_000_000_000,
            mode: 0o600,
            ..Default::default()
        };
        restore(&path, &section).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_000_000_000);
    }
}
