//! The filesystem served to the kernel
//!
//! Every inode is the relative path of a file under the container root,
//! resolved through a path-only descriptor so lookups cannot escape it.
//! Keeping paths rather than open descriptors avoids pinning one file
//! descriptor per dentry the kernel chooses to cache.

use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::prelude::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{
    FileAttr,
    FileType,
    ReplyAttr,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    ReplyXattr,
    Request,
};
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::AccessFlags;

use crate::inode::{InodeData, InodeTable, ROOT_ID};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;

/// How long the kernel may cache entries and attributes
const TIMEOUT: Duration = Duration::from_secs(1);

const WRITE_BITS: libc::mode_t = 0o222;
const EXEC_BITS: libc::mode_t = 0o111;

/// The names synthesized at the mount root
const ROOT_ENTRIES: [&str; 4] = [".", "..", "exe", "raw"];

/// Extract the ok value from a result, or reply with an error
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to the kernel and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err = Error::from($err);
        let errno = err.os_error().unwrap_or(libc::EIO);
        if errno != libc::ENOENT {
            tracing::debug!("{err:?}");
        }
        $reply.error(errno);
        return;
    }};
}

/// An inode as seen by an operation: the mount root is a reserved
/// sentinel, everything else lives in the table
enum Node {
    Root,
    Inode(Arc<InodeData>),
}

/// A temporary descriptor for an inode.
///
/// The view roots reuse the source descriptor itself, which must never be
/// closed here; everything else gets a fresh path-only descriptor that is
/// closed on drop.
enum InodeFd<'a> {
    Source(&'a OwnedFd),
    Opened(OwnedFd),
}

impl InodeFd<'_> {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            InodeFd::Source(fd) => fd.as_raw_fd(),
            InodeFd::Opened(fd) => fd.as_raw_fd(),
        }
    }
}

enum Handle {
    File(std::fs::File),
    /// Directory listing snapshot; the mount root has none and is
    /// synthesized in readdir instead
    Dir(Option<Vec<DirEntry>>),
}

struct DirEntry {
    ino: u64,
    kind: FileType,
    name: OsString,
}

/// Handles inode allocation and serves all kernel requests
pub struct Filesystem {
    source: OwnedFd,
    run_path: PathBuf,
    uid: u32,
    gid: u32,
    inodes: InodeTable,
    handles: DashMap<u64, Handle>,
    next_handle: AtomicU64,
}

impl Filesystem {
    fn new(source: OwnedFd, run_path: PathBuf) -> Self {
        Self {
            source,
            run_path,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            inodes: InodeTable::new(),
            handles: DashMap::new(),
            // handle 0 is never allocated so the explicit lack of a
            // handle stays distinguishable
            next_handle: AtomicU64::new(1),
        }
    }

    fn node(&self, ino: u64) -> Option<Node> {
        if ino == ROOT_ID {
            Some(Node::Root)
        } else {
            self.inodes.get(ino).map(Node::Inode)
        }
    }

    fn source_fd(&self) -> RawFd {
        self.source.as_raw_fd()
    }

    fn allocate_handle(&self, data: Handle) -> u64 {
        loop {
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            match self.handles.entry(id) {
                // continue until we find a vacant entry for this handle
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(data);
                    break id;
                }
            }
        }
    }

    fn inode_fd(&self, node: &InodeData) -> Result<InodeFd<'_>> {
        if node.path().is_empty() {
            return Ok(InodeFd::Source(&self.source));
        }
        let fd = nix::fcntl::openat(
            self.source_fd(),
            node.path(),
            OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        // Safety: openat returned a fresh descriptor that nothing else owns
        Ok(InodeFd::Opened(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Stat a path under the container root, substituting the trampoline
    /// for executables seen through the exe view. Write bits are always
    /// masked off. Returns whether the substitution happened.
    fn stat_path(&self, path: &str, raw: bool) -> Result<(libc::stat, bool)> {
        let mut st = nix::sys::stat::fstatat(
            self.source_fd(),
            path,
            AtFlags::AT_EMPTY_PATH | AtFlags::AT_SYMLINK_NOFOLLOW,
        )?;
        let mut rewritten = false;
        if wants_trampoline(raw, st.st_mode) {
            st = nix::sys::stat::stat(&self.run_path)?;
            rewritten = true;
        }
        st.st_mode &= !WRITE_BITS;
        Ok((st, rewritten))
    }

    fn attr_from_stat(&self, ino: u64, st: &libc::stat) -> FileAttr {
        FileAttr {
            ino,
            size: st.st_size as u64,
            blocks: st.st_blocks as u64,
            atime: timestamp(st.st_atime, st.st_atime_nsec),
            mtime: timestamp(st.st_mtime, st.st_mtime_nsec),
            ctime: timestamp(st.st_ctime, st.st_ctime_nsec),
            crtime: UNIX_EPOCH,
            kind: file_type(st.st_mode),
            perm: (st.st_mode & 0o7777) as u16,
            nlink: st.st_nlink as u32,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u32,
            blksize: st.st_blksize as u32,
            flags: 0,
        }
    }

    fn root_attr(&self) -> FileAttr {
        FileAttr {
            ino: ROOT_ID,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            // number of subdirs + 2
            nlink: 4,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    /// Snapshot a directory under the container root for readdir
    fn read_dir_entries(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = if path.is_empty() { "." } else { path };
        let fd = nix::fcntl::openat(
            self.source_fd(),
            path,
            OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let mut dir = nix::dir::Dir::from_fd(fd)?;
        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry?;
            // only the entry type is known here; the kernel stats the
            // inode itself when it wants more
            let kind = entry
                .file_type()
                .map(dir_entry_type)
                .unwrap_or(FileType::RegularFile);
            entries.push(DirEntry {
                ino: entry.ino(),
                kind,
                name: OsStr::from_bytes(entry.file_name().to_bytes()).to_owned(),
            });
        }
        Ok(entries)
    }
}

// these functions mirror the fuse callbacks and so we don't have much
// control over their shape
#[allow(clippy::too_many_arguments)]
impl Filesystem {
    async fn lookup(&self, parent: u64, name: OsString, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.node(parent) {
            None => reply.error(libc::ENOENT),
            Some(Node::Root) => self.lookup_root(name, reply),
            Some(Node::Inode(parent)) => self.lookup_other(&parent, name, reply),
        }
    }

    fn lookup_root(&self, name: &str, reply: ReplyEntry) {
        let raw = match name {
            "raw" => true,
            "exe" => false,
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let (st, _) = unwrap!(reply, self.stat_path("", raw));
        let (ino, _) = self.inodes.intern(String::new(), raw);
        let attr = self.attr_from_stat(ino, &st);
        reply.entry(&TIMEOUT, &attr, 1);
    }

    fn lookup_other(&self, parent: &InodeData, name: &str, reply: ReplyEntry) {
        let path = compose_path(parent.path(), name);
        let (st, rewritten) = unwrap!(reply, self.stat_path(&path, parent.is_raw()));
        let path = if rewritten {
            self.run_path.to_string_lossy().into_owned()
        } else {
            path
        };
        let (ino, _) = self.inodes.intern(path, parent.is_raw());
        let attr = self.attr_from_stat(ino, &st);
        reply.entry(&TIMEOUT, &attr, 0);
    }

    fn forget(&self, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    async fn getattr(&self, ino: u64, reply: ReplyAttr) {
        match self.node(ino) {
            None => reply.error(libc::ENOENT),
            Some(Node::Root) => reply.attr(&TIMEOUT, &self.root_attr()),
            Some(Node::Inode(node)) => {
                let (st, _) = unwrap!(reply, self.stat_path(node.path(), node.is_raw()));
                reply.attr(&TIMEOUT, &self.attr_from_stat(ino, &st));
            }
        }
    }

    async fn readlink(&self, ino: u64, reply: ReplyData) {
        match self.node(ino) {
            None => reply.error(libc::ENOENT),
            Some(Node::Root) => reply.error(libc::EINVAL),
            Some(Node::Inode(node)) => {
                let target =
                    unwrap!(reply, nix::fcntl::readlinkat(self.source_fd(), node.path()));
                reply.data(target.as_bytes());
            }
        }
    }

    async fn open(&self, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
            reply.error(libc::EACCES);
            return;
        }
        match self.node(ino) {
            None => reply.error(libc::ENOENT),
            Some(Node::Root) => reply.error(libc::EISDIR),
            Some(Node::Inode(node)) => {
                let oflags = OFlag::from_bits_truncate(flags);
                let fd = if node.path().is_empty() {
                    // reopen the path-only source descriptor as a real one
                    let path = format!("/proc/self/fd/{}", self.source_fd());
                    nix::fcntl::open(path.as_str(), oflags, Mode::empty())
                } else {
                    nix::fcntl::openat(self.source_fd(), node.path(), oflags, Mode::empty())
                };
                let fd = unwrap!(reply, fd);
                // Safety: the descriptor was just opened and nothing else owns it
                let file = std::fs::File::from(unsafe { OwnedFd::from_raw_fd(fd) });
                let fh = self.allocate_handle(Handle::File(file));
                reply.opened(fh, 0);
            }
        }
    }

    async fn read(
        &self,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.value() {
            Handle::Dir(_) => reply.error(libc::EISDIR),
            Handle::File(file) => {
                let mut buf = vec![0; size as usize];
                let mut consumed = 0;
                while consumed < size as usize {
                    let count = unwrap!(
                        reply,
                        file.read_at(&mut buf[consumed..], offset as u64 + consumed as u64)
                    );
                    if count == 0 {
                        // the end of the file has been reached
                        break;
                    }
                    consumed += count;
                }
                reply.data(&buf[..consumed]);
            }
        }
    }

    async fn release(
        &self,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // closing a file that was only open for reading is not expected
        // to produce errors, and they have nowhere useful to go
        if self.handles.remove(&fh).is_none() {
            reply.error(libc::EBADF);
            return;
        }
        reply.ok();
    }

    async fn opendir(&self, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.node(ino) {
            None => reply.error(libc::ENOENT),
            Some(Node::Root) => {
                let fh = self.allocate_handle(Handle::Dir(None));
                reply.opened(fh, 0);
            }
            Some(Node::Inode(node)) => {
                let entries = unwrap!(reply, self.read_dir_entries(node.path()));
                let fh = self.allocate_handle(Handle::Dir(Some(entries)));
                reply.opened(fh, 0);
            }
        }
    }

    async fn readdir(&self, _ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.value() {
            Handle::File(_) => reply.error(libc::ENOTDIR),
            Handle::Dir(None) => {
                for (i, name) in ROOT_ENTRIES.iter().enumerate().skip(offset as usize) {
                    // the synthesized inode number is the offset plus one
                    if reply.add((i + 1) as u64, (i + 1) as i64, FileType::Directory, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Handle::Dir(Some(entries)) => {
                for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
                    if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
        }
    }

    async fn releasedir(&self, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        if self.handles.remove(&fh).is_none() {
            reply.error(libc::EBADF);
            return;
        }
        reply.ok();
    }

    async fn getxattr(&self, ino: u64, name: OsString, size: u32, reply: ReplyXattr) {
        match self.node(ino) {
            None => reply.error(libc::ENOENT),
            Some(Node::Root) => reply.error(libc::ENODATA),
            Some(Node::Inode(node)) => {
                let fd = unwrap!(reply, self.inode_fd(&node));
                let path = proc_fd_path(fd.as_raw_fd());
                let Ok(name) = CString::new(name.as_bytes()) else {
                    reply.error(libc::EINVAL);
                    return;
                };
                if size == 0 {
                    let len = unsafe {
                        libc::getxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
                    };
                    if len < 0 {
                        reply.error(last_errno());
                    } else {
                        reply.size(len as u32);
                    }
                } else {
                    let mut value = vec![0u8; size as usize];
                    let len = unsafe {
                        libc::getxattr(
                            path.as_ptr(),
                            name.as_ptr(),
                            value.as_mut_ptr().cast(),
                            value.len(),
                        )
                    };
                    if len < 0 {
                        reply.error(last_errno());
                    } else {
                        reply.data(&value[..len as usize]);
                    }
                }
            }
        }
    }

    async fn listxattr(&self, ino: u64, size: u32, reply: ReplyXattr) {
        match self.node(ino) {
            None => reply.error(libc::ENOENT),
            Some(Node::Root) => {
                if size == 0 {
                    reply.size(0);
                } else {
                    reply.data(&[]);
                }
            }
            Some(Node::Inode(node)) => {
                let fd = unwrap!(reply, self.inode_fd(&node));
                let path = proc_fd_path(fd.as_raw_fd());
                if size == 0 {
                    let len = unsafe { libc::listxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
                    if len < 0 {
                        reply.error(last_errno());
                    } else {
                        reply.size(len as u32);
                    }
                } else {
                    let mut list = vec![0u8; size as usize];
                    let len = unsafe {
                        libc::listxattr(path.as_ptr(), list.as_mut_ptr().cast(), list.len())
                    };
                    if len < 0 {
                        reply.error(last_errno());
                    } else {
                        reply.data(&list[..len as usize]);
                    }
                }
            }
        }
    }

    async fn access(&self, ino: u64, mask: i32, reply: ReplyEmpty) {
        if mask & libc::W_OK != 0 {
            reply.error(libc::EACCES);
            return;
        }
        match self.node(ino) {
            None => reply.error(libc::ENOENT),
            Some(Node::Root) => reply.ok(),
            Some(Node::Inode(node)) => {
                let fd = unwrap!(reply, self.inode_fd(&node));
                let path = PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()));
                match nix::unistd::access(&path, AccessFlags::from_bits_truncate(mask)) {
                    Ok(()) => reply.ok(),
                    Err(err) => reply.error(err as i32),
                }
            }
        }
    }
}

fn compose_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

/// Executables seen through the exe view are presented as the trampoline
fn wants_trampoline(raw: bool, mode: libc::mode_t) -> bool {
    !raw && (mode & libc::S_IFMT) == libc::S_IFREG && (mode & EXEC_BITS) != 0
}

fn file_type(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn dir_entry_type(kind: nix::dir::Type) -> FileType {
    match kind {
        nix::dir::Type::Directory => FileType::Directory,
        nix::dir::Type::Symlink => FileType::Symlink,
        nix::dir::Type::CharacterDevice => FileType::CharDevice,
        nix::dir::Type::BlockDevice => FileType::BlockDevice,
        nix::dir::Type::Fifo => FileType::NamedPipe,
        nix::dir::Type::Socket => FileType::Socket,
        nix::dir::Type::File => FileType::RegularFile,
    }
}

fn timestamp(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn proc_fd_path(fd: RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}")).expect("proc paths have no interior nul")
}

fn last_errno() -> i32 {
    nix::errno::Errno::last() as i32
}

/// A connected FUSE session.
///
/// Implements the [`fuser::Filesystem`] trait, receiving every request
/// and arranging for its execution on the async runtime so the dispatch
/// loop never serializes operations.
pub struct Session {
    fs: Arc<Filesystem>,
}

impl Session {
    /// Serve the container behind `source` (a path-only descriptor of its
    /// root), substituting `run_path` for executables in the exe view
    pub fn new(source: OwnedFd, run_path: PathBuf) -> Self {
        Self {
            fs: Arc::new(Filesystem::new(source, run_path)),
        }
    }
}

impl fuser::Filesystem for Session {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.lookup(parent, name, reply).await });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        // no reply is involved and the table never blocks; the default
        // batch forget loops over this
        self.fs.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.getattr(ino, reply).await });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.readlink(ino, reply).await });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.open(ino, flags, reply).await });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move {
            fs.read(ino, fh, offset, size, flags, lock_owner, reply).await
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move {
            fs.release(ino, fh, flags, lock_owner, flush, reply).await
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.opendir(ino, flags, reply).await });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.readdir(ino, fh, offset, reply).await });
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, flags: i32, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.releasedir(ino, fh, flags, reply).await });
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.getxattr(ino, name, size, reply).await });
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.listxattr(ino, size, reply).await });
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.access(ino, mask, reply).await });
    }
}
