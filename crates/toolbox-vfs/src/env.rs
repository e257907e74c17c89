//! Setup of the filesystem process environment: container root access
//! and user-namespace entry

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::Result;

/// Open the container's root filesystem as a path-only descriptor.
///
/// Every later filesystem operation resolves relative to this descriptor,
/// so path resolution cannot escape the container root. It must be opened
/// before entering the container's user namespace or the open would run
/// under the new credentials.
pub fn open_container_root(pid: u32) -> Result<OwnedFd> {
    let path = format!("/proc/{pid}/root");
    let fd = nix::fcntl::open(path.as_str(), OFlag::O_PATH, Mode::empty())?;
    // Safety: open returned a fresh descriptor that nothing else owns
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Associate this process with the container's user namespace
pub fn enter_user_namespace(pid: u32) -> Result<()> {
    let path = format!("/proc/{pid}/ns/user");
    let file = std::fs::File::open(&path)?;
    nix::sched::setns(file.as_raw_fd(), nix::sched::CloneFlags::empty())?;
    Ok(())
}
