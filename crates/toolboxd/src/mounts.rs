//! Unmounting of environment filesystems and recovery of stale mounts

use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./mounts_test.rs"]
mod mounts_test;

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Lazily unmount a FUSE mount at the given path.
///
/// The unmount is quiet and non-blocking; open handles keep their files
/// alive until released while the mount point itself is detached.
pub async fn unmount<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let status = tokio::process::Command::new("fusermount")
        .args(["-u", "-q", "-z"])
        .arg(path)
        .status()
        .await
        .map_err(|err| Error::process_spawn_error("fusermount", err))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailed {
            command: format!("fusermount -u -q -z {}", path.display()),
            status: status.code().unwrap_or(-1),
        })
    }
}

/// Unmount anything still mounted directly under the given directory.
///
/// After an unclean daemon shutdown the per-container filesystem children
/// leave their mounts behind; this sweep at startup is what recovers them.
/// Errors never abort the sweep.
pub async fn sweep_stale<P: AsRef<Path>>(envroot: P) {
    let envroot = envroot.as_ref();
    let envroot_stat = match nix::sys::stat::stat(envroot) {
        Ok(stat) => stat,
        Err(err) => {
            tracing::warn!(?err, "cannot stat {}, skipping mount sweep", envroot.display());
            return;
        }
    };

    let table = match std::fs::read_to_string(MOUNT_TABLE) {
        Ok(table) => table,
        Err(err) => {
            tracing::warn!(?err, "cannot read {MOUNT_TABLE}, skipping mount sweep");
            return;
        }
    };

    for mount_path in mount_points(&table) {
        let parent = match mount_path.parent() {
            Some(parent) => parent,
            None => continue,
        };
        let parent_stat = match nix::sys::stat::stat(parent) {
            Ok(stat) => stat,
            Err(_) => continue,
        };
        if parent_stat.st_ino == envroot_stat.st_ino && parent_stat.st_dev == envroot_stat.st_dev
        {
            tracing::info!("Found old mount at {}, unmounting", mount_path.display());
            if let Err(err) = unmount(&mount_path).await {
                tracing::warn!("Failed to unmount {}: {err}", mount_path.display());
            }
        }
    }
}

/// Extract the mount points from the contents of `/proc/self/mounts`
fn mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_path(field)))
        .collect()
}

/// Decode the octal escapes (`\040` and friends) used in the mount table
fn unescape_mount_path(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}
