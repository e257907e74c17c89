//! A read-only view of a container's root filesystem with executables
//! rewritten, when inspected through the `exe` subdirectory, into a
//! trampoline that re-enters the container.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod env;
mod error;
mod fuse;
mod inode;

pub use env::{enter_user_namespace, open_container_root};
pub use error::{Error, Result};
pub use fuse::Session;
pub use inode::{InodeTable, ROOT_ID};
