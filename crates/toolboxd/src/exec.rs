//! Discovery of the helper binaries that ship alongside the daemon

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[cfg(test)]
#[path = "./exec_test.rs"]
mod exec_test;

/// The filesystem helper spawned once per running container
pub const ENVFS_HELPER: &str = "toolbox-envfs";
/// The trampoline substituted for executables in the exe view
pub const RUN_HELPER: &str = "toolbox-run";

const PRODUCT_DIR: &str = "toolbox";
const LICENSE_MARKER: &str = "COPYING";

/// Locations searched for sibling helper binaries.
///
/// The directory holding the running daemon is always searched first.
/// To support running straight out of a build tree, an ancestor directory
/// named after the product and carrying the license file is remembered
/// as a fallback.
#[derive(Debug, Clone)]
pub struct Executables {
    primary: PathBuf,
    fallback: Option<PathBuf>,
}

impl Executables {
    pub fn discover<P: AsRef<Path>>(argv0: P) -> Self {
        let primary = argv0
            .as_ref()
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut fallback = None;
        for dir in primary.ancestors().skip(1) {
            if dir.file_name() == Some(OsStr::new(PRODUCT_DIR))
                && dir.join(LICENSE_MARKER).is_file()
            {
                // the outermost matching ancestor wins
                fallback = Some(dir.to_path_buf());
            }
        }

        Self { primary, fallback }
    }

    /// Find the named helper, returning its full path
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let path = self.primary.join(name);
        if is_exe(&path) {
            return Some(path);
        }
        if let Some(dir) = &self.fallback {
            let path = dir.join(name);
            if is_exe(&path) {
                return Some(path);
            }
        }
        tracing::warn!("Failed to find {name}");
        None
    }
}

fn is_exe<P: AsRef<Path>>(filepath: P) -> bool {
    use faccess::PathExt;

    if !filepath.as_ref().is_file() {
        false
    } else {
        filepath.as_ref().executable()
    }
}
