//! The interning inode table shared by all kernel worker threads
//!
//! The kernel identifies inodes by a fixed-width integer, while the
//! filesystem treats the pair of relative path and view flag as the real
//! identity. The table interns that pair onto a stable slab index and
//! reference-counts each entry with the kernel's lookup count.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[cfg(test)]
#[path = "./inode_test.rs"]
mod inode_test;

/// The reserved identity of the mount root
pub const ROOT_ID: u64 = fuser::FUSE_ROOT_ID;

const FIRST_ID: u64 = ROOT_ID + 1;

/// The identity of an inode: a slash-separated path relative to the
/// container root, and which of the two views it was looked up in.
/// The view roots themselves carry an empty path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeKey {
    pub path: String,
    pub raw: bool,
}

impl Hash for InodeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.raw as u64 * 60013);
        self.path.hash(state);
    }
}

#[derive(Debug)]
pub struct InodeData {
    key: InodeKey,
    refs: AtomicU64,
}

impl InodeData {
    pub fn path(&self) -> &str {
        &self.key.path
    }

    pub fn is_raw(&self) -> bool {
        self.key.raw
    }
}

#[derive(Debug, Default)]
pub struct InodeTable {
    state: Mutex<TableState>,
}

#[derive(Debug, Default)]
struct TableState {
    slots: Vec<Option<Arc<InodeData>>>,
    free: Vec<usize>,
    ids: HashMap<InodeKey, u64>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the unique inode id for `(path, raw)`.
    ///
    /// An equivalent live entry gains one reference and the caller's path
    /// is discarded; otherwise a fresh entry starts at refcount 1. The id
    /// is a slab index, stable for the entry's lifetime.
    pub fn intern(&self, path: String, raw: bool) -> (u64, Arc<InodeData>) {
        let key = InodeKey { path, raw };
        let mut state = self.state.lock().expect("inode table lock poisoned");

        if let Some(&id) = state.ids.get(&key) {
            let node = state.slots[(id - FIRST_ID) as usize]
                .as_ref()
                .cloned()
                .expect("indexed inode is live");
            node.refs.fetch_add(1, Ordering::Relaxed);
            return (id, node);
        }

        let node = Arc::new(InodeData {
            key: key.clone(),
            refs: AtomicU64::new(1),
        });
        let idx = match state.free.pop() {
            Some(idx) => {
                state.slots[idx] = Some(Arc::clone(&node));
                idx
            }
            None => {
                state.slots.push(Some(Arc::clone(&node)));
                state.slots.len() - 1
            }
        };
        let id = idx as u64 + FIRST_ID;
        state.ids.insert(key, id);
        (id, node)
    }

    pub fn get(&self, ino: u64) -> Option<Arc<InodeData>> {
        let state = self.state.lock().expect("inode table lock poisoned");
        let idx = ino.checked_sub(FIRST_ID)? as usize;
        state.slots.get(idx)?.clone()
    }

    /// Drop `nlookup` kernel references from an inode, freeing it at zero.
    ///
    /// The decision to remove happens under the table lock so a concurrent
    /// intern cannot resurrect a dying entry. The root id is ignored and
    /// never removed.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_ID {
            return;
        }
        let mut state = self.state.lock().expect("inode table lock poisoned");
        let Some(idx) = ino.checked_sub(FIRST_ID).map(|idx| idx as usize) else {
            return;
        };
        let node = match state.slots.get(idx) {
            Some(Some(node)) => Arc::clone(node),
            _ => return,
        };
        let before = node.refs.fetch_sub(nlookup, Ordering::AcqRel);
        if before <= nlookup {
            state.ids.remove(&node.key);
            state.slots[idx] = None;
            state.free.push(idx);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().expect("inode table lock poisoned").ids.len()
    }

    #[cfg(test)]
    fn refs(&self, ino: u64) -> Option<u64> {
        self.get(ino).map(|node| node.refs.load(Ordering::Relaxed))
    }
}
