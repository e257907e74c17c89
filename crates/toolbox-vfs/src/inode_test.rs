use rstest::rstest;

use super::{InodeTable, ROOT_ID};

#[rstest]
fn test_intern_is_idempotent() {
    let table = InodeTable::new();
    let (first, _) = table.intern("bin/ls".into(), false);
    let (second, _) = table.intern("bin/ls".into(), false);
    assert_eq!(first, second);
    assert_eq!(table.refs(first), Some(2));
    assert_eq!(table.len(), 1);
}

#[rstest]
fn test_views_are_distinct_identities() {
    let table = InodeTable::new();
    let (exe, _) = table.intern("bin/ls".into(), false);
    let (raw, _) = table.intern("bin/ls".into(), true);
    assert_ne!(exe, raw);
    assert_eq!(table.len(), 2);
}

#[rstest]
fn test_paths_are_distinct_identities() {
    let table = InodeTable::new();
    let (ls, _) = table.intern("bin/ls".into(), true);
    let (cat, _) = table.intern("bin/cat".into(), true);
    assert_ne!(ls, cat);
}

#[rstest]
fn test_ids_start_above_the_root_id() {
    let table = InodeTable::new();
    let (ino, _) = table.intern(String::new(), false);
    assert!(ino > ROOT_ID);
}

#[rstest]
fn test_forget_at_zero_removes_the_entry() {
    let table = InodeTable::new();
    let (ino, _) = table.intern("bin/ls".into(), false);
    table.intern("bin/ls".into(), false);
    table.forget(ino, 1);
    assert_eq!(table.refs(ino), Some(1));
    table.forget(ino, 1);
    assert!(table.get(ino).is_none());
    assert_eq!(table.len(), 0);
}

#[rstest]
fn test_forget_multi_counts() {
    let table = InodeTable::new();
    let (ino, _) = table.intern("etc/passwd".into(), true);
    table.intern("etc/passwd".into(), true);
    table.intern("etc/passwd".into(), true);
    table.forget(ino, 3);
    assert!(table.get(ino).is_none());
}

#[rstest]
fn test_forget_ignores_the_root() {
    let table = InodeTable::new();
    table.forget(ROOT_ID, u64::MAX);
    // unknown ids are ignored as well
    table.forget(999, 1);
    assert_eq!(table.len(), 0);
}

#[rstest]
fn test_freed_slots_are_reused() {
    let table = InodeTable::new();
    let (first, _) = table.intern("a".into(), false);
    table.forget(first, 1);
    let (second, _) = table.intern("b".into(), false);
    assert_eq!(first, second);
    assert_eq!(table.len(), 1);
    // the reused id now belongs to the new identity
    assert_eq!(table.get(second).unwrap().path(), "b");
}

#[rstest]
fn test_refcount_tracks_lookups_minus_forgets() {
    let table = InodeTable::new();
    let (ino, _) = table.intern("usr/bin".into(), false);
    for _ in 0..9 {
        table.intern("usr/bin".into(), false);
    }
    table.forget(ino, 4);
    assert_eq!(table.refs(ino), Some(6));
    table.forget(ino, 6);
    assert_eq!(table.len(), 0);
}
