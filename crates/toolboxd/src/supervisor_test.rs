use std::path::Path;
use std::sync::Arc;

use rstest::rstest;

use super::{scan_envroot, select_default, Supervisor};
use crate::exec::Executables;
use crate::podman::ContainerInfo;
use crate::Config;

fn supervisor_at(root: &Path) -> Supervisor {
    let mut config = Config::default();
    config.env.root = root.to_path_buf();
    Supervisor::new(
        Arc::new(config),
        Executables::discover("/usr/libexec/toolbox/toolboxd"),
    )
}

fn info(name: &str, id: &str, pid: i32) -> ContainerInfo {
    ContainerInfo {
        id: id.into(),
        name: name.into(),
        pid,
    }
}

/// The directory names and default-link target currently under a root
fn snapshot(root: &Path) -> (Vec<String>, Option<String>) {
    let mut dirs = Vec::new();
    let mut default = None;
    for entry in std::fs::read_dir(root).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = entry.path().symlink_metadata().unwrap();
        if meta.is_symlink() {
            assert_eq!(name, "_default");
            default = Some(
                std::fs::read_link(entry.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned(),
            );
        } else {
            assert!(meta.is_dir());
            dirs.push(name);
        }
    }
    dirs.sort();
    (dirs, default)
}

#[rstest]
#[tokio::test]
async fn test_refresh_empties_envroot_when_runtime_reports_nothing() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let root = tmpdir.path();
    std::fs::create_dir(root.join("a")).unwrap();
    std::fs::create_dir(root.join("b")).unwrap();
    std::os::unix::fs::symlink("a", root.join("_default")).unwrap();

    let mut supervisor = supervisor_at(root);
    supervisor.refresh(Vec::new()).await;

    assert_eq!(std::fs::read_dir(root).unwrap().count(), 0);
    assert!(supervisor.containers.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_refresh_creates_directory_and_default_link() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let root = tmpdir.path();

    let mut supervisor = supervisor_at(root);
    supervisor
        .refresh(vec![info("fedora-toolbox-40", "abc", 0)])
        .await;

    let (dirs, default) = snapshot(root);
    assert_eq!(dirs, vec!["fedora-toolbox-40".to_string()]);
    assert_eq!(default.as_deref(), Some("fedora-toolbox-40"));

    // pid 0 means no filesystem child is spawned
    let container = supervisor.containers.get("fedora-toolbox-40").unwrap();
    assert!(!container.is_mounted());
}

#[rstest]
#[tokio::test]
async fn test_back_to_back_passes_are_idempotent() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let root = tmpdir.path();

    let list = vec![
        info("fedora-toolbox-39", "aaa", 0),
        info("fedora-toolbox-40", "bbb", 0),
        info("custom", "ccc", 0),
    ];
    let mut supervisor = supervisor_at(root);
    supervisor.refresh(list.clone()).await;
    let first = snapshot(root);
    supervisor.refresh(list).await;
    let second = snapshot(root);

    assert_eq!(first, second);
    assert_eq!(
        first.0,
        vec![
            "custom".to_string(),
            "fedora-toolbox-39".to_string(),
            "fedora-toolbox-40".to_string()
        ]
    );
    assert_eq!(first.1.as_deref(), Some("fedora-toolbox-40"));
}

#[rstest]
#[tokio::test]
async fn test_refresh_removes_garbage_entries() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let root = tmpdir.path();
    std::fs::write(root.join("stray-file"), "junk").unwrap();
    std::os::unix::fs::symlink("elsewhere", root.join("stray-link")).unwrap();

    let mut supervisor = supervisor_at(root);
    supervisor
        .refresh(vec![info("fedora-toolbox-40", "abc", 0)])
        .await;

    let (dirs, default) = snapshot(root);
    assert_eq!(dirs, vec!["fedora-toolbox-40".to_string()]);
    assert_eq!(default.as_deref(), Some("fedora-toolbox-40"));
}

#[rstest]
#[tokio::test]
async fn test_refresh_drops_departed_containers() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let root = tmpdir.path();

    let mut supervisor = supervisor_at(root);
    supervisor
        .refresh(vec![
            info("fedora-toolbox-40", "abc", 0),
            info("custom", "def", 0),
        ])
        .await;
    supervisor.refresh(vec![info("custom", "def", 0)]).await;

    let (dirs, default) = snapshot(root);
    assert_eq!(dirs, vec!["custom".to_string()]);
    assert_eq!(default, None);
    assert!(!supervisor.containers.contains_key("fedora-toolbox-40"));
    assert!(supervisor.containers.contains_key("custom"));
}

#[rstest]
#[tokio::test]
async fn test_default_link_follows_the_greatest_name() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let root = tmpdir.path();

    let mut supervisor = supervisor_at(root);
    supervisor
        .refresh(vec![info("fedora-toolbox-39", "a", 0)])
        .await;
    assert_eq!(snapshot(root).1.as_deref(), Some("fedora-toolbox-39"));

    supervisor
        .refresh(vec![
            info("fedora-toolbox-39", "a", 0),
            info("fedora-toolbox-40", "b", 0),
        ])
        .await;
    assert_eq!(snapshot(root).1.as_deref(), Some("fedora-toolbox-40"));
}

#[rstest]
fn test_select_default_prefers_lexicographic_maximum() {
    let infos = [
        info("fedora-toolbox-39", "a", 0),
        info("fedora-toolbox-40", "b", 0),
        info("zebra", "c", 0),
    ];
    assert_eq!(select_default(infos.iter()), Some("fedora-toolbox-40"));
}

#[rstest]
fn test_select_default_without_candidates() {
    let infos = [info("custom", "a", 0), info("zebra", "b", 0)];
    assert_eq!(select_default(infos.iter()), None);
}

#[rstest]
fn test_scan_envroot_classifies_children() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let root = tmpdir.path();
    std::fs::create_dir(root.join("fedora-toolbox-40")).unwrap();
    std::os::unix::fs::symlink("fedora-toolbox-40", root.join("_default")).unwrap();
    std::fs::write(root.join("junk"), "junk").unwrap();
    std::os::unix::fs::symlink("x", root.join("other-link")).unwrap();

    let state = scan_envroot(root).unwrap();
    assert!(state.dirs.contains("fedora-toolbox-40"));
    assert_eq!(state.default_target.as_deref(), Some("fedora-toolbox-40"));
    let mut extra = state.extra.clone();
    extra.sort();
    assert_eq!(extra, vec!["junk".to_string(), "other-link".to_string()]);
}
