use rstest::rstest;

use super::{load_config, Config};

static ENV_MUTEX: once_cell::sync::Lazy<std::sync::Mutex<()>> =
    once_cell::sync::Lazy::new(|| std::sync::Mutex::new(()));

#[rstest]
fn test_config_defaults() {
    let config = Config::default();
    assert!(config.env.root.ends_with("toolbox/env"));
    assert!(config.runtime.socket_dir.ends_with("libpod/tmp/socket"));
    assert_eq!(config.runtime.podman, std::path::PathBuf::from("podman"));
    assert!(config.server.socket.ends_with("toolbox/envd.sock"));
}

#[rstest]
fn test_config_from_json() {
    let config: Config = serde_json::from_str(
        r#"{"runtime": {"podman": "/usr/local/bin/podman"}, "env": {"root": "/srv/env"}}"#,
    )
    .unwrap();
    assert_eq!(
        config.runtime.podman,
        std::path::PathBuf::from("/usr/local/bin/podman")
    );
    assert_eq!(config.env.root, std::path::PathBuf::from("/srv/env"));
    // unset sections keep their defaults
    assert!(config.server.socket.ends_with("toolbox/envd.sock"));
}

#[rstest]
fn test_config_env_override() {
    // Environment manipulation is not thread safe, so run these test cases
    // serially.
    let _guard = ENV_MUTEX.lock().unwrap();
    let orig = std::env::var_os("TOOLBOX_ENV__ROOT");
    std::env::set_var("TOOLBOX_ENV__ROOT", "/somewhere/else");
    let config = load_config();
    match orig {
        Some(orig) => std::env::set_var("TOOLBOX_ENV__ROOT", orig),
        None => std::env::remove_var("TOOLBOX_ENV__ROOT"),
    }
    let config = config.unwrap();
    assert_eq!(config.env.root, std::path::PathBuf::from("/somewhere/else"));
}
