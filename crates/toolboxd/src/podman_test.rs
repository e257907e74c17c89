use rstest::rstest;

use super::{parse_listing, ContainerInfo, ContainerState};

#[rstest]
fn test_parse_listing_running_container() {
    let output = r#"[{
        "ID": "abc123",
        "Names": "fedora-toolbox-40",
        "State": 3,
        "Pid": 1234,
        "Labels": {"com.redhat.component": "fedora-toolbox"}
    }]"#;
    let infos = parse_listing(output).unwrap();
    assert_eq!(
        infos,
        vec![ContainerInfo {
            id: "abc123".into(),
            name: "fedora-toolbox-40".into(),
            pid: 1234,
        }]
    );
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
#[case(4)]
#[case(5)]
fn test_parse_listing_zeroes_pid_when_not_running(#[case] state: i64) {
    // podman reports the pid a stopped container used to have
    let output = format!(
        r#"[{{
            "ID": "abc123",
            "Names": "fedora-toolbox-40",
            "State": {state},
            "Pid": 1234,
            "Labels": {{"com.redhat.component": "fedora-toolbox"}}
        }}]"#
    );
    let infos = parse_listing(&output).unwrap();
    assert_eq!(infos[0].pid, 0);
}

#[rstest]
fn test_parse_listing_requires_toolbox_label() {
    let output = r#"[
        {"ID": "a", "Names": "plain", "State": 3, "Pid": 7, "Labels": {}},
        {"ID": "b", "Names": "other", "State": 3, "Pid": 8},
        {"ID": "c", "Names": "box", "State": 3, "Pid": 9,
         "Labels": {"com.redhat.component": "fedora-toolbox"}}
    ]"#;
    let infos = parse_listing(output).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].name, "box");
}

#[rstest]
fn test_parse_listing_skips_malformed_entries() {
    let output = r#"[
        42,
        {"Names": "missing-id", "State": 3, "Pid": 7,
         "Labels": {"com.redhat.component": "fedora-toolbox"}},
        {"ID": "c", "Names": "box", "Pid": 0,
         "Labels": {"com.redhat.component": "fedora-toolbox"}}
    ]"#;
    let infos = parse_listing(output).unwrap();
    // the entry without a State field defaults to not running
    assert_eq!(
        infos,
        vec![ContainerInfo {
            id: "c".into(),
            name: "box".into(),
            pid: 0,
        }]
    );
}

#[rstest]
fn test_parse_listing_rejects_non_array() {
    assert!(parse_listing(r#"{"ID": "a"}"#).is_err());
    assert!(parse_listing("not json").is_err());
}

#[rstest]
fn test_container_state_from_int() {
    assert_eq!(ContainerState::from(3), ContainerState::Running);
    assert_eq!(ContainerState::from(0), ContainerState::Unknown);
    assert_eq!(ContainerState::from(99), ContainerState::Unknown);
}
