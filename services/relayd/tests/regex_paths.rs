//! Regex (wildcard) path entries: lazy creation, first-match resolution,
//! and removal of empty regex-derived paths from the registry.

mod common;

use std::time::Duration;

use common::{h264_track, start_relay};
use relayd::errors::RelayError;
use relayd::session::{Credentials, SessionDesc, SessionHandle};
use uuid::Uuid;

const CONF: &str = r#"
listen = "127.0.0.1:0"

[paths."~^live/.*$"]
"#;

fn desc() -> SessionDesc {
    SessionDesc {
        id: Uuid::new_v4(),
        remote_addr: "127.0.0.1:45000".parse().unwrap(),
        requestor_url: None,
    }
}

async fn wait_for_registry(relay: &common::Relay, expected: &[&str]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let paths = relay.client().list_paths().await;
        if paths.iter().map(String::as_str).eq(expected.iter().copied()) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry never reached {expected:?}, still {paths:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn describe_without_a_publisher_fails_and_the_path_is_removed() {
    let relay = start_relay(CONF).await;

    let err = relay
        .client()
        .describe("live/a", desc(), Credentials::default())
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::NoOnePublishing("live/a".to_owned()));

    // no clients, no source: the regex-derived path closes itself
    wait_for_registry(&relay, &[]).await;

    relay.stop().await;
}

#[tokio::test]
async fn publish_and_read_on_a_matched_name_then_cleanup() {
    let relay = start_relay(CONF).await;
    let client = relay.client();

    let (publisher, _ctrl) = SessionHandle::new(Uuid::new_v4(), "127.0.0.1:1".parse().unwrap());
    let attachment = client
        .announce(
            "live/b",
            publisher,
            Credentials::default(),
            vec![h264_track(0)],
        )
        .await
        .unwrap();
    attachment.path.record().await.unwrap();
    assert_eq!(client.list_paths().await, vec!["live/b".to_owned()]);

    attachment.path.remove().await;
    wait_for_registry(&relay, &[]).await;

    relay.stop().await;
}

#[tokio::test]
async fn non_matching_names_are_not_found() {
    let relay = start_relay(CONF).await;

    let err = relay
        .client()
        .describe("vod/x", desc(), Credentials::default())
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::NotFound("vod/x".to_owned()));

    relay.stop().await;
}

#[tokio::test]
async fn invalid_names_are_rejected_before_resolution() {
    let relay = start_relay(CONF).await;
    let client = relay.client();

    for bad in ["live//a", "/live/a", "live/a/", "~live/a", "live a"] {
        let err = client
            .describe(bad, desc(), Credentials::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, RelayError::NameInvalid(_)),
            "{bad} should be invalid, got {err:?}"
        );
    }

    relay.stop().await;
}

#[tokio::test]
async fn static_paths_survive_idleness() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.cam1]

[paths."~^live/.*$"]
"#,
    )
    .await;

    // a failed describe leaves the static path alone
    let _ = relay
        .client()
        .describe("cam1", desc(), Credentials::default())
        .await
        .unwrap_err();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(relay.client().list_paths().await, vec!["cam1".to_owned()]);

    relay.stop().await;
}
