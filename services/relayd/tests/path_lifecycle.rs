//! Path actor semantics, driven through the manager with bare session
//! handles (no sockets).

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{h264_track, opus_track, start_relay};
use relayd::errors::RelayError;
use relayd::path::DescribeAnswer;
use relayd::session::{CloseReason, Credentials, SessionControl, SessionDesc, SessionHandle};
use uuid::Uuid;

const CONF: &str = r#"
listen = "127.0.0.1:0"

[paths.cam1]
"#;

fn addr() -> SocketAddr {
    "127.0.0.1:45000".parse().unwrap()
}

fn handle() -> (
    SessionHandle,
    tokio::sync::mpsc::UnboundedReceiver<SessionControl>,
) {
    SessionHandle::new(Uuid::new_v4(), addr())
}

fn desc() -> SessionDesc {
    SessionDesc {
        id: Uuid::new_v4(),
        remote_addr: addr(),
        requestor_url: None,
    }
}

#[tokio::test]
async fn publisher_override_displaces_and_adopts_new_tracks() {
    let relay = start_relay(CONF).await;
    let client = relay.client();

    let (first, mut first_ctrl) = handle();
    let first_attachment = client
        .announce("cam1", first, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap();
    first_attachment.path.record().await.unwrap();

    let (second, _second_ctrl) = handle();
    let second_attachment = client
        .announce(
            "cam1",
            second,
            Credentials::default(),
            vec![h264_track(0), opus_track(1)],
        )
        .await
        .unwrap();

    assert_eq!(
        first_ctrl.recv().await,
        Some(SessionControl::Close(CloseReason::PublisherDisplaced))
    );

    second_attachment.path.record().await.unwrap();
    match client
        .describe("cam1", desc(), Credentials::default())
        .await
        .unwrap()
    {
        DescribeAnswer::Tracks(tracks) => {
            assert_eq!(tracks, vec![h264_track(0), opus_track(1)]);
        }
        DescribeAnswer::Redirect(location) => panic!("unexpected redirect to {location}"),
    }

    relay.stop().await;
}

#[tokio::test]
async fn override_can_be_disabled() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.cam1]
disable_publisher_override = true
"#,
    )
    .await;
    let client = relay.client();

    let (first, _ctrl) = handle();
    let _attachment = client
        .announce("cam1", first, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap();

    let (second, _ctrl2) = handle();
    let err = client
        .announce("cam1", second, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::AlreadyPublishing);

    relay.stop().await;
}

#[tokio::test]
async fn announce_then_remove_leaves_no_source() {
    let relay = start_relay(CONF).await;
    let client = relay.client();

    let (publisher, _ctrl) = handle();
    let attachment = client
        .announce("cam1", publisher, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap();
    attachment.path.remove().await;

    let err = client
        .describe("cam1", desc(), Credentials::default())
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::NoOnePublishing("cam1".to_owned()));

    relay.stop().await;
}

#[tokio::test]
async fn describe_by_an_attached_session_is_rejected() {
    let relay = start_relay(CONF).await;
    let client = relay.client();

    let (publisher, _ctrl) = handle();
    let publisher_id = publisher.id;
    let _attachment = client
        .announce("cam1", publisher, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap();

    let err = client
        .describe(
            "cam1",
            SessionDesc {
                id: publisher_id,
                remote_addr: addr(),
                requestor_url: None,
            },
            Credentials::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::AlreadySubscribed);

    relay.stop().await;
}

#[tokio::test]
async fn external_source_path_rejects_local_publish() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.proxied]
source = "ws://127.0.0.1:9/up"
source_on_demand = true
"#,
    )
    .await;
    let client = relay.client();

    let (publisher, _ctrl) = handle();
    let err = client
        .announce(
            "proxied",
            publisher,
            Credentials::default(),
            vec![h264_track(0)],
        )
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::AlreadyPublishing);

    relay.stop().await;
}

#[tokio::test]
async fn redirect_path_answers_describe_with_location() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.moved]
source = "redirect"
source_redirect = "ws://other:8554/cam1"
"#,
    )
    .await;
    let client = relay.client();

    match client
        .describe("moved", desc(), Credentials::default())
        .await
        .unwrap()
    {
        DescribeAnswer::Redirect(location) => assert_eq!(location, "ws://other:8554/cam1"),
        DescribeAnswer::Tracks(_) => panic!("expected redirect"),
    }

    relay.stop().await;
}

#[tokio::test]
async fn fallback_resolves_against_the_requestor_url() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.cam1]
fallback = "/other"
"#,
    )
    .await;
    let client = relay.client();

    let with_url = SessionDesc {
        id: Uuid::new_v4(),
        remote_addr: addr(),
        requestor_url: Some("ws://relay.example:8554/cam1".to_owned()),
    };
    match client
        .describe("cam1", with_url, Credentials::default())
        .await
        .unwrap()
    {
        DescribeAnswer::Redirect(location) => {
            assert_eq!(location, "ws://relay.example:8554/other");
        }
        DescribeAnswer::Tracks(_) => panic!("expected redirect"),
    }

    // a relative fallback with no usable requestor URL is malformed
    let err = client
        .describe("cam1", desc(), Credentials::default())
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::FallbackUnresolvable);

    relay.stop().await;
}

#[tokio::test]
async fn pausing_the_publisher_detaches_readers() {
    let relay = start_relay(CONF).await;
    let client = relay.client();

    let (publisher, _publisher_ctrl) = handle();
    let publisher_attachment = client
        .announce("cam1", publisher, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap();
    publisher_attachment.path.record().await.unwrap();

    let (reader, mut reader_ctrl) = handle();
    let reader_attachment = client
        .setup_play("cam1", reader, None, Credentials::default(), Vec::new())
        .await
        .unwrap();
    let relayd::path::SetupPlayAnswer::Attached(attachment) = reader_attachment else {
        panic!("expected attachment");
    };
    attachment.path.play().await.unwrap();

    publisher_attachment.path.pause().await.unwrap();

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), reader_ctrl.recv())
            .await
            .expect("reader was not detached"),
        Some(SessionControl::Close(CloseReason::SourceNotReady))
    );

    relay.stop().await;
}

#[tokio::test]
async fn remove_of_the_source_session_detaches_everyone() {
    let relay = start_relay(CONF).await;
    let client = relay.client();

    let (publisher, _publisher_ctrl) = handle();
    let publisher_attachment = client
        .announce("cam1", publisher, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap();
    publisher_attachment.path.record().await.unwrap();

    let (reader, mut reader_ctrl) = handle();
    let answer = client
        .setup_play("cam1", reader, None, Credentials::default(), Vec::new())
        .await
        .unwrap();
    let relayd::path::SetupPlayAnswer::Attached(attachment) = answer else {
        panic!("expected attachment");
    };
    attachment.path.play().await.unwrap();

    publisher_attachment.path.remove().await;

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), reader_ctrl.recv())
            .await
            .expect("reader was not detached"),
        Some(SessionControl::Close(CloseReason::SourceNotReady))
    );

    relay.stop().await;
}
