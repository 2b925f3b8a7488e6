//! Live configuration reload: removed entries close their paths, new
//! entries appear, attached sessions are force-closed.

mod common;

use std::time::Duration;

use common::{h264_track, start_relay};
use relayd::conf;
use relayd::errors::RelayError;
use relayd::session::{CloseReason, Credentials, SessionControl, SessionDesc, SessionHandle};
use uuid::Uuid;

fn desc() -> SessionDesc {
    SessionDesc {
        id: Uuid::new_v4(),
        remote_addr: "127.0.0.1:45000".parse().unwrap(),
        requestor_url: None,
    }
}

#[tokio::test]
async fn removed_path_is_closed_and_new_path_created() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.cam1]
"#,
    )
    .await;
    let client = relay.client();

    let (publisher, mut ctrl) = SessionHandle::new(Uuid::new_v4(), "127.0.0.1:1".parse().unwrap());
    let attachment = client
        .announce("cam1", publisher, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap();
    attachment.path.record().await.unwrap();

    let new_conf = conf::load_from_str(
        r#"
listen = "127.0.0.1:0"

[paths.cam2]
"#,
    )
    .unwrap();
    client.reload(new_conf).await;

    // the attached publisher was force-closed with the path
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), ctrl.recv())
            .await
            .expect("publisher was not closed"),
        Some(SessionControl::Close(CloseReason::PathTerminated))
    );

    // cam1 is gone, cam2 exists and is empty
    assert_eq!(client.list_paths().await, vec!["cam2".to_owned()]);
    let err = client
        .describe("cam1", desc(), Credentials::default())
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::NotFound("cam1".to_owned()));
    let err = client
        .describe("cam2", desc(), Credentials::default())
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::NoOnePublishing("cam2".to_owned()));

    relay.stop().await;
}

#[tokio::test]
async fn changed_entry_recreates_the_path() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.cam1]
"#,
    )
    .await;
    let client = relay.client();

    let (publisher, mut ctrl) = SessionHandle::new(Uuid::new_v4(), "127.0.0.1:1".parse().unwrap());
    let _attachment = client
        .announce("cam1", publisher, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap();

    // same name, different policy: close-and-recreate, never mutate in place
    let new_conf = conf::load_from_str(
        r#"
listen = "127.0.0.1:0"

[paths.cam1]
fallback = "/alt"
"#,
    )
    .unwrap();
    client.reload(new_conf).await;

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), ctrl.recv())
            .await
            .expect("publisher was not closed"),
        Some(SessionControl::Close(CloseReason::PathTerminated))
    );
    assert_eq!(client.list_paths().await, vec!["cam1".to_owned()]);

    relay.stop().await;
}

#[tokio::test]
async fn unchanged_entry_keeps_its_path_running() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.cam1]
"#,
    )
    .await;
    let client = relay.client();

    let (publisher, mut ctrl) = SessionHandle::new(Uuid::new_v4(), "127.0.0.1:1".parse().unwrap());
    let attachment = client
        .announce("cam1", publisher, Credentials::default(), vec![h264_track(0)])
        .await
        .unwrap();
    attachment.path.record().await.unwrap();

    let new_conf = conf::load_from_str(
        r#"
listen = "127.0.0.1:0"

[paths.cam1]

[paths.cam2]
"#,
    )
    .unwrap();
    client.reload(new_conf).await;

    // the publisher stays attached; only cam2 is new
    assert!(
        tokio::time::timeout(Duration::from_millis(300), ctrl.recv())
            .await
            .is_err(),
        "unchanged path must not close its sessions"
    );
    assert_eq!(
        client.list_paths().await,
        vec!["cam1".to_owned(), "cam2".to_owned()]
    );

    relay.stop().await;
}
