//! On-demand sources: lazy start on first describe, idle close, and the
//! describe timeout.

mod common;

use std::time::{Duration, Instant};

use common::{h264_track, start_relay};
use mtx_protocol::{Frame, StreamKind, WireMessage, error_codes};
use mtx_test_utils::MockClient;

#[tokio::test]
async fn external_source_starts_on_first_describe_and_relays_frames() {
    let upstream = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.cam1]
"#,
    )
    .await;
    let mut upstream_publisher = MockClient::publish(&upstream.url, "cam1", vec![h264_track(0)])
        .await
        .unwrap();

    let downstream = start_relay(&format!(
        r#"
listen = "127.0.0.1:0"

[paths.camX]
source = "ws://127.0.0.1:{}/cam1"
source_on_demand = true
source_on_demand_start_timeout = "5s"
source_on_demand_close_after = "500ms"
"#,
        upstream.port
    ))
    .await;

    // first describe triggers the pull and waits for readiness
    let mut probe = MockClient::connect(&downstream.url).await.unwrap();
    match probe.describe("camX").await.unwrap() {
        WireMessage::DescribeOk(ok) => assert_eq!(ok.tracks, vec![h264_track(0)]),
        other => panic!("expected describe_ok, got {other:?}"),
    }

    // frames flow upstream publisher -> upstream path -> pull -> downstream path -> reader
    let (mut reader, tracks) = MockClient::subscribe(&downstream.url, "camX").await.unwrap();
    assert_eq!(tracks, vec![h264_track(0)]);
    for n in 0u32..20 {
        upstream_publisher
            .send_frame(&Frame::new(0, StreamKind::Rtp, n.to_be_bytes().to_vec()))
            .await
            .unwrap();
    }
    for n in 0u32..20 {
        let frame = tokio::time::timeout(Duration::from_secs(5), reader.recv_frame())
            .await
            .expect("relayed frame timed out")
            .unwrap();
        assert_eq!(frame.payload.as_ref(), n.to_be_bytes());
    }

    // last reader leaves; after the idle delay the pull is closed, and the
    // next describe starts a fresh one
    reader.close().await.unwrap();
    probe.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut probe = MockClient::connect(&downstream.url).await.unwrap();
    match probe.describe("camX").await.unwrap() {
        WireMessage::DescribeOk(ok) => assert_eq!(ok.tracks, vec![h264_track(0)]),
        other => panic!("expected describe_ok after idle close, got {other:?}"),
    }

    downstream.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn unreachable_source_times_out_pending_describes() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.camY]
source = "ws://127.0.0.1:1/dead"
source_on_demand = true
source_on_demand_start_timeout = "300ms"
"#,
    )
    .await;

    let mut probe = MockClient::connect(&relay.url).await.unwrap();
    let started = Instant::now();
    match probe.describe("camY").await.unwrap() {
        WireMessage::Error(e) => {
            assert_eq!(e.code, error_codes::NOT_FOUND);
            assert!(e.message.contains("did not become ready"), "{}", e.message);
        }
        other => panic!("expected timeout error, got {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(250) && elapsed < Duration::from_secs(3),
        "describe should fail at the describe timeout, took {elapsed:?}"
    );

    relay.stop().await;
}

#[tokio::test]
async fn idle_recording_publisher_survives_the_read_deadline() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"
read_timeout = "500ms"

[paths.cam1]
"#,
    )
    .await;

    let mut publisher = MockClient::publish(&relay.url, "cam1", vec![h264_track(0)])
        .await
        .unwrap();

    // codec silence: nothing on the wire for well past the read deadline
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // the session is still attached and still the source
    let (mut reader, _) = MockClient::subscribe(&relay.url, "cam1").await.unwrap();
    publisher
        .send_frame(&Frame::new(0, StreamKind::Rtp, &b"still-here"[..]))
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), reader.recv_frame())
        .await
        .expect("frame timed out after idle period")
        .unwrap();
    assert_eq!(frame.payload.as_ref(), b"still-here");

    relay.stop().await;
}

#[tokio::test]
async fn idle_connected_session_is_dropped_at_the_read_deadline() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"
read_timeout = "500ms"

[paths.cam1]
"#,
    )
    .await;

    // a session that never issues a request is reaped
    let mut idle = MockClient::connect(&relay.url).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(
        idle.recv_message().await.is_err(),
        "idle connected session should have been closed"
    );

    relay.stop().await;
}

#[tokio::test]
async fn on_demand_command_that_never_publishes_times_out() {
    let relay = start_relay(
        r#"
listen = "127.0.0.1:0"

[paths.ondemand]
run_on_demand = "sleep 30"
run_on_demand_start_timeout = "300ms"
run_on_demand_close_after = "200ms"
"#,
    )
    .await;

    let mut probe = MockClient::connect(&relay.url).await.unwrap();
    match probe.describe("ondemand").await.unwrap() {
        WireMessage::Error(e) => assert_eq!(e.code, error_codes::NOT_FOUND),
        other => panic!("expected timeout error, got {other:?}"),
    }

    // shutdown must kill the launched command promptly
    let started = Instant::now();
    relay.stop().await;
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "shutdown hung on the on-demand command"
    );
}
