//! Source-side plumbing for a path.
//!
//! Every source — a local publisher session or an external pull — feeds the
//! path actor through one [`SourceEvent`] channel.  Events carry the
//! *generation* of the source that produced them so the actor can discard
//! stragglers from a source it has already replaced or closed.
//!
//! [`ExternalSource`] is the pull driver: an outer retry loop with a fixed
//! 5 s backoff runs connect → negotiate → read against a remote relay
//! (`ws://` / `wss://` URL, credentials taken from the URL userinfo).
//! `close()` flips the terminate watch, which cancels any in-flight I/O,
//! and joins the task before returning.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use mtx_protocol::{Frame, TrackInfo, WireMessage};

const RETRY_PAUSE: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive undecodable frames tolerated before the stream is dropped
/// and the retry loop takes over.
const MAX_DECODE_FAILURES: u32 = 16;

// ---------------------------------------------------------------------------
// Events into the path actor
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SourceEvent {
    Ready {
        generation: u64,
        tracks: Vec<TrackInfo>,
    },
    NotReady {
        generation: u64,
    },
    Frame {
        generation: u64,
        frame: Frame,
    },
}

/// Frame feed handed to a publisher session on a successful announce.
#[derive(Debug, Clone)]
pub struct SourceFrameSender {
    generation: u64,
    tx: mpsc::Sender<SourceEvent>,
}

impl SourceFrameSender {
    pub fn new(generation: u64, tx: mpsc::Sender<SourceEvent>) -> Self {
        SourceFrameSender { generation, tx }
    }

    /// Feed one frame into the path.  Errors when the path has gone away.
    pub async fn send(&self, frame: Frame) -> Result<(), SourceGone> {
        self.tx
            .send(SourceEvent::Frame {
                generation: self.generation,
                frame,
            })
            .await
            .map_err(|_| SourceGone)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("path is gone")]
pub struct SourceGone;

// ---------------------------------------------------------------------------
// External pull source
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid source URL '{url}': {reason}")]
    BadUrl { url: String, reason: String },
    #[error("connect: {0}")]
    Connect(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("remote rejected: {code}: {message}")]
    Rejected { code: String, message: String },
    #[error("disconnected")]
    Disconnected,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("{0} consecutive undecodable frames")]
    TooManyDecodeFailures(u32),
}

#[derive(Debug)]
pub struct ExternalSource {
    terminate: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ExternalSource {
    /// Start the retry loop.  Events are tagged with `generation`.
    pub fn spawn(url: String, events: mpsc::Sender<SourceEvent>, generation: u64) -> Self {
        let (terminate, terminate_rx) = watch::channel(false);
        let task = tokio::spawn(retry_loop(url, events, generation, terminate_rx));
        ExternalSource { terminate, task }
    }

    /// Synchronous teardown: cancel in-flight I/O and join the task.
    pub async fn close(self) {
        let _ = self.terminate.send(true);
        let _ = self.task.await;
    }
}

async fn retry_loop(
    url: String,
    events: mpsc::Sender<SourceEvent>,
    generation: u64,
    mut terminate: watch::Receiver<bool>,
) {
    loop {
        let mut reached_ready = false;
        tokio::select! {
            _ = terminate.changed() => return,
            result = run_once(&url, &events, generation, &mut reached_ready) => {
                match result {
                    Ok(()) => info!(%url, "remote stream ended"),
                    Err(e) => warn!(%url, error = %e, "source connection failed"),
                }
            }
        }
        if reached_ready {
            tokio::select! {
                _ = terminate.changed() => return,
                sent = events.send(SourceEvent::NotReady { generation }) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(RETRY_PAUSE) => {}
            _ = terminate.changed() => return,
        }
    }
}

/// One connect → negotiate → read pass.  `reached_ready` is flipped as soon
/// as the ready event is emitted so the caller knows a not-ready event is
/// owed whichever way this returns.
async fn run_once(
    url: &str,
    events: &mpsc::Sender<SourceEvent>,
    generation: u64,
    reached_ready: &mut bool,
) -> Result<(), SourceError> {
    let parsed = SourceUrl::parse(url)?;

    let (mut ws, _resp) = tokio_tungstenite::connect_async(parsed.connect_url.as_str())
        .await
        .map_err(|e| SourceError::Connect(e.to_string()))?;

    match recv_control(&mut ws).await? {
        WireMessage::Hello(_) => {}
        other => {
            return Err(SourceError::Protocol(format!(
                "expected hello, got {other:?}"
            )));
        }
    }

    send_control(
        &mut ws,
        &WireMessage::Describe(mtx_protocol::Describe {
            request_id: "describe".to_owned(),
            path: parsed.path.clone(),
            user: parsed.user.clone(),
            pass: parsed.pass.clone(),
        }),
    )
    .await?;
    let tracks = match recv_control(&mut ws).await? {
        WireMessage::DescribeOk(ok) => ok.tracks,
        WireMessage::Error(e) => {
            return Err(SourceError::Rejected {
                code: e.code,
                message: e.message,
            });
        }
        WireMessage::Redirect(r) => {
            // redirects are not followed; the operator should point the
            // source URL at the final location
            return Err(SourceError::Protocol(format!(
                "remote redirects to {}",
                r.location
            )));
        }
        other => {
            return Err(SourceError::Protocol(format!(
                "expected describe_ok, got {other:?}"
            )));
        }
    };

    send_control(
        &mut ws,
        &WireMessage::SetupPlay(mtx_protocol::SetupPlay {
            request_id: "setup".to_owned(),
            path: parsed.path.clone(),
            track_ids: Vec::new(),
            user: parsed.user.clone(),
            pass: parsed.pass.clone(),
        }),
    )
    .await?;
    match recv_control(&mut ws).await? {
        WireMessage::SetupOk(_) => {}
        WireMessage::Error(e) => {
            return Err(SourceError::Rejected {
                code: e.code,
                message: e.message,
            });
        }
        other => {
            return Err(SourceError::Protocol(format!(
                "expected setup_ok, got {other:?}"
            )));
        }
    }

    send_control(
        &mut ws,
        &WireMessage::Play(mtx_protocol::Play {
            request_id: "play".to_owned(),
        }),
    )
    .await?;
    match recv_control(&mut ws).await? {
        WireMessage::Ok(_) => {}
        WireMessage::Error(e) => {
            return Err(SourceError::Rejected {
                code: e.code,
                message: e.message,
            });
        }
        other => {
            return Err(SourceError::Protocol(format!(
                "expected ok, got {other:?}"
            )));
        }
    }

    debug!(%url, tracks = tracks.len(), "external source ready");
    *reached_ready = true;
    if events
        .send(SourceEvent::Ready { generation, tracks })
        .await
        .is_err()
    {
        return Ok(());
    }

    let mut decode_failures: u32 = 0;
    loop {
        match ws.next().await {
            None => return Err(SourceError::Disconnected),
            Some(Err(e)) => return Err(SourceError::Protocol(e.to_string())),
            Some(Ok(Message::Binary(buf))) => match Frame::decode(&buf) {
                Ok(frame) => {
                    decode_failures = 0;
                    if events
                        .send(SourceEvent::Frame { generation, frame })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Err(e) => {
                    decode_failures += 1;
                    if decode_failures >= MAX_DECODE_FAILURES {
                        return Err(SourceError::TooManyDecodeFailures(decode_failures));
                    }
                    debug!(error = %e, "skipping undecodable frame");
                }
            },
            Some(Ok(Message::Text(t))) => match serde_json::from_str::<WireMessage>(&t) {
                Ok(WireMessage::Error(e)) => {
                    return Err(SourceError::Rejected {
                        code: e.code,
                        message: e.message,
                    });
                }
                Ok(_) | Err(_) => {}
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Ok(_)) => {}
        }
    }
}

async fn send_control<S>(ws: &mut S, msg: &WireMessage) -> Result<(), SourceError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(msg).map_err(|e| SourceError::Protocol(e.to_string()))?;
    ws.send(Message::Text(json.into()))
        .await
        .map_err(|e| SourceError::Protocol(e.to_string()))
}

async fn recv_control<S>(ws: &mut S) -> Result<WireMessage, SourceError>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return Err(SourceError::HandshakeTimeout),
            msg = ws.next() => match msg {
                None => return Err(SourceError::Disconnected),
                Some(Err(e)) => return Err(SourceError::Protocol(e.to_string())),
                Some(Ok(Message::Text(t))) => {
                    return serde_json::from_str(&t)
                        .map_err(|e| SourceError::Protocol(format!("JSON parse: {e}")));
                }
                Some(Ok(Message::Close(_))) => return Err(SourceError::Disconnected),
                Some(Ok(_)) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Source URL parsing
// ---------------------------------------------------------------------------

/// A `ws://` / `wss://` source URL with optional userinfo, e.g.
/// `ws://user:pass@upstream:8554/live/cam1`.
#[derive(Debug, PartialEq, Eq)]
struct SourceUrl {
    /// URL with the userinfo stripped, suitable for `connect_async`.
    connect_url: String,
    path: String,
    user: Option<String>,
    pass: Option<String>,
}

impl SourceUrl {
    fn parse(url: &str) -> Result<Self, SourceError> {
        let bad = |reason: &str| SourceError::BadUrl {
            url: url.to_owned(),
            reason: reason.to_owned(),
        };

        let rest = url
            .strip_prefix("ws://")
            .map(|r| ("ws://", r))
            .or_else(|| url.strip_prefix("wss://").map(|r| ("wss://", r)))
            .ok_or_else(|| bad("scheme must be ws:// or wss://"))?;
        let (scheme, rest) = rest;

        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, p),
            None => (rest, ""),
        };
        if path.is_empty() {
            return Err(bad("missing path"));
        }

        let (user, pass, host) = match authority.rsplit_once('@') {
            Some((userinfo, host)) => match userinfo.split_once(':') {
                Some((u, p)) => (Some(u.to_owned()), Some(p.to_owned()), host),
                None => (Some(userinfo.to_owned()), None, host),
            },
            None => (None, None, authority),
        };
        if host.is_empty() {
            return Err(bad("missing host"));
        }

        Ok(SourceUrl {
            connect_url: format!("{scheme}{host}/{path}"),
            path: path.to_owned(),
            user,
            pass,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_without_userinfo() {
        let parsed = SourceUrl::parse("ws://upstream:8554/live/cam1").unwrap();
        assert_eq!(parsed.connect_url, "ws://upstream:8554/live/cam1");
        assert_eq!(parsed.path, "live/cam1");
        assert_eq!(parsed.user, None);
    }

    #[test]
    fn url_with_userinfo_is_stripped_for_connect() {
        let parsed = SourceUrl::parse("wss://up:pw@remote/s").unwrap();
        assert_eq!(parsed.connect_url, "wss://remote/s");
        assert_eq!(parsed.path, "s");
        assert_eq!(parsed.user.as_deref(), Some("up"));
        assert_eq!(parsed.pass.as_deref(), Some("pw"));
    }

    #[test]
    fn url_with_user_only() {
        let parsed = SourceUrl::parse("ws://up@remote:1/s").unwrap();
        assert_eq!(parsed.user.as_deref(), Some("up"));
        assert_eq!(parsed.pass, None);
    }

    #[test]
    fn bad_urls_are_rejected() {
        assert!(SourceUrl::parse("rtsp://remote/s").is_err());
        assert!(SourceUrl::parse("ws://remote").is_err());
        assert!(SourceUrl::parse("ws://@/s").is_err());
    }
}
