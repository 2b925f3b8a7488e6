//! WebSocket ingress.
//!
//! One task per connection.  A session starts in the connected state, is
//! assigned an id, and then drives the path manager with the requests the
//! peer sends: describe / announce / setup_play / play / record / pause /
//! teardown.  Publishers feed binary frames into their path; readers drain
//! their bounded frame queue into the socket.
//!
//! The session owns nothing shared: paths reach back into it only through
//! the control channel behind its [`SessionHandle`], and a force-close from
//! a path is just another event in the select loop.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mtx_protocol::{
    AnnounceOk, DescribeOk, ErrorMessage, Frame, Hello, Ok_, Redirect, SetupOk, TrackInfo,
    WireMessage, error_codes,
};

use crate::errors::RelayError;
use crate::path::{AttachedPath, DescribeAnswer, SetupPlayAnswer};
use crate::path_manager::ManagerClient;
use crate::session::{
    CloseReason, Credentials, SessionControl, SessionDesc, SessionHandle, SessionId,
};
use crate::source::SourceFrameSender;
use crate::stats::{self, Stats};

/// Pause before closing a session whose authentication failure became
/// critical, to slow brute force.
const AUTH_FAILURE_PAUSE: Duration = Duration::from_secs(2);
/// Consecutive undecodable publisher frames tolerated before the session is
/// dropped.
const MAX_DECODE_FAILURES: u32 = 16;
/// Deadline for writing a frame to a reader's socket.  The bounded queue
/// catches most slow readers first; this catches a peer that stops
/// acknowledging entirely.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accept loop for one listener (plain or TLS).  Runs until `shutdown`
/// flips; sessions observe the same watch and close themselves.
pub async fn serve(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    manager: ManagerClient,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let scheme = if tls.is_some() { "wss" } else { "ws" };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "listener has no local address");
            return;
        }
    };
    info!(%local_addr, scheme, "ingress listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let tls = tls.clone();
                let manager = manager.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => {
                                connect_session(
                                    stream, peer, scheme, local_addr, manager, read_timeout,
                                    shutdown,
                                )
                                .await;
                            }
                            Err(e) => {
                                info!(%peer, error = %e, "TLS handshake failed");
                            }
                        },
                        None => {
                            connect_session(
                                stream, peer, scheme, local_addr, manager, read_timeout, shutdown,
                            )
                            .await;
                        }
                    }
                });
            }
        }
    }
    info!(%local_addr, "ingress listener stopped");
}

async fn connect_session<S>(
    stream: S,
    peer: SocketAddr,
    scheme: &'static str,
    local_addr: SocketAddr,
    manager: ManagerClient,
    read_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            info!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    let id: SessionId = Uuid::new_v4();
    let (handle, ctrl_rx) = SessionHandle::new(id, peer);
    stats::bump(&Stats::global().sessions_opened);
    info!(session_id = %id, %peer, "session opened");

    let session = IngressSession {
        ws,
        id,
        remote_addr: peer,
        requestor_base: format!("{scheme}://{local_addr}"),
        manager,
        read_timeout,
        handle,
        ctrl_rx,
        auth_failures: 0,
        state: SessionState::Connected,
        frame_rx: None,
        track_filter: None,
        decode_failures: 0,
    };
    session.run(shutdown).await;
    info!(session_id = %id, %peer, "session closed");
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

enum SessionState {
    Connected,
    PrePlay {
        path: AttachedPath,
    },
    Play {
        path: AttachedPath,
    },
    PreRecord {
        path: AttachedPath,
        frames: SourceFrameSender,
        track_count: usize,
    },
    Record {
        path: AttachedPath,
        frames: SourceFrameSender,
        track_count: usize,
    },
}

impl SessionState {
    fn attached(&self) -> Option<&AttachedPath> {
        match self {
            SessionState::Connected => None,
            SessionState::PrePlay { path }
            | SessionState::Play { path }
            | SessionState::PreRecord { path, .. }
            | SessionState::Record { path, .. } => Some(path),
        }
    }
}

enum Flow {
    Continue,
    Close,
}

struct IngressSession<S> {
    ws: WebSocketStream<S>,
    id: SessionId,
    remote_addr: SocketAddr,
    /// `ws://host:port` — combined with the request path to form the
    /// requestor URL for fallback resolution.
    requestor_base: String,
    manager: ManagerClient,
    read_timeout: Duration,
    handle: SessionHandle,
    ctrl_rx: mpsc::UnboundedReceiver<SessionControl>,
    auth_failures: u32,
    state: SessionState,
    /// Reader side: the bounded frame queue filled by the path's fan-out.
    frame_rx: Option<mpsc::Receiver<Frame>>,
    /// Reader side: track ids this session set up; `None` means all.
    track_filter: Option<HashSet<u8>>,
    decode_failures: u32,
}

impl<S> IngressSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self
            .send(WireMessage::Hello(Hello {
                session_id: self.id.to_string(),
            }))
            .await
            .is_err()
        {
            return;
        }

        loop {
            // reads are under deadline only outside the streaming states:
            // a playing reader mostly writes, and a recording publisher may
            // legitimately go quiet between frames
            let deadline = match self.state {
                SessionState::Play { .. } | SessionState::Record { .. } => None,
                _ => Some(self.read_timeout),
            };

            let flow = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.send_close_error(error_codes::TERMINATED, "shutting down").await;
                    Flow::Close
                }
                Some(SessionControl::Close(reason)) = self.ctrl_rx.recv() => {
                    self.on_forced_close(reason).await
                }
                Some(frame) = recv_frame(&mut self.frame_rx) => {
                    self.on_outbound_frame(frame).await
                }
                msg = recv_ws(&mut self.ws, deadline) => match msg {
                    RecvOutcome::Timeout => {
                        info!(session_id = %self.id, "read timeout");
                        Flow::Close
                    }
                    RecvOutcome::Closed => Flow::Close,
                    RecvOutcome::Failed(e) => {
                        info!(session_id = %self.id, error = %e, "websocket error");
                        Flow::Close
                    }
                    RecvOutcome::Frame(msg) => self.on_message(msg).await,
                },
            };
            if matches!(flow, Flow::Close) {
                break;
            }
        }

        if let Some(path) = self.state.attached() {
            path.remove().await;
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    async fn send(&mut self, msg: WireMessage) -> Result<(), ()> {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "serialize failed");
                return Err(());
            }
        };
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| ())
    }

    async fn send_error(&mut self, request_id: &str, error: &RelayError) {
        let _ = self
            .send(WireMessage::Error(ErrorMessage {
                request_id: request_id.to_owned(),
                code: error.wire_code().to_owned(),
                message: error.to_string(),
                retryable: error.retryable(),
                hint: error.hint().map(str::to_owned),
            }))
            .await;
    }

    async fn send_close_error(&mut self, code: &str, message: &str) {
        let _ = self
            .send(WireMessage::Error(ErrorMessage {
                request_id: String::new(),
                code: code.to_owned(),
                message: message.to_owned(),
                retryable: false,
                hint: None,
            }))
            .await;
    }

    async fn on_outbound_frame(&mut self, frame: Frame) -> Flow {
        if let Some(filter) = &self.track_filter
            && !filter.contains(&frame.track_id)
        {
            return Flow::Continue;
        }
        let send = self.ws.send(Message::Binary(frame.encode()));
        match tokio::time::timeout(WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => Flow::Continue,
            Ok(Err(_)) => Flow::Close,
            Err(_) => {
                info!(session_id = %self.id, "write timeout");
                Flow::Close
            }
        }
    }

    async fn on_forced_close(&mut self, reason: CloseReason) -> Flow {
        let (code, message) = match reason {
            CloseReason::PathTerminated => (error_codes::TERMINATED, "path closed"),
            CloseReason::PublisherDisplaced => {
                (error_codes::TERMINATED, "displaced by another publisher")
            }
            CloseReason::SourceNotReady => (error_codes::TERMINATED, "source no longer available"),
            CloseReason::ReaderTooSlow => (error_codes::TERMINATED, "reader too slow"),
        };
        debug!(session_id = %self.id, ?reason, "forced close");
        self.send_close_error(code, message).await;
        Flow::Close
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn on_message(&mut self, msg: Message) -> Flow {
        match msg {
            Message::Text(text) => match serde_json::from_str::<WireMessage>(&text) {
                Ok(msg) => self.on_control(msg).await,
                Err(e) => {
                    debug!(session_id = %self.id, error = %e, "bad control message");
                    self.send_close_error(error_codes::BAD_REQUEST, "invalid control message")
                        .await;
                    Flow::Close
                }
            },
            Message::Binary(buf) => self.on_inbound_frame(&buf).await,
            Message::Ping(data) => {
                let _ = self.ws.send(Message::Pong(data)).await;
                Flow::Continue
            }
            Message::Close(_) => Flow::Close,
            _ => Flow::Continue,
        }
    }

    async fn on_control(&mut self, msg: WireMessage) -> Flow {
        match msg {
            WireMessage::Describe(req) => self.on_describe(req).await,
            WireMessage::Announce(req) => self.on_announce(req).await,
            WireMessage::SetupPlay(req) => self.on_setup_play(req).await,
            WireMessage::Play(req) => self.on_play(req.request_id).await,
            WireMessage::Record(req) => self.on_record(req.request_id).await,
            WireMessage::Pause(req) => self.on_pause(req.request_id).await,
            WireMessage::Teardown(req) => self.on_teardown(req.request_id).await,
            other => {
                warn!(session_id = %self.id, ?other, "unexpected message kind");
                Flow::Continue
            }
        }
    }

    fn credentials(&self, user: Option<String>, pass: Option<String>) -> Credentials {
        Credentials {
            user,
            pass,
            prior_failures: self.auth_failures,
        }
    }

    fn desc(&self, path: &str) -> SessionDesc {
        SessionDesc {
            id: self.id,
            remote_addr: self.remote_addr,
            requestor_url: Some(format!("{}/{}", self.requestor_base, path)),
        }
    }

    /// Common error tail for describe/announce/setup: counts authentication
    /// failures and applies the anti-brute-force close on the critical one.
    async fn on_request_error(&mut self, request_id: &str, error: RelayError) -> Flow {
        self.send_error(request_id, &error).await;
        match error {
            RelayError::AuthNotCritical { .. } => {
                self.auth_failures += 1;
                Flow::Continue
            }
            RelayError::AuthCritical { .. } => {
                self.auth_failures += 1;
                tokio::time::sleep(AUTH_FAILURE_PAUSE).await;
                Flow::Close
            }
            RelayError::Terminated => Flow::Close,
            _ => Flow::Continue,
        }
    }

    async fn on_describe(&mut self, req: mtx_protocol::Describe) -> Flow {
        if !matches!(self.state, SessionState::Connected) {
            self.send_error(&req.request_id, &RelayError::InvalidState)
                .await;
            return Flow::Continue;
        }
        let desc = self.desc(&req.path);
        let credentials = self.credentials(req.user, req.pass);
        match self.manager.describe(&req.path, desc, credentials).await {
            Ok(DescribeAnswer::Tracks(tracks)) => {
                let _ = self
                    .send(WireMessage::DescribeOk(DescribeOk {
                        request_id: req.request_id,
                        tracks,
                    }))
                    .await;
                Flow::Continue
            }
            Ok(DescribeAnswer::Redirect(location)) => {
                let _ = self
                    .send(WireMessage::Redirect(Redirect {
                        request_id: req.request_id,
                        location,
                    }))
                    .await;
                Flow::Continue
            }
            Err(e) => self.on_request_error(&req.request_id, e).await,
        }
    }

    async fn on_announce(&mut self, req: mtx_protocol::Announce) -> Flow {
        if !matches!(self.state, SessionState::Connected) {
            self.send_error(&req.request_id, &RelayError::InvalidState)
                .await;
            return Flow::Continue;
        }
        if let Err(e) = validate_announced_tracks(&req.tracks) {
            self.send_error(&req.request_id, &e).await;
            return Flow::Continue;
        }
        let credentials = self.credentials(req.user, req.pass);
        let track_count = req.tracks.len();
        match self
            .manager
            .announce(&req.path, self.handle.clone(), credentials, req.tracks)
            .await
        {
            Ok(attachment) => {
                self.state = SessionState::PreRecord {
                    path: attachment.path,
                    frames: attachment.frames,
                    track_count,
                };
                let _ = self
                    .send(WireMessage::AnnounceOk(AnnounceOk {
                        request_id: req.request_id,
                    }))
                    .await;
                Flow::Continue
            }
            Err(e) => self.on_request_error(&req.request_id, e).await,
        }
    }

    async fn on_setup_play(&mut self, req: mtx_protocol::SetupPlay) -> Flow {
        if !matches!(self.state, SessionState::Connected) {
            self.send_error(&req.request_id, &RelayError::InvalidState)
                .await;
            return Flow::Continue;
        }
        let requestor_url = Some(format!("{}/{}", self.requestor_base, req.path));
        let credentials = self.credentials(req.user, req.pass);
        match self
            .manager
            .setup_play(
                &req.path,
                self.handle.clone(),
                requestor_url,
                credentials,
                req.track_ids.clone(),
            )
            .await
        {
            Ok(SetupPlayAnswer::Attached(attachment)) => {
                self.track_filter = if req.track_ids.is_empty() {
                    None
                } else {
                    Some(req.track_ids.iter().copied().collect())
                };
                self.frame_rx = Some(attachment.frame_rx);
                self.state = SessionState::PrePlay {
                    path: attachment.path,
                };
                let _ = self
                    .send(WireMessage::SetupOk(SetupOk {
                        request_id: req.request_id,
                        tracks: attachment.tracks,
                    }))
                    .await;
                Flow::Continue
            }
            Ok(SetupPlayAnswer::Redirect(location)) => {
                let _ = self
                    .send(WireMessage::Redirect(Redirect {
                        request_id: req.request_id,
                        location,
                    }))
                    .await;
                Flow::Continue
            }
            Err(e) => self.on_request_error(&req.request_id, e).await,
        }
    }

    async fn on_play(&mut self, request_id: String) -> Flow {
        let SessionState::PrePlay { path } = &self.state else {
            self.send_error(&request_id, &RelayError::InvalidState).await;
            return Flow::Continue;
        };
        match path.play().await {
            Ok(()) => {
                let path = path.clone();
                self.state = SessionState::Play { path };
                let _ = self.send(WireMessage::Ok(Ok_ { request_id })).await;
                Flow::Continue
            }
            Err(e) => self.on_request_error(&request_id, e).await,
        }
    }

    async fn on_record(&mut self, request_id: String) -> Flow {
        let SessionState::PreRecord {
            path,
            frames,
            track_count,
        } = &self.state
        else {
            self.send_error(&request_id, &RelayError::InvalidState).await;
            return Flow::Continue;
        };
        match path.record().await {
            Ok(()) => {
                self.state = SessionState::Record {
                    path: path.clone(),
                    frames: frames.clone(),
                    track_count: *track_count,
                };
                let _ = self.send(WireMessage::Ok(Ok_ { request_id })).await;
                Flow::Continue
            }
            Err(e) => self.on_request_error(&request_id, e).await,
        }
    }

    async fn on_pause(&mut self, request_id: String) -> Flow {
        let result = match &self.state {
            SessionState::Play { path } | SessionState::Record { path, .. } => {
                path.pause().await.map(|()| path.clone())
            }
            _ => {
                self.send_error(&request_id, &RelayError::InvalidState).await;
                return Flow::Continue;
            }
        };
        match result {
            Ok(path) => {
                self.state = match std::mem::replace(&mut self.state, SessionState::Connected) {
                    SessionState::Play { .. } => SessionState::PrePlay { path },
                    SessionState::Record {
                        frames,
                        track_count,
                        ..
                    } => SessionState::PreRecord {
                        path,
                        frames,
                        track_count,
                    },
                    other => other,
                };
                let _ = self.send(WireMessage::Ok(Ok_ { request_id })).await;
                Flow::Continue
            }
            Err(e) => self.on_request_error(&request_id, e).await,
        }
    }

    async fn on_teardown(&mut self, request_id: String) -> Flow {
        if let Some(path) = self.state.attached() {
            path.remove().await;
        }
        self.state = SessionState::Connected;
        self.frame_rx = None;
        self.track_filter = None;
        let _ = self.send(WireMessage::Ok(Ok_ { request_id })).await;
        Flow::Continue
    }

    async fn on_inbound_frame(&mut self, buf: &bytes::Bytes) -> Flow {
        let SessionState::Record {
            frames,
            track_count,
            ..
        } = &self.state
        else {
            // frames outside the record state are dropped
            return Flow::Continue;
        };
        match Frame::decode(buf) {
            Ok(frame) => {
                if usize::from(frame.track_id) >= *track_count {
                    debug!(session_id = %self.id, track = frame.track_id, "frame for unknown track");
                    return Flow::Continue;
                }
                self.decode_failures = 0;
                match frames.send(frame).await {
                    Ok(()) => Flow::Continue,
                    Err(_) => {
                        self.send_close_error(error_codes::TERMINATED, "path closed").await;
                        Flow::Close
                    }
                }
            }
            Err(e) => {
                self.decode_failures += 1;
                if self.decode_failures >= MAX_DECODE_FAILURES {
                    self.send_close_error(error_codes::BAD_REQUEST, "undecodable frames")
                        .await;
                    return Flow::Close;
                }
                debug!(session_id = %self.id, error = %e, "skipping undecodable frame");
                Flow::Continue
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Select helpers
// ---------------------------------------------------------------------------

enum RecvOutcome {
    Frame(Message),
    Timeout,
    Closed,
    Failed(tokio_tungstenite::tungstenite::Error),
}

async fn recv_ws<S>(ws: &mut WebSocketStream<S>, deadline: Option<Duration>) -> RecvOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let next = ws.next();
    let msg = match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, next).await {
            Ok(msg) => msg,
            Err(_) => return RecvOutcome::Timeout,
        },
        None => next.await,
    };
    match msg {
        None => RecvOutcome::Closed,
        Some(Err(e)) => RecvOutcome::Failed(e),
        Some(Ok(msg)) => RecvOutcome::Frame(msg),
    }
}

/// Pending forever while the session has no reader queue.
async fn recv_frame(rx: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn validate_announced_tracks(tracks: &[TrackInfo]) -> Result<(), RelayError> {
    for (i, track) in tracks.iter().enumerate() {
        if usize::from(track.id) != i {
            return Err(RelayError::InvalidTrack(track.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: u8) -> TrackInfo {
        TrackInfo {
            id,
            media: "video".to_owned(),
            codec: "H264".to_owned(),
            clock_rate: 90_000,
            parameters: None,
        }
    }

    #[test]
    fn announced_tracks_must_be_dense_from_zero() {
        assert!(validate_announced_tracks(&[]).is_ok());
        assert!(validate_announced_tracks(&[track(0), track(1)]).is_ok());
        assert_eq!(
            validate_announced_tracks(&[track(1)]),
            Err(RelayError::InvalidTrack(1))
        );
        assert_eq!(
            validate_announced_tracks(&[track(0), track(2)]),
            Err(RelayError::InvalidTrack(2))
        );
    }
}
