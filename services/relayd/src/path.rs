//! The path actor: one named rendezvous point binding at most one source to
//! N readers.
//!
//! A path is a single-writer actor.  A dedicated task selects over the
//! path's inbound channels — client requests forwarded by the manager,
//! requests from attached sessions, events from the current source, the
//! terminate watch and the four timers — and mutates path state serially.
//! Every cross-task call is a request value carrying a oneshot reply; the
//! actor replies before processing the next event, and keeps replying
//! (`Terminated`) while draining its channels during teardown.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use mtx_protocol::{Frame, TrackInfo};

use crate::conf::{ConfSource, PathConf};
use crate::errors::RelayError;
use crate::reader_set::ReaderSet;
use crate::runner::{Runner, RunnerSpec};
use crate::session::{CloseReason, SessionDesc, SessionHandle, SessionId};
use crate::source::{ExternalSource, SourceEvent, SourceFrameSender};
use crate::stats::{self, Stats};

const REQUEST_QUEUE: usize = 64;
const SOURCE_EVENT_QUEUE: usize = 1024;

static NEXT_PATH_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum DescribeAnswer {
    Tracks(Vec<TrackInfo>),
    Redirect(String),
}

#[derive(Debug)]
pub enum SetupPlayAnswer {
    Attached(ReaderAttachment),
    Redirect(String),
}

/// Everything a publisher session needs after a successful announce.
#[derive(Debug)]
pub struct PublisherAttachment {
    pub path: AttachedPath,
    pub frames: SourceFrameSender,
}

/// Everything a reader session needs after a successful setup.
#[derive(Debug)]
pub struct ReaderAttachment {
    pub path: AttachedPath,
    pub tracks: Vec<TrackInfo>,
    pub frame_rx: mpsc::Receiver<Frame>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub(crate) enum PathClientRequest {
    Describe {
        session: SessionDesc,
        reply: oneshot::Sender<Result<DescribeAnswer, RelayError>>,
    },
    Announce {
        session: SessionHandle,
        tracks: Vec<TrackInfo>,
        reply: oneshot::Sender<Result<PublisherAttachment, RelayError>>,
    },
    SetupPlay {
        session: SessionHandle,
        requestor_url: Option<String>,
        track_ids: Vec<u8>,
        reply: oneshot::Sender<Result<SetupPlayAnswer, RelayError>>,
    },
}

enum PathSessionRequest {
    Play {
        id: SessionId,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Record {
        id: SessionId,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Pause {
        id: SessionId,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Remove {
        id: SessionId,
        reply: oneshot::Sender<()>,
    },
}

/// Sent to the manager right before the actor finishes.
#[derive(Debug)]
pub(crate) struct PathClosedNotice {
    pub name: String,
    pub id: u64,
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// The manager's handle to a running path actor.
pub(crate) struct PathHandle {
    pub name: Arc<str>,
    pub id: u64,
    request_tx: mpsc::Sender<PathClientRequest>,
    terminate: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PathHandle {
    /// Enqueue a client request.  The path replies on the request's own
    /// oneshot, so the caller never waits on this path's pace.  Gives the
    /// request back when the actor is already gone.
    pub async fn forward(&self, request: PathClientRequest) -> Result<(), PathClientRequest> {
        self.request_tx.send(request).await.map_err(|e| e.0)
    }

    /// Ask the actor to tear down and wait until it has.
    pub async fn terminate(self) {
        let PathHandle {
            name,
            request_tx,
            terminate,
            task,
            ..
        } = self;
        debug!(path = %name, "terminating path");
        drop(request_tx);
        let _ = terminate.send(true);
        let _ = task.await;
    }
}

/// A session's handle to the path it is attached to.
#[derive(Debug, Clone)]
pub struct AttachedPath {
    name: Arc<str>,
    session_id: SessionId,
    tx: mpsc::Sender<PathSessionRequest>,
}

impl AttachedPath {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), RelayError>>) -> PathSessionRequest,
    ) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }

    pub async fn play(&self) -> Result<(), RelayError> {
        let id = self.session_id;
        self.request(|reply| PathSessionRequest::Play { id, reply })
            .await
    }

    pub async fn record(&self) -> Result<(), RelayError> {
        let id = self.session_id;
        self.request(|reply| PathSessionRequest::Record { id, reply })
            .await
    }

    pub async fn pause(&self) -> Result<(), RelayError> {
        let id = self.session_id;
        self.request(|reply| PathSessionRequest::Pause { id, reply })
            .await
    }

    /// Detach the session.  Always succeeds from the caller's point of view;
    /// a path that is already gone has nothing left to detach from.
    pub async fn remove(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PathSessionRequest::Remove {
                id: self.session_id,
                reply,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// A timer slot that is always present in the select set.  Disarmed slots
/// hold a far-future sleep as a placeholder so the select arm stays valid.
struct TimerSlot {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

fn far_future() -> Instant {
    // ~30 years; effectively never inside one process lifetime
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

impl TimerSlot {
    fn disarmed() -> Self {
        TimerSlot {
            sleep: Box::pin(tokio::time::sleep_until(far_future())),
            armed: false,
        }
    }

    fn arm(&mut self, after: Duration) {
        self.sleep = Box::pin(tokio::time::sleep_until(Instant::now() + after));
        self.armed = true;
    }

    fn disarm(&mut self) {
        if self.armed {
            self.sleep = Box::pin(tokio::time::sleep_until(far_future()));
            self.armed = false;
        }
    }
}

struct PathTimers {
    /// Fails pending describes/setups when a starting source never readies.
    describe: TimerSlot,
    /// Closes an idle on-demand external source.
    source_close: TimerSlot,
    /// Closes an idle on-demand command.
    command_close: TimerSlot,
    /// Closes an empty regex-derived path (zero delay).
    path_close: TimerSlot,
}

impl PathTimers {
    fn new() -> Self {
        PathTimers {
            describe: TimerSlot::disarmed(),
            source_close: TimerSlot::disarmed(),
            command_close: TimerSlot::disarmed(),
            path_close: TimerSlot::disarmed(),
        }
    }
}

// ---------------------------------------------------------------------------
// Actor state
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Source {
    None,
    Publisher { id: SessionId },
    External { handle: ExternalSource },
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    NotReady,
    WaitingDescribe,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    PrePlay,
    Play,
    PreRecord,
    Record,
}

struct PathClient {
    session: SessionHandle,
    state: ClientState,
    /// Readers only: the sending side of the session's frame queue.
    frame_tx: Option<mpsc::Sender<Frame>>,
    /// Readers only: `run_on_read` while in play.
    on_read: Option<Runner>,
}

struct SetupPlayWaiter {
    session: SessionHandle,
    track_ids: Vec<u8>,
    reply: oneshot::Sender<Result<SetupPlayAnswer, RelayError>>,
}

/// Static facts about the path, fixed at spawn.
pub(crate) struct PathOpts {
    pub name: String,
    pub conf_name: String,
    pub conf: PathConf,
    pub is_regex_derived: bool,
    /// Exported to launched commands as `MTX_PORT`.
    pub ingress_port: u16,
    pub reader_queue_size: usize,
    pub on_close: mpsc::UnboundedSender<PathClosedNotice>,
}

struct PathActor {
    name: Arc<str>,
    id: u64,
    conf: PathConf,
    is_regex_derived: bool,
    ingress_port: u16,
    reader_queue_size: usize,

    source: Source,
    source_state: SourceState,
    source_tracks: Option<Vec<TrackInfo>>,
    /// Announced by the current publisher; becomes `source_tracks` on record.
    pending_publisher_tracks: Option<Vec<TrackInfo>>,
    /// Bumped whenever the source changes; events from older generations are
    /// discarded.
    source_generation: u64,

    clients: HashMap<SessionId, PathClient>,
    reader_set: ReaderSet,
    describe_waiters: Vec<oneshot::Sender<Result<DescribeAnswer, RelayError>>>,
    setup_play_waiters: Vec<SetupPlayWaiter>,

    on_init: Option<Runner>,
    on_demand: Option<Runner>,
    on_publish: Option<Runner>,

    source_events_tx: mpsc::Sender<SourceEvent>,
    session_tx: mpsc::Sender<PathSessionRequest>,
    on_close: mpsc::UnboundedSender<PathClosedNotice>,

    timers: PathTimers,
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

pub(crate) fn spawn(opts: PathOpts) -> PathHandle {
    let id = NEXT_PATH_ID.fetch_add(1, Ordering::Relaxed);
    let name: Arc<str> = Arc::from(opts.name.as_str());
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
    let (session_tx, session_rx) = mpsc::channel(REQUEST_QUEUE);
    let (source_events_tx, source_events_rx) = mpsc::channel(SOURCE_EVENT_QUEUE);
    let (terminate, terminate_rx) = watch::channel(false);

    let mut actor = PathActor {
        name: name.clone(),
        id,
        conf: opts.conf,
        is_regex_derived: opts.is_regex_derived,
        ingress_port: opts.ingress_port,
        reader_queue_size: opts.reader_queue_size,
        source: Source::None,
        source_state: SourceState::NotReady,
        source_tracks: None,
        pending_publisher_tracks: None,
        source_generation: 0,
        clients: HashMap::new(),
        reader_set: ReaderSet::new(),
        describe_waiters: Vec::new(),
        setup_play_waiters: Vec::new(),
        on_init: None,
        on_demand: None,
        on_publish: None,
        source_events_tx,
        session_tx,
        on_close: opts.on_close,
        timers: PathTimers::new(),
    };

    info!(path = %name, conf = %opts.conf_name, "path created");
    stats::bump(&Stats::global().paths_created);

    actor.startup();
    let task = tokio::spawn(actor.run(request_rx, session_rx, source_events_rx, terminate_rx));

    PathHandle {
        name,
        id,
        request_tx,
        terminate,
        task,
    }
}

impl PathActor {
    fn runner_spec(&self, command: &str, restart: bool) -> RunnerSpec {
        RunnerSpec::new(
            command.to_owned(),
            restart,
            self.name.to_string(),
            self.ingress_port,
        )
    }

    fn startup(&mut self) {
        if let Some(cmd) = self.conf.run_on_init.clone() {
            let spec = self.runner_spec(&cmd, self.conf.run_on_init_restart);
            self.on_init = Some(Runner::spawn(spec));
        }
        match &self.conf.source {
            ConfSource::Redirect => {
                self.source = Source::Redirect;
            }
            ConfSource::External(url) if !self.conf.source_on_demand => {
                let url = url.clone();
                self.start_external_source(&url);
            }
            _ => {}
        }
    }

    fn start_external_source(&mut self, url: &str) {
        self.source_generation += 1;
        let handle = ExternalSource::spawn(
            url.to_owned(),
            self.source_events_tx.clone(),
            self.source_generation,
        );
        self.source = Source::External { handle };
        debug!(path = %self.name, %url, "external source started");
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<PathClientRequest>,
        mut session_rx: mpsc::Receiver<PathSessionRequest>,
        mut source_rx: mpsc::Receiver<SourceEvent>,
        mut terminate_rx: watch::Receiver<bool>,
    ) {
        loop {
            let mut close_path = false;
            tokio::select! {
                biased;
                _ = terminate_rx.changed() => {
                    debug!(path = %self.name, "terminate requested");
                    break;
                }
                Some(event) = source_rx.recv() => self.handle_source_event(event).await,
                Some(request) = request_rx.recv() => self.handle_client_request(request).await,
                Some(request) = session_rx.recv() => self.handle_session_request(request).await,
                _ = &mut self.timers.describe.sleep, if self.timers.describe.armed => {
                    self.on_describe_timeout();
                }
                _ = &mut self.timers.source_close.sleep, if self.timers.source_close.armed => {
                    self.on_source_close_timeout().await;
                }
                _ = &mut self.timers.command_close.sleep, if self.timers.command_close.armed => {
                    self.on_command_close_timeout().await;
                }
                _ = &mut self.timers.path_close.sleep, if self.timers.path_close.armed => {
                    close_path = true;
                }
            }
            if close_path {
                debug!(path = %self.name, "empty path closing");
                break;
            }
            self.reschedule_close_timers();
        }

        self.teardown().await;

        let _ = self.on_close.send(PathClosedNotice {
            name: self.name.to_string(),
            id: self.id,
        });

        // Drain: every request still in flight gets a terminated reply.
        request_rx.close();
        session_rx.close();
        source_rx.close();
        while let Some(request) = request_rx.recv().await {
            reply_client_terminated(request);
        }
        while let Some(request) = session_rx.recv().await {
            reply_session_terminated(request);
        }
        info!(path = %self.name, "path closed");
    }

    // -----------------------------------------------------------------------
    // Client requests (via manager)
    // -----------------------------------------------------------------------

    async fn handle_client_request(&mut self, request: PathClientRequest) {
        match request {
            PathClientRequest::Describe { session, reply } => {
                match self.on_describe(&session) {
                    Disposition::Reply(answer) => {
                        let _ = reply.send(answer);
                    }
                    Disposition::Wait => self.describe_waiters.push(reply),
                }
            }
            PathClientRequest::Announce {
                session,
                tracks,
                reply,
            } => {
                let result = self.on_announce(session, tracks).await;
                let _ = reply.send(result);
            }
            PathClientRequest::SetupPlay {
                session,
                requestor_url,
                track_ids,
                reply,
            } => {
                match self.on_setup_play(&session, requestor_url.as_deref(), &track_ids) {
                    Disposition::Reply(answer) => {
                        let _ = reply.send(answer);
                    }
                    Disposition::Wait => self.setup_play_waiters.push(SetupPlayWaiter {
                        session,
                        track_ids,
                        reply,
                    }),
                }
            }
        }
    }

    fn on_describe(&mut self, session: &SessionDesc) -> Disposition<DescribeAnswer> {
        if self.clients.contains_key(&session.id) {
            return Disposition::Reply(Err(RelayError::AlreadySubscribed));
        }

        self.start_on_demand();

        if matches!(self.source, Source::Redirect)
            && let Some(target) = self.conf.source_redirect.clone()
        {
            return Disposition::Reply(Ok(DescribeAnswer::Redirect(target)));
        }

        match self.source_state {
            SourceState::Ready => Disposition::Reply(Ok(DescribeAnswer::Tracks(
                self.source_tracks.clone().unwrap_or_default(),
            ))),
            SourceState::WaitingDescribe => Disposition::Wait,
            SourceState::NotReady => match self.conf.fallback.clone() {
                Some(fallback) => Disposition::Reply(
                    resolve_fallback(&fallback, session.requestor_url.as_deref())
                        .map(DescribeAnswer::Redirect),
                ),
                None => Disposition::Reply(Err(RelayError::NoOnePublishing(
                    self.name.to_string(),
                ))),
            },
        }
    }

    async fn on_announce(
        &mut self,
        session: SessionHandle,
        tracks: Vec<TrackInfo>,
    ) -> Result<PublisherAttachment, RelayError> {
        if self.clients.contains_key(&session.id) {
            return Err(RelayError::AlreadySubscribed);
        }
        if self.conf.has_external_source() || self.conf.is_redirect() {
            return Err(RelayError::AlreadyPublishing);
        }

        if let Source::Publisher { id: current } = self.source {
            if self.conf.disable_publisher_override {
                return Err(RelayError::AlreadyPublishing);
            }
            info!(path = %self.name, displaced = %current, "publisher override");
            self.detach_source_session(current, CloseReason::PublisherDisplaced)
                .await;
        }

        let id = session.id;
        self.source_generation += 1;
        self.source = Source::Publisher { id };
        self.pending_publisher_tracks = Some(tracks);
        self.clients.insert(
            id,
            PathClient {
                session,
                state: ClientState::PreRecord,
                frame_tx: None,
                on_read: None,
            },
        );
        debug!(path = %self.name, session_id = %id, "publisher attached");

        Ok(PublisherAttachment {
            path: self.attached_path(id),
            frames: SourceFrameSender::new(self.source_generation, self.source_events_tx.clone()),
        })
    }

    fn on_setup_play(
        &mut self,
        session: &SessionHandle,
        requestor_url: Option<&str>,
        track_ids: &[u8],
    ) -> Disposition<SetupPlayAnswer> {
        if self.clients.contains_key(&session.id) {
            return Disposition::Reply(Err(RelayError::AlreadySubscribed));
        }

        self.start_on_demand();

        if matches!(self.source, Source::Redirect)
            && let Some(target) = self.conf.source_redirect.clone()
        {
            return Disposition::Reply(Ok(SetupPlayAnswer::Redirect(target)));
        }

        match self.source_state {
            SourceState::Ready => Disposition::Reply(
                self.attach_reader(session.clone(), track_ids)
                    .map(SetupPlayAnswer::Attached),
            ),
            SourceState::WaitingDescribe => Disposition::Wait,
            SourceState::NotReady => match self.conf.fallback.clone() {
                Some(fallback) => Disposition::Reply(
                    resolve_fallback(&fallback, requestor_url).map(SetupPlayAnswer::Redirect),
                ),
                None => Disposition::Reply(Err(RelayError::NoOnePublishing(
                    self.name.to_string(),
                ))),
            },
        }
    }

    /// The on-demand kick: make sure whatever can produce a source for this
    /// path is starting, and arm the describe timer on the transition into
    /// the waiting state.
    fn start_on_demand(&mut self) {
        let mut start_timeout: Option<Duration> = None;

        let start_external = self.conf.source_on_demand && matches!(self.source, Source::None);
        if start_external
            && let ConfSource::External(url) = &self.conf.source
        {
            let url = url.clone();
            self.start_external_source(&url);
            start_timeout = Some(self.conf.source_on_demand_start_timeout);
        }

        if self.on_demand.is_none()
            && let Some(cmd) = self.conf.run_on_demand.clone()
        {
            let spec = self.runner_spec(&cmd, self.conf.run_on_demand_restart);
            self.on_demand = Some(Runner::spawn(spec));
            debug!(path = %self.name, "on-demand command started");
            start_timeout.get_or_insert(self.conf.run_on_demand_start_timeout);
        }

        if let Some(timeout) = start_timeout
            && self.source_state == SourceState::NotReady
        {
            self.source_state = SourceState::WaitingDescribe;
            self.timers.describe.arm(timeout);
        }
    }

    // -----------------------------------------------------------------------
    // Session requests
    // -----------------------------------------------------------------------

    async fn handle_session_request(&mut self, request: PathSessionRequest) {
        match request {
            PathSessionRequest::Play { id, reply } => {
                let _ = reply.send(self.on_play(id));
            }
            PathSessionRequest::Record { id, reply } => {
                let _ = reply.send(self.on_record(id));
            }
            PathSessionRequest::Pause { id, reply } => {
                let result = self.on_pause(id).await;
                let _ = reply.send(result);
            }
            PathSessionRequest::Remove { id, reply } => {
                self.on_remove(id).await;
                let _ = reply.send(());
            }
        }
    }

    fn on_play(&mut self, id: SessionId) -> Result<(), RelayError> {
        let client = self.clients.get_mut(&id).ok_or(RelayError::Terminated)?;
        if client.state != ClientState::PrePlay {
            return Err(RelayError::InvalidState);
        }
        let frame_tx = client.frame_tx.clone().ok_or(RelayError::InvalidState)?;
        client.state = ClientState::Play;
        let session = client.session.clone();
        if let Some(cmd) = self.conf.run_on_read.clone() {
            let spec = self.runner_spec(&cmd, self.conf.run_on_read_restart);
            if let Some(client) = self.clients.get_mut(&id) {
                client.on_read = Some(Runner::spawn(spec));
            }
        }
        self.reader_set.add(session, frame_tx);
        debug!(path = %self.name, session_id = %id, "reader playing");
        Ok(())
    }

    fn on_record(&mut self, id: SessionId) -> Result<(), RelayError> {
        if !matches!(self.source, Source::Publisher { id: source_id } if source_id == id) {
            return Err(RelayError::InvalidState);
        }
        let client = self.clients.get_mut(&id).ok_or(RelayError::Terminated)?;
        if client.state != ClientState::PreRecord {
            return Err(RelayError::InvalidState);
        }
        client.state = ClientState::Record;
        let tracks = self.pending_publisher_tracks.clone().unwrap_or_default();
        self.set_source_ready(tracks);
        debug!(path = %self.name, session_id = %id, "publisher recording");
        Ok(())
    }

    async fn on_pause(&mut self, id: SessionId) -> Result<(), RelayError> {
        let client = self.clients.get_mut(&id).ok_or(RelayError::Terminated)?;
        match client.state {
            ClientState::Play => {
                client.state = ClientState::PrePlay;
                let on_read = client.on_read.take();
                self.reader_set.remove(id);
                if let Some(runner) = on_read {
                    runner.close().await;
                }
                Ok(())
            }
            ClientState::Record => {
                client.state = ClientState::PreRecord;
                self.set_source_not_ready().await;
                Ok(())
            }
            _ => Err(RelayError::InvalidState),
        }
    }

    async fn on_remove(&mut self, id: SessionId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        if client.state == ClientState::Play {
            self.reader_set.remove(id);
        }
        if let Some(runner) = client.on_read {
            runner.close().await;
        }

        if matches!(self.source, Source::Publisher { id: source_id } if source_id == id) {
            self.source = Source::None;
            self.source_generation += 1;
            self.pending_publisher_tracks = None;
            self.set_source_not_ready().await;
        }
        debug!(path = %self.name, session_id = %id, "session detached");
    }

    /// Remove the session currently acting as source without waiting for its
    /// own remove request (publisher override).
    async fn detach_source_session(&mut self, id: SessionId, reason: CloseReason) {
        if let Some(client) = self.clients.remove(&id) {
            client.session.close(reason);
        }
        self.source = Source::None;
        self.source_generation += 1;
        self.pending_publisher_tracks = None;
        if self.source_state == SourceState::Ready {
            self.set_source_not_ready().await;
        }
    }

    // -----------------------------------------------------------------------
    // Source state transitions
    // -----------------------------------------------------------------------

    async fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Ready { generation, tracks } => {
                if generation != self.source_generation {
                    return;
                }
                self.set_source_ready(tracks);
            }
            SourceEvent::NotReady { generation } => {
                if generation != self.source_generation {
                    return;
                }
                // the external source keeps retrying on its own; the path
                // drops its readers and waits for the next ready event
                self.set_source_not_ready().await;
            }
            SourceEvent::Frame { generation, frame } => {
                if generation != self.source_generation
                    || self.source_state != SourceState::Ready
                {
                    return;
                }
                self.reader_set.forward_frame(&frame);
            }
        }
    }

    fn set_source_ready(&mut self, tracks: Vec<TrackInfo>) {
        self.source_state = SourceState::Ready;
        self.source_tracks = Some(tracks.clone());
        self.timers.describe.disarm();

        for reply in self.describe_waiters.drain(..) {
            let _ = reply.send(Ok(DescribeAnswer::Tracks(tracks.clone())));
        }
        let waiters: Vec<SetupPlayWaiter> = self.setup_play_waiters.drain(..).collect();
        for waiter in waiters {
            let result = self
                .attach_reader(waiter.session, &waiter.track_ids)
                .map(SetupPlayAnswer::Attached);
            let _ = waiter.reply.send(result);
        }

        if matches!(self.source, Source::Publisher { .. })
            && self.on_publish.is_none()
            && let Some(cmd) = self.conf.run_on_publish.clone()
        {
            let spec = self.runner_spec(&cmd, self.conf.run_on_publish_restart);
            self.on_publish = Some(Runner::spawn(spec));
        }
        info!(path = %self.name, "source ready");
    }

    async fn set_source_not_ready(&mut self) {
        self.source_state = SourceState::NotReady;
        self.source_tracks = None;
        self.timers.describe.disarm();
        self.fail_waiters(RelayError::NoOnePublishing(self.name.to_string()));
        self.close_all_readers(CloseReason::SourceNotReady).await;
        if let Some(runner) = self.on_publish.take() {
            runner.close().await;
        }
        info!(path = %self.name, "source not ready");
    }

    fn fail_waiters(&mut self, error: RelayError) {
        for reply in self.describe_waiters.drain(..) {
            let _ = reply.send(Err(error.clone()));
        }
        for waiter in self.setup_play_waiters.drain(..) {
            let _ = waiter.reply.send(Err(error.clone()));
        }
    }

    /// Detach every non-source client and tell its session to close.
    async fn close_all_readers(&mut self, reason: CloseReason) {
        let source_id = match self.source {
            Source::Publisher { id } => Some(id),
            _ => None,
        };
        let ids: Vec<SessionId> = self
            .clients
            .keys()
            .copied()
            .filter(|id| Some(*id) != source_id)
            .collect();
        for id in ids {
            if let Some(client) = self.clients.remove(&id) {
                self.reader_set.remove(id);
                if let Some(runner) = client.on_read {
                    runner.close().await;
                }
                client.session.close(reason);
            }
        }
    }

    fn attach_reader(
        &mut self,
        session: SessionHandle,
        track_ids: &[u8],
    ) -> Result<ReaderAttachment, RelayError> {
        let all_tracks = self.source_tracks.clone().unwrap_or_default();
        let tracks = if track_ids.is_empty() {
            all_tracks
        } else {
            let mut selected = Vec::with_capacity(track_ids.len());
            for &id in track_ids {
                let track = all_tracks
                    .iter()
                    .find(|t| t.id == id)
                    .ok_or(RelayError::InvalidTrack(id))?;
                selected.push(track.clone());
            }
            selected
        };

        let id = session.id;
        let (frame_tx, frame_rx) = mpsc::channel(self.reader_queue_size);
        self.clients.insert(
            id,
            PathClient {
                session,
                state: ClientState::PrePlay,
                frame_tx: Some(frame_tx),
                on_read: None,
            },
        );
        debug!(path = %self.name, session_id = %id, "reader attached");
        Ok(ReaderAttachment {
            path: self.attached_path(id),
            tracks,
            frame_rx,
        })
    }

    fn attached_path(&self, session_id: SessionId) -> AttachedPath {
        AttachedPath {
            name: self.name.clone(),
            session_id,
            tx: self.session_tx.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn on_describe_timeout(&mut self) {
        warn!(path = %self.name, "source did not become ready in time");
        self.timers.describe.disarm();
        self.source_state = SourceState::NotReady;
        self.fail_waiters(RelayError::PublisherTimeout(self.name.to_string()));
    }

    async fn on_source_close_timeout(&mut self) {
        self.timers.source_close.disarm();
        if let Source::External { handle } = std::mem::replace(&mut self.source, Source::None) {
            info!(path = %self.name, "closing idle on-demand source");
            self.source_generation += 1;
            self.source_state = SourceState::NotReady;
            self.source_tracks = None;
            handle.close().await;
        }
    }

    async fn on_command_close_timeout(&mut self) {
        self.timers.command_close.disarm();
        if let Some(runner) = self.on_demand.take() {
            info!(path = %self.name, "closing idle on-demand command");
            runner.close().await;
        }
    }

    fn has_waiters(&self) -> bool {
        !self.describe_waiters.is_empty() || !self.setup_play_waiters.is_empty()
    }

    fn idle(&self) -> bool {
        self.clients.is_empty() && !self.has_waiters()
    }

    /// Re-evaluate the three close timers after a state-changing event.
    /// An armed timer whose condition still holds keeps its deadline.
    fn reschedule_close_timers(&mut self) {
        let source_close_wanted = self.conf.source_on_demand
            && matches!(self.source, Source::External { .. })
            && self.idle()
            && self.source_state != SourceState::WaitingDescribe;
        if source_close_wanted {
            if !self.timers.source_close.armed {
                self.timers
                    .source_close
                    .arm(self.conf.source_on_demand_close_after);
            }
        } else {
            self.timers.source_close.disarm();
        }

        let command_close_wanted = self.on_demand.is_some()
            && self.idle()
            && self.source_state != SourceState::WaitingDescribe;
        if command_close_wanted {
            if !self.timers.command_close.armed {
                self.timers
                    .command_close
                    .arm(self.conf.run_on_demand_close_after);
            }
        } else {
            self.timers.command_close.disarm();
        }

        let path_close_wanted = self.is_regex_derived
            && self.idle()
            && matches!(self.source, Source::None | Source::Redirect)
            && self.on_demand.is_none();
        if path_close_wanted {
            if !self.timers.path_close.armed {
                self.timers.path_close.arm(Duration::ZERO);
            }
        } else {
            self.timers.path_close.disarm();
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    async fn teardown(&mut self) {
        self.timers.describe.disarm();
        self.timers.source_close.disarm();
        self.timers.command_close.disarm();
        self.timers.path_close.disarm();

        if let Some(runner) = self.on_init.take() {
            runner.close().await;
        }
        if let Source::External { handle } = std::mem::replace(&mut self.source, Source::None) {
            handle.close().await;
        }
        if let Some(runner) = self.on_demand.take() {
            runner.close().await;
        }
        if let Some(runner) = self.on_publish.take() {
            runner.close().await;
        }

        self.fail_waiters(RelayError::Terminated);

        let ids: Vec<SessionId> = self.clients.keys().copied().collect();
        for id in ids {
            if let Some(client) = self.clients.remove(&id) {
                self.reader_set.remove(id);
                if let Some(runner) = client.on_read {
                    runner.close().await;
                }
                client.session.close(CloseReason::PathTerminated);
            }
        }
        self.source_tracks = None;
        self.source_state = SourceState::NotReady;
    }
}

enum Disposition<T> {
    Reply(Result<T, RelayError>),
    Wait,
}

pub(crate) fn reply_client_terminated(request: PathClientRequest) {
    match request {
        PathClientRequest::Describe { reply, .. } => {
            let _ = reply.send(Err(RelayError::Terminated));
        }
        PathClientRequest::Announce { reply, .. } => {
            let _ = reply.send(Err(RelayError::Terminated));
        }
        PathClientRequest::SetupPlay { reply, .. } => {
            let _ = reply.send(Err(RelayError::Terminated));
        }
    }
}

fn reply_session_terminated(request: PathSessionRequest) {
    match request {
        PathSessionRequest::Play { reply, .. }
        | PathSessionRequest::Record { reply, .. }
        | PathSessionRequest::Pause { reply, .. } => {
            let _ = reply.send(Err(RelayError::Terminated));
        }
        PathSessionRequest::Remove { reply, .. } => {
            let _ = reply.send(());
        }
    }
}

/// Resolve a configured fallback against the URL the requestor used.
///
/// Absolute fallbacks pass through.  A `/path` fallback keeps the
/// requestor's scheme and authority and replaces the path; without a usable
/// requestor URL the request is malformed.
fn resolve_fallback(fallback: &str, requestor_url: Option<&str>) -> Result<String, RelayError> {
    if fallback.starts_with("ws://") || fallback.starts_with("wss://") {
        return Ok(fallback.to_owned());
    }
    let url = requestor_url.ok_or(RelayError::FallbackUnresolvable)?;
    let (scheme, rest) = url
        .strip_prefix("ws://")
        .map(|rest| ("ws://", rest))
        .or_else(|| url.strip_prefix("wss://").map(|rest| ("wss://", rest)))
        .ok_or(RelayError::FallbackUnresolvable)?;
    let authority = rest.split('/').next().unwrap_or("");
    if authority.is_empty() {
        return Err(RelayError::FallbackUnresolvable);
    }
    Ok(format!("{scheme}{authority}{fallback}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_fallback_passes_through() {
        let resolved = resolve_fallback("ws://other:8554/alt", None).unwrap();
        assert_eq!(resolved, "ws://other:8554/alt");
    }

    #[test]
    fn relative_fallback_keeps_scheme_and_authority() {
        let resolved =
            resolve_fallback("/other", Some("wss://relay.example:8555/live/cam1")).unwrap();
        assert_eq!(resolved, "wss://relay.example:8555/other");
    }

    #[test]
    fn relative_fallback_without_requestor_is_malformed() {
        assert_eq!(
            resolve_fallback("/other", None),
            Err(RelayError::FallbackUnresolvable)
        );
        assert_eq!(
            resolve_fallback("/other", Some("not-a-url")),
            Err(RelayError::FallbackUnresolvable)
        );
    }
}
