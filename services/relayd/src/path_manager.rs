//! The path registry and dispatcher.
//!
//! A process-wide single-writer actor owning the `name → path` map.  Every
//! inbound session request goes through here: the name is validated, the
//! configuration entry resolved (literal first, then regex), the session
//! authenticated, and the request forwarded into the path actor — which
//! replies on the request's own oneshot, so a slow path never stalls the
//! registry.  Configuration reloads close removed or changed paths and
//! create new static ones; regex-derived paths are materialised lazily on
//! first request.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use mtx_protocol::{TrackInfo, validate_path_name};

use crate::auth::{AuthAction, AuthOutcome, AuthRequest, Authenticator};
use crate::conf::{Conf, PathConf};
use crate::errors::RelayError;
use crate::path::{
    self, DescribeAnswer, PathClientRequest, PathClosedNotice, PathHandle, PathOpts,
    PublisherAttachment, SetupPlayAnswer,
};
use crate::session::{Credentials, SessionDesc, SessionHandle};

const REQUEST_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

enum ManagerRequest {
    Describe {
        path: String,
        session: SessionDesc,
        credentials: Credentials,
        reply: oneshot::Sender<Result<DescribeAnswer, RelayError>>,
    },
    Announce {
        path: String,
        session: SessionHandle,
        credentials: Credentials,
        tracks: Vec<TrackInfo>,
        reply: oneshot::Sender<Result<PublisherAttachment, RelayError>>,
    },
    SetupPlay {
        path: String,
        session: SessionHandle,
        requestor_url: Option<String>,
        credentials: Credentials,
        track_ids: Vec<u8>,
        reply: oneshot::Sender<Result<SetupPlayAnswer, RelayError>>,
    },
    Reload {
        conf: Box<Conf>,
        reply: oneshot::Sender<()>,
    },
    ListPaths {
        reply: oneshot::Sender<Vec<String>>,
    },
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Cheap, cloneable entry point for sessions.
#[derive(Clone)]
pub struct ManagerClient {
    tx: mpsc::Sender<ManagerRequest>,
}

impl ManagerClient {
    pub async fn describe(
        &self,
        path: impl Into<String>,
        session: SessionDesc,
        credentials: Credentials,
    ) -> Result<DescribeAnswer, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerRequest::Describe {
                path: path.into(),
                session,
                credentials,
                reply,
            })
            .await
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }

    pub async fn announce(
        &self,
        path: impl Into<String>,
        session: SessionHandle,
        credentials: Credentials,
        tracks: Vec<TrackInfo>,
    ) -> Result<PublisherAttachment, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerRequest::Announce {
                path: path.into(),
                session,
                credentials,
                tracks,
                reply,
            })
            .await
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }

    pub async fn setup_play(
        &self,
        path: impl Into<String>,
        session: SessionHandle,
        requestor_url: Option<String>,
        credentials: Credentials,
        track_ids: Vec<u8>,
    ) -> Result<SetupPlayAnswer, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerRequest::SetupPlay {
                path: path.into(),
                session,
                requestor_url,
                credentials,
                track_ids,
                reply,
            })
            .await
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }

    /// Apply a new configuration; resolves when the diff has been applied.
    pub async fn reload(&self, conf: Conf) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ManagerRequest::Reload {
                conf: Box::new(conf),
                reply,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Names of the paths currently in the registry, sorted.
    pub async fn list_paths(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ManagerRequest::ListPaths { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// The running registry actor.
pub struct PathManager {
    client: ManagerClient,
    terminate: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PathManager {
    pub fn spawn(
        conf: Conf,
        authenticator: Arc<dyn Authenticator>,
        ingress_port: u16,
    ) -> PathManager {
        let (tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (terminate, terminate_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let mut actor = ManagerActor {
            conf,
            authenticator,
            ingress_port,
            registry: HashMap::new(),
            closed_tx,
        };
        actor.create_static_paths();
        let task = tokio::spawn(actor.run(request_rx, closed_rx, terminate_rx));

        PathManager {
            client: ManagerClient { tx },
            terminate,
            task,
        }
    }

    pub fn client(&self) -> ManagerClient {
        self.client.clone()
    }

    /// Terminate every path, then the registry task itself.
    pub async fn shutdown(self) {
        let PathManager {
            client,
            terminate,
            task,
        } = self;
        drop(client);
        let _ = terminate.send(true);
        let _ = task.await;
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct ResolvedEntry {
    conf_name: String,
    conf: PathConf,
    is_regex: bool,
}

struct ManagerActor {
    conf: Conf,
    authenticator: Arc<dyn Authenticator>,
    ingress_port: u16,
    registry: HashMap<String, PathHandle>,
    closed_tx: mpsc::UnboundedSender<PathClosedNotice>,
}

impl ManagerActor {
    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<ManagerRequest>,
        mut closed_rx: mpsc::UnboundedReceiver<PathClosedNotice>,
        mut terminate_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = terminate_rx.changed() => break,
                Some(notice) = closed_rx.recv() => self.on_path_closed(notice),
                Some(request) = request_rx.recv() => self.handle_request(request).await,
            }
        }

        info!(paths = self.registry.len(), "path manager shutting down");
        for (_, handle) in self.registry.drain() {
            handle.terminate().await;
        }

        request_rx.close();
        while let Some(request) = request_rx.recv().await {
            reply_terminated(request);
        }
    }

    fn create_static_paths(&mut self) {
        let static_entries: Vec<ResolvedEntry> = self
            .conf
            .paths
            .iter()
            .filter(|e| !e.is_regex())
            .map(|e| ResolvedEntry {
                conf_name: e.name.clone(),
                conf: e.conf.clone(),
                is_regex: false,
            })
            .collect();
        for resolved in static_entries {
            let name = resolved.conf_name.clone();
            let handle = self.spawn_path(&name, &resolved);
            self.registry.insert(name, handle);
        }
    }

    async fn handle_request(&mut self, request: ManagerRequest) {
        match request {
            ManagerRequest::Describe {
                path,
                session,
                credentials,
                reply,
            } => {
                match self.prepare(&path, AuthAction::Read, session.remote_addr.ip(), &credentials) {
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                    Ok(resolved) => {
                        self.dispatch(&path, resolved, PathClientRequest::Describe {
                            session,
                            reply,
                        })
                        .await;
                    }
                }
            }
            ManagerRequest::Announce {
                path,
                session,
                credentials,
                tracks,
                reply,
            } => {
                match self.prepare(&path, AuthAction::Publish, session.remote_addr.ip(), &credentials)
                {
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                    Ok(resolved) => {
                        self.dispatch(&path, resolved, PathClientRequest::Announce {
                            session,
                            tracks,
                            reply,
                        })
                        .await;
                    }
                }
            }
            ManagerRequest::SetupPlay {
                path,
                session,
                requestor_url,
                credentials,
                track_ids,
                reply,
            } => {
                match self.prepare(&path, AuthAction::Read, session.remote_addr.ip(), &credentials) {
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                    Ok(resolved) => {
                        self.dispatch(&path, resolved, PathClientRequest::SetupPlay {
                            session,
                            requestor_url,
                            track_ids,
                            reply,
                        })
                        .await;
                    }
                }
            }
            ManagerRequest::Reload { conf, reply } => {
                self.apply_reload(*conf).await;
                let _ = reply.send(());
            }
            ManagerRequest::ListPaths { reply } => {
                let mut names: Vec<String> = self.registry.keys().cloned().collect();
                names.sort();
                let _ = reply.send(names);
            }
        }
    }

    /// Validate the name, resolve its configuration entry and authenticate.
    fn prepare(
        &self,
        name: &str,
        action: AuthAction,
        remote_ip: std::net::IpAddr,
        credentials: &Credentials,
    ) -> Result<ResolvedEntry, RelayError> {
        validate_path_name(name).map_err(|e| RelayError::NameInvalid(e.to_string()))?;

        let entry = self
            .conf
            .resolve(name)
            .ok_or_else(|| RelayError::NotFound(name.to_owned()))?;

        let request = AuthRequest {
            action,
            path_name: name,
            remote_addr: remote_ip,
            credentials,
        };
        match self.authenticator.authenticate(&entry.conf, &request) {
            AuthOutcome::Ok => {}
            AuthOutcome::NotCritical { hint } => {
                return Err(RelayError::AuthNotCritical { hint });
            }
            AuthOutcome::Critical { hint } => {
                return Err(RelayError::AuthCritical { hint });
            }
        }

        Ok(ResolvedEntry {
            conf_name: entry.name.clone(),
            conf: entry.conf.clone(),
            is_regex: entry.is_regex(),
        })
    }

    /// Forward a request into the path, creating the path on demand.  A path
    /// that turns out to be mid-close is replaced once; the retry keeps the
    /// race between closure and new arrivals invisible to the session.
    async fn dispatch(
        &mut self,
        name: &str,
        resolved: ResolvedEntry,
        request: PathClientRequest,
    ) {
        let mut request = request;
        for _attempt in 0..2 {
            if !self.registry.contains_key(name) {
                let handle = self.spawn_path(name, &resolved);
                self.registry.insert(name.to_owned(), handle);
            }
            let Some(handle) = self.registry.get(name) else {
                break;
            };
            match handle.forward(request).await {
                Ok(()) => return,
                Err(returned) => {
                    debug!(path = name, "request hit a closing path, recreating");
                    request = returned;
                    self.registry.remove(name);
                }
            }
        }
        path::reply_client_terminated(request);
    }

    fn spawn_path(&self, name: &str, resolved: &ResolvedEntry) -> PathHandle {
        path::spawn(PathOpts {
            name: name.to_owned(),
            conf_name: resolved.conf_name.clone(),
            conf: resolved.conf.clone(),
            is_regex_derived: resolved.is_regex,
            ingress_port: self.ingress_port,
            reader_queue_size: self.conf.reader_queue_size,
            on_close: self.closed_tx.clone(),
        })
    }

    fn on_path_closed(&mut self, notice: PathClosedNotice) {
        // the name may already belong to a newer incarnation
        if self
            .registry
            .get(&notice.name)
            .is_some_and(|handle| handle.id == notice.id)
        {
            debug!(path = %notice.name, "removing closed path from registry");
            self.registry.remove(&notice.name);
        }
    }

    /// Close paths whose entry disappeared or changed, adopt the new
    /// configuration, then create any new static paths.
    async fn apply_reload(&mut self, new_conf: Conf) {
        let mut to_close: Vec<String> = Vec::new();
        for name in self.registry.keys() {
            let old = self.conf.resolve(name);
            let new = new_conf.resolve(name);
            match (old, new) {
                (_, None) => to_close.push(name.clone()),
                (Some(old), Some(new)) if old != new => to_close.push(name.clone()),
                (None, Some(_)) => to_close.push(name.clone()),
                _ => {}
            }
        }
        for name in to_close {
            if let Some(handle) = self.registry.remove(&name) {
                info!(path = %name, "closing path on config reload");
                handle.terminate().await;
            }
        }

        self.conf = new_conf;

        let new_static: Vec<ResolvedEntry> = self
            .conf
            .paths
            .iter()
            .filter(|e| !e.is_regex() && !self.registry.contains_key(&e.name))
            .map(|e| ResolvedEntry {
                conf_name: e.name.clone(),
                conf: e.conf.clone(),
                is_regex: false,
            })
            .collect();
        for resolved in new_static {
            let name = resolved.conf_name.clone();
            let handle = self.spawn_path(&name, &resolved);
            self.registry.insert(name, handle);
        }
    }
}

fn reply_terminated(request: ManagerRequest) {
    match request {
        ManagerRequest::Describe { reply, .. } => {
            let _ = reply.send(Err(RelayError::Terminated));
        }
        ManagerRequest::Announce { reply, .. } => {
            let _ = reply.send(Err(RelayError::Terminated));
        }
        ManagerRequest::SetupPlay { reply, .. } => {
            let _ = reply.send(Err(RelayError::Terminated));
        }
        ManagerRequest::Reload { reply, .. } => {
            let _ = reply.send(());
        }
        ManagerRequest::ListPaths { reply } => {
            let _ = reply.send(Vec::new());
        }
    }
}
