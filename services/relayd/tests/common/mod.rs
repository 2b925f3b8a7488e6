//! Shared harness: an in-process relay (path manager + ingress listener on
//! an ephemeral port) driven from TOML config strings.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use mtx_protocol::TrackInfo;
use relayd::auth::StaticAuthenticator;
use relayd::conf::{self, Conf};
use relayd::ingress;
use relayd::path_manager::{ManagerClient, PathManager};

pub struct Relay {
    pub url: String,
    pub port: u16,
    manager: PathManager,
    shutdown: watch::Sender<bool>,
}

impl Relay {
    pub fn client(&self) -> ManagerClient {
        self.manager.client()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.manager.shutdown().await;
    }
}

/// Start a relay from a TOML string.  `listen` may be `127.0.0.1:0`; the
/// real port is reported back through `Relay::port` / `Relay::url`.
pub async fn start_relay(conf_toml: &str) -> Relay {
    let conf: Conf = conf::load_from_str(conf_toml).expect("test config must parse");
    let listener = TcpListener::bind(&conf.listen)
        .await
        .expect("failed to bind test listener");
    let addr: SocketAddr = listener.local_addr().unwrap();
    let port = addr.port();

    let manager = PathManager::spawn(conf.clone(), Arc::new(StaticAuthenticator), port);
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(ingress::serve(
        listener,
        None,
        manager.client(),
        conf.read_timeout,
        shutdown_rx,
    ));

    Relay {
        url: format!("ws://127.0.0.1:{port}"),
        port,
        manager,
        shutdown,
    }
}

pub fn h264_track(id: u8) -> TrackInfo {
    TrackInfo {
        id,
        media: "video".to_owned(),
        codec: "H264".to_owned(),
        clock_rate: 90_000,
        parameters: Some("packetization-mode=1".to_owned()),
    }
}

pub fn opus_track(id: u8) -> TrackInfo {
    TrackInfo {
        id,
        media: "audio".to_owned(),
        codec: "OPUS".to_owned(),
        clock_rate: 48_000,
        parameters: None,
    }
}
