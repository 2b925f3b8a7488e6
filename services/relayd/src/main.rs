// relayd: Multi-protocol real-time media relay daemon.
//
// Wires the pieces together: configuration, the path manager, the plain and
// TLS ingress listeners, and the file watchers driving hot reload.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use relayd::auth::StaticAuthenticator;
use relayd::cert_loader::CertLoader;
use relayd::conf;
use relayd::conf_watcher::ConfWatcher;
use relayd::ingress;
use relayd::path_manager::PathManager;

#[derive(Parser, Debug)]
#[command(name = "relayd", version, about = "Real-time media relay")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/relayd/relayd.toml")]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "relayd starting");

    let conf = match conf::load_from_path(&args.config) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    info!(
        listen = %conf.listen,
        paths = conf.paths.len(),
        "config loaded"
    );

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(args.config, conf)) {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run(conf_path: PathBuf, conf: conf::Conf) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&conf.listen).await?;
    let ingress_port = listener.local_addr()?.port();

    let manager = PathManager::spawn(conf.clone(), Arc::new(StaticAuthenticator), ingress_port);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(ingress::serve(
        listener,
        None,
        manager.client(),
        conf.read_timeout,
        shutdown_rx.clone(),
    )));

    // optional TLS listener with hot-reloaded certificate
    let mut cert_watcher = None;
    if let Some(tls) = &conf.tls {
        let loader = CertLoader::new(tls.cert.clone(), tls.key.clone())?;
        let acceptor = tokio_rustls::TlsAcceptor::from(loader.server_config());
        let tls_listener = TcpListener::bind(&tls.listen).await?;
        tasks.push(tokio::spawn(ingress::serve(
            tls_listener,
            Some(acceptor),
            manager.client(),
            conf.read_timeout,
            shutdown_rx.clone(),
        )));

        let (watcher, mut cert_events) = ConfWatcher::spawn(tls.cert.clone())?;
        cert_watcher = Some(watcher);
        let loader = loader.clone();
        tokio::spawn(async move {
            while cert_events.recv().await.is_some() {
                let _ = loader.reload();
            }
        });
    }

    // config hot reload
    let (conf_watcher, mut conf_events) = ConfWatcher::spawn(conf_path.clone())?;
    let reload_client = manager.client();
    tokio::spawn(async move {
        while conf_events.recv().await.is_some() {
            match conf::load_from_path(&conf_path) {
                Ok(new_conf) => {
                    info!("configuration reloaded");
                    reload_client.reload(new_conf).await;
                }
                Err(e) => {
                    warn!(error = %e, "ignoring invalid configuration");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    conf_watcher.close().await;
    if let Some(watcher) = cert_watcher {
        watcher.close().await;
    }
    manager.shutdown().await;
    for task in tasks {
        let _ = task.await;
    }

    let stats = relayd::stats::Stats::global();
    info!(
        sessions = relayd::stats::read(&stats.sessions_opened),
        paths = relayd::stats::read(&stats.paths_created),
        frames = relayd::stats::read(&stats.frames_forwarded),
        "goodbye"
    );
    Ok(())
}
