//! File watching for hot reload.
//!
//! Uses native OS file watching (inotify on Linux) on the *parent
//! directories* of the watched file so that atomic replace-by-rename is
//! seen, and dereferences symlinks so a re-pointed link (the usual
//! config-map update pattern) is detected too.
//!
//! Event bursts are coalesced: a 10 ms settle delay lets the writer finish,
//! and at most one change notification is emitted per 1 s window.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const SETTLE_DELAY: Duration = Duration::from_millis(10);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch setup for '{path}': {source}")]
    Setup {
        path: String,
        source: notify::Error,
    },
}

/// Watches one file; each coalesced change emits `()` on the returned
/// channel.
pub struct ConfWatcher {
    terminate: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConfWatcher {
    pub fn spawn(path: PathBuf) -> Result<(ConfWatcher, mpsc::Receiver<()>), WatchError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                if let Ok(event) = result {
                    let _ = raw_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| WatchError::Setup {
            path: path.display().to_string(),
            source: e,
        })?;

        for dir in watch_dirs(&path) {
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| WatchError::Setup {
                    path: dir.display().to_string(),
                    source: e,
                })?;
        }

        let (terminate, terminate_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(1);
        let task = tokio::spawn(coalesce_loop(path, watcher, raw_rx, events_tx, terminate_rx));
        Ok((ConfWatcher { terminate, task }, events_rx))
    }

    pub async fn close(self) {
        let _ = self.terminate.send(true);
        let _ = self.task.await;
    }
}

/// The parent of the watched path plus, for symlinks, the parent of the
/// link target.
fn watch_dirs(path: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(parent) = path.parent() {
        dirs.push(parent.to_path_buf());
    }
    if let Ok(canonical) = std::fs::canonicalize(path)
        && let Some(parent) = canonical.parent()
        && !dirs.contains(&parent.to_path_buf())
    {
        dirs.push(parent.to_path_buf());
    }
    dirs
}

fn is_relevant(event: &Event, watched: &Path, canonical: Option<&Path>) -> bool {
    if !matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    let watched_name = watched.file_name();
    let canonical_name = canonical.and_then(Path::file_name);
    event.paths.iter().any(|p| {
        p == watched
            || canonical.is_some_and(|c| p == c)
            || (p.file_name().is_some() && p.file_name() == watched_name)
            || (p.file_name().is_some() && p.file_name() == canonical_name)
    })
}

async fn coalesce_loop(
    path: PathBuf,
    _watcher: RecommendedWatcher,
    mut raw_rx: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::Sender<()>,
    mut terminate_rx: watch::Receiver<bool>,
) {
    let mut canonical = std::fs::canonicalize(&path).ok();
    // allow an immediate first emission
    let mut last_emit = Instant::now() - MIN_INTERVAL;

    loop {
        let event = tokio::select! {
            _ = terminate_rx.changed() => return,
            event = raw_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        if !is_relevant(&event, &path, canonical.as_deref()) {
            continue;
        }

        // let the writer finish
        tokio::time::sleep(SETTLE_DELAY).await;
        while raw_rx.try_recv().is_ok() {}

        // at most one notification per window
        let since = last_emit.elapsed();
        if since < MIN_INTERVAL {
            tokio::select! {
                _ = terminate_rx.changed() => return,
                _ = tokio::time::sleep(MIN_INTERVAL - since) => {}
            }
            while raw_rx.try_recv().is_ok() {}
        }

        // the link may now point somewhere else
        canonical = std::fs::canonicalize(&path).ok();

        debug!(path = %path.display(), "file changed");
        if events_tx.send(()).await.is_err() {
            warn!(path = %path.display(), "change listener gone, stopping watcher");
            return;
        }
        last_emit = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_in_place_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("relayd.toml");
        std::fs::write(&file, "a = 1\n").unwrap();

        let (watcher, mut events) = ConfWatcher::spawn(file.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&file, "a = 2\n").unwrap();

        tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("change not detected")
            .expect("watcher stopped");
        watcher.close().await;
    }

    #[tokio::test]
    async fn detects_replace_by_rename() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("relayd.toml");
        std::fs::write(&file, "a = 1\n").unwrap();

        let (watcher, mut events) = ConfWatcher::spawn(file.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let staged = dir.path().join(".relayd.toml.tmp");
        std::fs::write(&staged, "a = 2\n").unwrap();
        std::fs::rename(&staged, &file).unwrap();

        tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("rename not detected")
            .expect("watcher stopped");
        watcher.close().await;
    }

    #[tokio::test]
    async fn burst_of_writes_coalesces_into_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("relayd.toml");
        std::fs::write(&file, "a = 0\n").unwrap();

        let (watcher, mut events) = ConfWatcher::spawn(file.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 1..=5 {
            std::fs::write(&file, format!("a = {i}\n")).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("burst not detected")
            .expect("watcher stopped");
        // the rest of the burst stays inside the 1 s window
        let extra = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
        assert!(extra.is_err(), "burst must coalesce into a single event");
        watcher.close().await;
    }
}
