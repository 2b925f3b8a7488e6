//! Per-path frame fan-out.
//!
//! Forwarding runs under a shared-read lock so adds/removes serialize
//! against each other but only briefly block the forward path.  Each reader
//! owns a bounded queue; a queue that fills marks the reader for removal and
//! its session is told to close.  The slow reader is dropped, never the
//! frame, so the rest of the fan-out keeps its latency.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::{debug, info};

use mtx_protocol::Frame;

use crate::session::{CloseReason, SessionHandle, SessionId};
use crate::stats::{self, Stats};

struct ReaderSlot {
    session: SessionHandle,
    frame_tx: mpsc::Sender<Frame>,
}

/// The set of sessions currently in the play state for one path.
#[derive(Default)]
pub struct ReaderSet {
    readers: RwLock<HashMap<SessionId, ReaderSlot>>,
}

impl ReaderSet {
    pub fn new() -> Self {
        ReaderSet::default()
    }

    /// Attach a reader.  The caller must not add the same session twice.
    pub fn add(&self, session: SessionHandle, frame_tx: mpsc::Sender<Frame>) {
        let mut readers = self.readers.write().unwrap_or_else(|e| e.into_inner());
        let prev = readers.insert(session.id, ReaderSlot { session, frame_tx });
        debug_assert!(prev.is_none(), "reader added twice");
    }

    /// Detach a reader; a no-op for unknown ids.
    pub fn remove(&self, id: SessionId) {
        let mut readers = self.readers.write().unwrap_or_else(|e| e.into_inner());
        readers.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.readers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one source frame to every attached reader.
    ///
    /// Readers whose queue is full are detached and told to close; delivery
    /// to the others is unaffected.
    pub fn forward_frame(&self, frame: &Frame) {
        let mut overflowed: Vec<SessionId> = Vec::new();
        {
            let readers = self.readers.read().unwrap_or_else(|e| e.into_inner());
            for slot in readers.values() {
                match slot.frame_tx.try_send(frame.clone()) {
                    Ok(()) => stats::bump(&Stats::global().frames_forwarded),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        overflowed.push(slot.session.id);
                    }
                    // receiver dropped: the session is already going away,
                    // removal happens through the normal remove path
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        for id in overflowed {
            let mut readers = self.readers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = readers.remove(&id) {
                info!(session_id = %id, "reader queue overflowed, dropping reader");
                stats::bump(&Stats::global().readers_dropped_slow);
                slot.session.close(CloseReason::ReaderTooSlow);
            }
        }
    }

    /// Detach every reader and signal each one to close.
    pub fn drain(&self, reason: CloseReason) {
        let mut readers = self.readers.write().unwrap_or_else(|e| e.into_inner());
        for (id, slot) in readers.drain() {
            debug!(session_id = %id, "detaching reader");
            slot.session.close(reason);
        }
    }
}
