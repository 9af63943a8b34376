//! Request/response correlation for the remote API.
//!
//! Every outgoing `apiRequest` registers a pending entry keyed by a
//! process-unique id. Exactly one of {matching response, timeout, owning
//! connection disconnect} resolves the entry: resolution always removes it
//! from the table first, so whichever path gets there first wins and the
//! loser finds nothing to do.

use gatemesh_core::{Document, MeshError, MeshResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

struct Pending {
    server: String,
    tx: oneshot::Sender<MeshResult<Document>>,
}

pub struct Correlator {
    next_id: AtomicU64,
    timeout: Duration,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending request addressed to `server` and start its
    /// timeout clock. Returns the request id and the resolution channel.
    pub fn register(
        self: &Arc<Self>,
        server: &str,
    ) -> (u64, oneshot::Receiver<MeshResult<Document>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            id,
            Pending {
                server: server.to_string(),
                tx,
            },
        );

        let correlator = self.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if correlator.take(id, |p| {
                let _ = p.tx.send(Err(MeshError::Timeout));
            }) {
                debug!(id, "api request timed out");
            }
        });

        (id, rx)
    }

    fn take(&self, id: u64, resolve: impl FnOnce(Pending)) -> bool {
        let entry = self.pending.lock().unwrap().remove(&id);
        match entry {
            Some(p) => {
                resolve(p);
                true
            }
            None => false,
        }
    }

    /// Drop a just-registered request whose send never went out.
    pub fn abandon(&self, id: u64) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Resolve a pending request with the remote's answer. A response for
    /// an id we no longer know is ignored: it already resolved, or it came
    /// from a stale connection.
    pub fn resolve(&self, id: u64, result: MeshResult<Document>) -> bool {
        let resolved = self.take(id, |p| {
            let _ = p.tx.send(result);
        });
        if !resolved {
            debug!(id, "response for unknown request id, dropped");
        }
        resolved
    }

    /// Resolve every request addressed to `server` as a failure. Called on
    /// disconnect.
    pub fn fail_all_for(&self, server: &str) {
        let doomed: Vec<Pending> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.server == server)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        if !doomed.is_empty() {
            debug!(server, count = doomed.len(), "failing pending requests");
        }
        for p in doomed {
            let _ = p.tx.send(Err(MeshError::NotConnected));
        }
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.lock().unwrap().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
