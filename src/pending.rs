/// Pending-request registry
///
/// Maps a request correlation id to a one-shot completion slot. Exactly one
/// outcome reaches each awaiter: the matching response, a timeout, or a
/// cancellation at shutdown. The deadline is enforced at the awaiter with
/// `tokio::time::timeout`, so a completed request's timer dies with it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;
use crate::protocol::methods;

/// Default timeout for a method, in line with the MCP operation classes:
/// quick liveness checks get 10 s, tool and sampling invocations 60 s,
/// everything else 30 s. Callers may override per request.
pub fn default_timeout(method: &str) -> Duration {
    match method {
        methods::PING => Duration::from_secs(10),
        methods::TOOLS_CALL | "sampling/createMessage" | "completion/complete" => {
            Duration::from_secs(60)
        }
        _ => Duration::from_secs(30),
    }
}

struct PendingEntry {
    method: String,
    server_id: Option<String>,
    slot: oneshot::Sender<Result<Value, Error>>,
}

/// Registry of outstanding requests keyed by correlation id
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new pending request and return its completion receiver
    pub fn insert(
        &self,
        correlation_id: impl Into<String>,
        method: impl Into<String>,
        server_id: Option<String>,
    ) -> oneshot::Receiver<Result<Value, Error>> {
        let (slot, receiver) = oneshot::channel();
        let entry = PendingEntry {
            method: method.into(),
            server_id,
            slot,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(correlation_id.into(), entry);
        }
        receiver
    }

    /// Deliver an outcome to the awaiter. Returns false if the id is not
    /// pending (late or foreign response).
    pub fn complete(&self, correlation_id: &str, outcome: Result<Value, Error>) -> bool {
        let entry = match self.entries.lock() {
            Ok(mut entries) => entries.remove(correlation_id),
            Err(_) => None,
        };
        match entry {
            Some(entry) => {
                debug!(id = %correlation_id, method = %entry.method, "completing pending request");
                // The awaiter may have timed out and dropped its receiver
                let _ = entry.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Withdraw a pending request without delivering an outcome (the
    /// awaiter already gave up, e.g. on timeout)
    pub fn remove(&self, correlation_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(correlation_id);
        }
    }

    /// Whether the id is currently pending
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(correlation_id))
            .unwrap_or(false)
    }

    /// Fail every outstanding request with `Cancelled` and clear the map
    pub fn cancel_all(&self) {
        let drained: Vec<PendingEntry> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, entry)| entry).collect(),
            Err(_) => Vec::new(),
        };
        for entry in drained {
            debug!(method = %entry.method, server_id = ?entry.server_id, "cancelling pending request");
            let _ = entry.slot.send(Err(Error::Cancelled));
        }
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
