//! Request ID allocation and response correlation.
//!
//! Flow:
//! 1. `call()` asks [`Correlator::register`] for a fresh ID and a [`PendingCall`]
//! 2. The request frame is written to the socket
//! 3. The socket reader hands every inbound frame to [`Correlator::handle_frame`]
//! 4. The matching [`PendingCall`] resolves, or evicts itself when its
//!    deadline passes first
//!
//! Responses correlate by ID, not arrival order, so a worker completing
//! requests out of order is safe. A response whose entry is gone (timed out,
//! cancelled, or rejected by shutdown) is discarded.
//!
//! Each entry remembers the socket generation its frame was written on.
//! When recovery installs a new socket, frames written on an older one are
//! handed back by [`Correlator::take_replays`] and written again, so a
//! request sent into a socket that was already dead is not lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::protocol::{decode_response, RequestId, RpcResponse};

type Outcome = Result<Value, BridgeError>;

/// An in-flight request waiting for its response.
struct PendingRequest {
    method: String,
    sender: oneshot::Sender<Outcome>,
    issued_at: Instant,
    written: Option<Written>,
}

/// The encoded frame and the socket generation it last went out on.
struct Written {
    generation: u64,
    frame: Vec<u8>,
}

/// Table of in-flight requests keyed by correlation ID.
pub struct Correlator {
    /// Monotonically increasing request counter, starting at 1.
    next_seq: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    default_timeout: Duration,
}

impl Correlator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            next_seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Allocate an ID and register a pending entry for it.
    pub fn register(&self, method: &str) -> PendingCall<'_> {
        let id = RequestId::from_sequence(self.next_seq.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();

        self.table().insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                sender,
                issued_at: Instant::now(),
                written: None,
            },
        );
        debug!(id = %id, method, "Registered pending request");

        PendingCall {
            correlator: self,
            id,
            receiver: Some(receiver),
        }
    }

    /// Decode one inbound frame and complete the matching request.
    ///
    /// Malformed frames are logged and dropped; they never affect other
    /// in-flight requests.
    pub fn handle_frame(&self, frame: &str) {
        match decode_response(frame) {
            Ok(response) => {
                self.resolve(response);
            }
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    }

    /// Complete the request matching `response.id`.
    ///
    /// Returns `true` if a waiting request was found.
    pub fn resolve(&self, response: RpcResponse) -> bool {
        let Some(id) = response.id.clone() else {
            if let Some(err) = &response.error {
                warn!(
                    code = err.code,
                    "Worker reported an uncorrelated error: {}", err.message
                );
            } else {
                warn!("Dropping response without id");
            }
            return false;
        };

        let Some(pending) = self.table().remove(&id) else {
            debug!(id = %id, "Discarding response for unknown or expired request");
            return false;
        };

        debug!(
            id = %id,
            method = pending.method,
            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
            "Completed pending request"
        );
        // The receiver may already be gone if the caller was cancelled.
        pending.sender.send(response.into_outcome()).is_ok()
    }

    /// Record that the frame for `id` was written on socket `generation`.
    ///
    /// Returns `false` if the entry is already gone.
    pub fn mark_written(&self, id: &RequestId, generation: u64, frame: &[u8]) -> bool {
        match self.table().get_mut(id) {
            Some(pending) => {
                pending.written = Some(Written {
                    generation,
                    frame: frame.to_vec(),
                });
                true
            }
            None => false,
        }
    }

    pub fn is_written(&self, id: &RequestId) -> bool {
        self.table()
            .get(id)
            .is_some_and(|pending| pending.written.is_some())
    }

    /// Frames written on a socket older than `generation`, oldest first.
    ///
    /// The returned entries are re-tagged with `generation`, so each is
    /// handed out once per socket.
    pub fn take_replays(&self, generation: u64) -> Vec<(RequestId, Vec<u8>)> {
        let mut table = self.table();
        let mut replays: Vec<(Instant, RequestId, Vec<u8>)> = table
            .iter_mut()
            .filter_map(|(id, pending)| {
                let written = pending.written.as_mut()?;
                if written.generation >= generation {
                    return None;
                }
                written.generation = generation;
                Some((pending.issued_at, id.clone(), written.frame.clone()))
            })
            .collect();
        drop(table);

        replays.sort_by_key(|(issued_at, _, _)| *issued_at);
        replays
            .into_iter()
            .map(|(_, id, frame)| (id, frame))
            .collect()
    }

    /// Remove an entry without completing it.
    pub fn evict(&self, id: &RequestId) -> bool {
        self.table().remove(id).is_some()
    }

    /// Reject every outstanding request, returning how many were rejected.
    pub fn reject_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> BridgeError,
    {
        let drained: Vec<(RequestId, PendingRequest)> = self.table().drain().collect();
        let count = drained.len();
        for (id, pending) in drained {
            debug!(id = %id, method = pending.method, "Rejecting pending request");
            let _ = pending.sender.send(Err(make_error()));
        }
        count
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Completion handle for one registered request.
///
/// Dropping it before completion evicts the entry, so a cancelled caller
/// never leaks a table slot.
pub struct PendingCall<'a> {
    correlator: &'a Correlator,
    id: RequestId,
    receiver: Option<oneshot::Receiver<Outcome>>,
}

impl PendingCall<'_> {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response, or fail with [`BridgeError::Timeout`] once
    /// `timeout` elapses (evicting the entry).
    pub async fn wait(mut self, timeout: Duration) -> Outcome {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(BridgeError::ConnectionClosed);
        };

        let settled = tokio::time::timeout(timeout, receiver).await;
        self.receiver = None;

        match settled {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a value: the table was torn down.
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed),
            Err(_) => {
                self.correlator.evict(&self.id);
                debug!(id = %self.id, "Request timed out");
                Err(BridgeError::Timeout {
                    id: self.id.to_string(),
                    after: timeout,
                })
            }
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        // Still set when the call never reached `wait()` or was cancelled mid-wait.
        if self.receiver.is_some() {
            self.correlator.evict(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_ids_are_monotonic_and_unique() {
        let correlator = Correlator::new(LONG);
        let a = correlator.register("echo");
        let b = correlator.register("echo");
        let c = correlator.register("ping");
        assert_eq!(a.id().as_str(), "req_1");
        assert_eq!(b.id().as_str(), "req_2");
        assert_eq!(c.id().as_str(), "req_3");
        assert_eq!(correlator.len(), 3);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_their_ids() {
        let correlator = Correlator::new(LONG);
        let first = correlator.register("sleep");
        let second = correlator.register("sleep");
        let first_id = first.id().clone();
        let second_id = second.id().clone();

        // Worker answers the second request first.
        correlator.handle_frame(&format!(r#"{{"id":"{second_id}","result":"second"}}"#));
        correlator.handle_frame(&format!(r#"{{"id":"{first_id}","result":"first"}}"#));

        assert_eq!(first.wait(LONG).await.expect("first"), json!("first"));
        assert_eq!(second.wait(LONG).await.expect("second"), json!("second"));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_error_response_rejects_with_code_and_message() {
        let correlator = Correlator::new(LONG);
        let call = correlator.register("fail");
        let id = call.id().clone();

        correlator.handle_frame(&format!(
            r#"{{"id":"{id}","error":{{"code":1101,"message":"Invalid market"}}}}"#
        ));

        match call.wait(LONG).await {
            Err(BridgeError::Remote { code, message, .. }) => {
                assert_eq!(code, 1101);
                assert_eq!(message, "Invalid market");
            }
            other => panic!("Expected Remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_evicts_entry() {
        let correlator = Correlator::new(LONG);
        let call = correlator.register("hang");
        let id = call.id().clone();

        let started = Instant::now();
        let err = call.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));

        match err {
            BridgeError::Timeout { id: timed_out, after } => {
                assert_eq!(timed_out, id.to_string());
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert!(correlator.is_empty());

        // A late response for the evicted request is discarded silently.
        let late = RpcResponse::success(id, json!("too late"));
        assert!(!correlator.resolve(late));
    }

    #[tokio::test]
    async fn test_late_response_does_not_affect_other_requests() {
        let correlator = Correlator::new(LONG);
        let slow = correlator.register("slow");
        let slow_id = slow.id().clone();
        let _ = slow.wait(Duration::from_millis(10)).await;

        let live = correlator.register("echo");
        let live_id = live.id().clone();
        correlator.handle_frame(&format!(r#"{{"id":"{slow_id}","result":"stale"}}"#));
        correlator.handle_frame(&format!(r#"{{"id":"{live_id}","result":"fresh"}}"#));

        assert_eq!(live.wait(LONG).await.expect("live"), json!("fresh"));
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_other_requests_alive() {
        let correlator = Correlator::new(LONG);
        let call = correlator.register("echo");
        let id = call.id().clone();

        correlator.handle_frame("{not valid json");
        correlator.handle_frame(r#"{"id":null,"error":{"code":-32700,"message":"Parse error"}}"#);
        assert_eq!(correlator.len(), 1);

        correlator.handle_frame(&format!(r#"{{"id":"{id}","result":{{"ok":true}}}}"#));
        assert_eq!(call.wait(LONG).await.expect("ok"), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_reject_all_fails_every_pending_call() {
        let correlator = Correlator::new(LONG);
        let calls: Vec<_> = (0..3).map(|_| correlator.register("hang")).collect();

        assert_eq!(correlator.reject_all(|| BridgeError::ConnectionClosed), 3);
        assert!(correlator.is_empty());

        for call in calls {
            let err = call.wait(LONG).await.unwrap_err();
            assert!(matches!(err, BridgeError::ConnectionClosed), "got {err:?}");
        }
    }

    #[test]
    fn test_dropped_call_evicts_entry() {
        let correlator = Correlator::new(LONG);
        let call = correlator.register("echo");
        assert_eq!(correlator.len(), 1);
        drop(call);
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_replays_cover_frames_from_older_sockets_only() {
        let correlator = Correlator::new(LONG);
        let lost = correlator.register("echo");
        let current = correlator.register("echo");
        let unsent = correlator.register("echo");

        assert!(correlator.mark_written(lost.id(), 1, b"lost\n"));
        assert!(correlator.mark_written(current.id(), 2, b"current\n"));
        assert!(correlator.is_written(lost.id()));
        assert!(!correlator.is_written(unsent.id()));

        let replays = correlator.take_replays(2);
        assert_eq!(replays, vec![(lost.id().clone(), b"lost\n".to_vec())]);
        // Already re-tagged for generation 2.
        assert!(correlator.take_replays(2).is_empty());
        assert_eq!(correlator.take_replays(3).len(), 2);
    }

    #[test]
    fn test_mark_written_after_eviction_is_ignored() {
        let correlator = Correlator::new(LONG);
        let call = correlator.register("echo");
        let id = call.id().clone();
        drop(call);
        assert!(!correlator.mark_written(&id, 1, b"frame\n"));
        assert!(correlator.take_replays(2).is_empty());
    }

    #[test]
    fn test_unknown_id_is_discarded() {
        let correlator = Correlator::new(LONG);
        let _call = correlator.register("echo");
        let stray = RpcResponse::success(RequestId::from("req_999"), json!(1));
        assert!(!correlator.resolve(stray));
        assert_eq!(correlator.len(), 1);
    }
}
