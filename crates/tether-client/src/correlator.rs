//! Request/response correlation over the push channel.
//!
//! Each request registers a [`PendingReply`] keyed by its correlation id and
//! then races a oneshot reply against its own timeout. The router hands every
//! inbound envelope carrying a `requestId` to [`RequestCorrelator::resolve`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_proto::Envelope;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ClientError;

/// How many completed correlation ids are remembered for duplicate detection.
const COMPLETED_HISTORY: usize = 256;

/// Predicate deciding whether an envelope answers a request.
pub type ReplyPredicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Which envelope carrying the right correlation id counts as the reply.
#[derive(Clone, Default)]
pub enum ReplyMatcher {
    /// Any envelope echoing the correlation id.
    #[default]
    Any,
    /// Only an envelope of this type.
    Type(String),
    /// A custom predicate.
    Custom(ReplyPredicate),
}

impl ReplyMatcher {
    /// Match replies of the given type.
    #[must_use]
    pub fn kind(kind: impl Into<String>) -> Self {
        Self::Type(kind.into())
    }

    /// Match replies accepted by `predicate`.
    #[must_use]
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Whether `envelope` is accepted. The correlation id is checked by the caller.
    #[must_use]
    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            Self::Any => true,
            Self::Type(kind) => envelope.kind == *kind,
            Self::Custom(predicate) => predicate(envelope),
        }
    }
}

impl fmt::Debug for ReplyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Type(kind) => f.debug_tuple("Type").field(kind).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Outcome of offering an inbound envelope to the correlator.
#[derive(Debug)]
pub enum Resolution {
    /// The envelope completed a pending request.
    Resolved,
    /// The envelope answers a request that already completed. Handed back.
    Stale(Envelope),
    /// No pending request claims the envelope. Handed back.
    Unclaimed(Envelope),
}

struct PendingRequest {
    matcher: ReplyMatcher,
    created_at: Instant,
    reply_tx: oneshot::Sender<Result<Envelope, ClientError>>,
}

#[derive(Default)]
struct Registry {
    pending: HashMap<String, PendingRequest>,
    completed: VecDeque<String>,
    completed_set: HashSet<String>,
}

impl Registry {
    fn mark_completed(&mut self, id: String) {
        if !self.completed_set.insert(id.clone()) {
            return;
        }
        self.completed.push_back(id);
        while self.completed.len() > COMPLETED_HISTORY {
            if let Some(old) = self.completed.pop_front() {
                self.completed_set.remove(&old);
            }
        }
    }
}

/// Tracks in-flight requests.
#[derive(Clone, Default)]
pub struct RequestCorrelator {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl RequestCorrelator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh correlation id.
    #[must_use]
    pub fn next_correlation_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Register a pending request.
    ///
    /// The returned handle removes the entry when dropped, so a caller that
    /// abandons the wait never leaks it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DuplicateRequestId`] if `id` is already pending.
    pub fn register(
        &self,
        id: impl Into<String>,
        matcher: ReplyMatcher,
        timeout: Duration,
    ) -> Result<PendingReply, ClientError> {
        let id = id.into();
        let (reply_tx, reply_rx) = oneshot::channel();

        let mut registry = self.registry.lock();
        if registry.pending.contains_key(&id) {
            return Err(ClientError::DuplicateRequestId(id));
        }
        registry.pending.insert(
            id.clone(),
            PendingRequest {
                matcher,
                created_at: Instant::now(),
                reply_tx,
            },
        );
        drop(registry);

        Ok(PendingReply {
            id,
            timeout,
            reply_rx,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Offer an inbound envelope to the pending requests.
    pub fn resolve(&self, envelope: Envelope) -> Resolution {
        let Some(id) = envelope.request_id().map(str::to_owned) else {
            return Resolution::Unclaimed(envelope);
        };

        let mut registry = self.registry.lock();
        let claimed = registry
            .pending
            .get(&id)
            .is_some_and(|pending| pending.matcher.matches(&envelope));

        if claimed {
            if let Some(pending) = registry.pending.remove(&id) {
                registry.mark_completed(id.clone());
                drop(registry);
                debug!(
                    request_id = %id,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "request resolved"
                );
                if pending.reply_tx.send(Ok(envelope)).is_err() {
                    debug!(request_id = %id, "reply arrived after the caller stopped waiting");
                }
                return Resolution::Resolved;
            }
        }

        if registry.completed_set.contains(&id) {
            warn!(
                request_id = %id,
                kind = %envelope.kind,
                "reply for a request that already completed"
            );
            return Resolution::Stale(envelope);
        }

        Resolution::Unclaimed(envelope)
    }

    /// Fail every pending request with `error`. Returns how many were failed.
    pub fn reject_all(&self, error: &ClientError) -> usize {
        let drained: Vec<(String, PendingRequest)> = {
            let mut registry = self.registry.lock();
            let drained: Vec<_> = registry.pending.drain().collect();
            for (id, _) in &drained {
                registry.mark_completed(id.clone());
            }
            drained
        };

        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.reply_tx.send(Err(error.clone()));
        }
        count
    }

    /// Number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.lock().pending.len()
    }

    /// Whether `id` is pending.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.registry.lock().pending.contains_key(id)
    }
}

/// A registered request waiting for its reply.
pub struct PendingReply {
    id: String,
    timeout: Duration,
    reply_rx: oneshot::Receiver<Result<Envelope, ClientError>>,
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PendingReply {
    /// Correlation id of the request.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply or the timeout, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::RequestTimeout`] if no reply arrived in time, or
    /// the error the request was rejected with.
    pub async fn wait(self) -> Result<Envelope, ClientError> {
        let deadline = Instant::now() + self.timeout;
        self.wait_until(deadline).await
    }

    /// Drive `send` and then wait for the reply, all under the request timeout.
    ///
    /// A send stuck behind a full outbound queue still times out, and a
    /// rejection (such as `disconnect()`) ends it early.
    ///
    /// # Errors
    ///
    /// Returns the send error, [`ClientError::RequestTimeout`], or the error
    /// the request was rejected with.
    pub async fn send_and_wait<F>(mut self, send: F) -> Result<Envelope, ClientError>
    where
        F: std::future::Future<Output = Result<(), ClientError>>,
    {
        let deadline = Instant::now() + self.timeout;
        let outcome = {
            let reply_rx = &mut self.reply_rx;
            tokio::time::timeout_at(deadline, async move {
                tokio::select! {
                    biased;
                    reply = reply_rx => SendOutcome::Replied(reply),
                    sent = send => SendOutcome::Sent(sent),
                }
            })
            .await
        };

        match outcome {
            Ok(SendOutcome::Sent(Ok(()))) => self.wait_until(deadline).await,
            Ok(SendOutcome::Sent(Err(e))) => Err(e),
            Ok(SendOutcome::Replied(Ok(result))) => result,
            Ok(SendOutcome::Replied(Err(_))) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                debug!(request_id = %self.id, "request timed out before it was sent");
                self.expire()
            }
        }
    }

    async fn wait_until(mut self, deadline: Instant) -> Result<Envelope, ClientError> {
        match tokio::time::timeout_at(deadline, &mut self.reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => self.expire(),
        }
    }

    fn expire(&mut self) -> Result<Envelope, ClientError> {
        let removed = {
            let mut registry = self.registry.lock();
            let removed = registry.pending.remove(&self.id).is_some();
            if removed {
                registry.mark_completed(self.id.clone());
            }
            removed
        };
        let timed_out = ClientError::RequestTimeout {
            request_id: self.id.clone(),
            timeout: self.timeout,
        };
        if removed {
            debug!(request_id = %self.id, "request timed out");
            return Err(timed_out);
        }
        // The reply or a rejection won the race while the timer fired.
        self.reply_rx.try_recv().unwrap_or(Err(timed_out))
    }
}

enum SendOutcome {
    Replied(Result<Result<Envelope, ClientError>, oneshot::error::RecvError>),
    Sent(Result<(), ClientError>),
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.lock().pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(kind: &str, id: &str) -> Envelope {
        Envelope::new(kind, json!({ "requestId": id, "launchpad": {} }))
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let ids: HashSet<String> = (0..1000)
            .map(|_| RequestCorrelator::next_correlation_id())
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test]
    async fn test_reply_resolves_and_clears_entry() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register("ab12cd", ReplyMatcher::kind("launchpad_response"), Duration::from_secs(5))
            .expect("register");
        assert_eq!(correlator.pending_count(), 1);

        let outcome = correlator.resolve(reply("launchpad_response", "ab12cd"));
        assert!(matches!(outcome, Resolution::Resolved));
        assert_eq!(correlator.pending_count(), 0);

        let envelope = pending.wait().await.expect("reply");
        assert_eq!(envelope.kind, "launchpad_response");
        assert_eq!(envelope.request_id(), Some("ab12cd"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let correlator = RequestCorrelator::new();
        let _first = correlator
            .register("dup", ReplyMatcher::Any, Duration::from_secs(5))
            .expect("register");

        let err = correlator
            .register("dup", ReplyMatcher::Any, Duration::from_secs(5))
            .expect_err("duplicate");
        assert_eq!(err, ClientError::DuplicateRequestId("dup".to_string()));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn test_matcher_rejection_leaves_request_pending() {
        let correlator = RequestCorrelator::new();
        let _pending = correlator
            .register("r1", ReplyMatcher::kind("launchpad_response"), Duration::from_secs(5))
            .expect("register");

        let outcome = correlator.resolve(reply("progress_update", "r1"));
        assert!(matches!(outcome, Resolution::Unclaimed(_)));
        assert!(correlator.is_pending("r1"));
    }

    #[test]
    fn test_custom_matcher() {
        let matcher = ReplyMatcher::custom(|e| e.payload.get("launchpad").is_some());
        assert!(matcher.matches(&reply("anything", "x")));
        assert!(!matcher.matches(&Envelope::new("anything", json!({}))));
        assert_eq!(format!("{matcher:?}"), "Custom(..)");
    }

    #[test]
    fn test_unknown_and_missing_ids_are_unclaimed() {
        let correlator = RequestCorrelator::new();
        assert!(matches!(
            correlator.resolve(reply("launchpad_response", "nobody")),
            Resolution::Unclaimed(_)
        ));
        assert!(matches!(
            correlator.resolve(Envelope::new("tick", json!({}))),
            Resolution::Unclaimed(_)
        ));
    }

    #[tokio::test]
    async fn test_second_reply_is_stale() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register("r1", ReplyMatcher::Any, Duration::from_secs(5))
            .expect("register");

        assert!(matches!(correlator.resolve(reply("resp", "r1")), Resolution::Resolved));
        let second = correlator.resolve(reply("resp", "r1"));
        let Resolution::Stale(envelope) = second else {
            panic!("expected Stale, got {second:?}");
        };
        assert_eq!(envelope.request_id(), Some("r1"));
        assert!(pending.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_exactly_once() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register("slow", ReplyMatcher::Any, Duration::from_millis(100))
            .expect("register");

        let err = pending.wait().await.expect_err("should time out");
        assert_eq!(
            err,
            ClientError::RequestTimeout {
                request_id: "slow".to_string(),
                timeout: Duration::from_millis(100),
            }
        );
        assert_eq!(correlator.pending_count(), 0);

        // A late reply can no longer resolve anything.
        assert!(matches!(
            correlator.resolve(reply("resp", "slow")),
            Resolution::Stale(_)
        ));
    }

    #[tokio::test]
    async fn test_reject_all_fails_every_request() {
        let correlator = RequestCorrelator::new();
        let waits: Vec<_> = (0..3)
            .map(|i| {
                correlator
                    .register(format!("r{i}"), ReplyMatcher::Any, Duration::from_secs(60))
                    .expect("register")
            })
            .collect();

        assert_eq!(correlator.reject_all(&ClientError::ConnectionClosed), 3);
        assert_eq!(correlator.pending_count(), 0);

        for pending in waits {
            assert_eq!(pending.wait().await, Err(ClientError::ConnectionClosed));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_send_counts_against_timeout() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register("blocked", ReplyMatcher::Any, Duration::from_millis(100))
            .expect("register");

        let err = pending
            .send_and_wait(std::future::pending())
            .await
            .expect_err("send never completes");

        assert_eq!(
            err,
            ClientError::RequestTimeout {
                request_id: "blocked".to_string(),
                timeout: Duration::from_millis(100),
            }
        );
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_all_ends_stuck_send() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register("blocked", ReplyMatcher::Any, Duration::from_secs(60))
            .expect("register");
        let handle = tokio::spawn(pending.send_and_wait(std::future::pending()));
        tokio::task::yield_now().await;

        assert_eq!(correlator.reject_all(&ClientError::ConnectionClosed), 1);

        assert_eq!(handle.await.expect("join"), Err(ClientError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_send_then_reply_resolves() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register("quick", ReplyMatcher::Any, Duration::from_secs(5))
            .expect("register");
        let resolver = correlator.clone();

        let reply = pending
            .send_and_wait(async move {
                assert!(matches!(
                    resolver.resolve(reply("resp", "quick")),
                    Resolution::Resolved
                ));
                Ok(())
            })
            .await
            .expect("reply");

        assert_eq!(reply.kind, "resp");
    }

    #[tokio::test]
    async fn test_failed_send_removes_entry() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register("lost", ReplyMatcher::Any, Duration::from_secs(5))
            .expect("register");

        let err = pending
            .send_and_wait(async { Err(ClientError::NotConnected) })
            .await
            .expect_err("send failed");

        assert_eq!(err, ClientError::NotConnected);
        assert!(!correlator.is_pending("lost"));
    }

    #[test]
    fn test_dropping_handle_removes_entry() {
        let correlator = RequestCorrelator::new();
        let pending = correlator
            .register("gone", ReplyMatcher::Any, Duration::from_secs(5))
            .expect("register");
        assert!(correlator.is_pending("gone"));

        drop(pending);

        assert!(!correlator.is_pending("gone"));
    }

    #[test]
    fn test_completed_history_is_bounded() {
        let mut registry = Registry::default();
        for i in 0..(COMPLETED_HISTORY + 10) {
            registry.mark_completed(format!("id-{i}"));
        }
        assert_eq!(registry.completed.len(), COMPLETED_HISTORY);
        assert!(!registry.completed_set.contains("id-0"));
        assert!(registry.completed_set.contains(&format!("id-{}", COMPLETED_HISTORY + 9)));
    }
}
