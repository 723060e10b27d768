//! Correlates outgoing queries with their responses.
//!
//! Every query gets a timeout. Whichever comes first, the response, the timeout or an explicit failure, resolves the
//! conversation exactly once by handing its callback back to the owner together with the outcome. A timed-out
//! conversation waits in a bounded post-timeout cache, and a late response is handed to its late callback, if it
//! registered one.
//!
//! The tracker is generic over the callback type `C` so the event loop can mix callers waiting on a channel with its
//! own internal conversations.

use crate::cache::TtlCache;
use crate::envelope::{response_type, Envelope, EnvelopeError, MessageKind};
use crate::errors::ConversationFailure;
use crate::identity::{MsgId, PeerId};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::strategy::AddressRecord;
use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const OUTSTANDING_CACHE_SIZE: usize = 10_000;
const INBOUND_CACHE_SIZE: usize = 10_000;

pub type Outcome = Result<Envelope, ConversationFailure>;

#[derive(Clone, Debug)]
pub struct TrackerSettings {
    pub post_timeout_cache_size: usize,
    pub post_timeout_max_age: Duration,
    pub outstanding_max_age: Duration,
    pub outstanding_handicap_factor: f64,
    pub freshness_cache_size: usize,
    /// How long we remember an incoming request we have not answered yet.
    pub pending_request_max_age: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        TrackerSettings {
            post_timeout_cache_size: 200,
            post_timeout_max_age: Duration::from_secs(900),
            outstanding_max_age: Duration::from_secs(1200),
            outstanding_handicap_factor: 256.0,
            freshness_cache_size: 1000,
            pending_request_max_age: Duration::from_secs(3600),
        }
    }
}

struct Conversation<C> {
    counterparty: PeerId,
    message_type: String,
    callback: C,
    late_callback: Option<C>,
    timeout: TaskHandle,
    started: Instant,
}

struct TimedOut<C> {
    counterparty: PeerId,
    message_type: String,
    started: Instant,
    late_callback: Option<C>,
}

/// A conversation that has come to an end. The owner delivers `outcome` through `callback`.
#[derive(Debug)]
pub struct Resolved<C> {
    pub msg_id: MsgId,
    pub counterparty: PeerId,
    pub message_type: String,
    pub callback: C,
    pub outcome: Outcome,
    pub elapsed: Duration,
    /// The response arrived after the conversation had already timed out.
    pub late: bool,
}

#[derive(Debug)]
pub enum Incoming<C> {
    /// A new request that should go to the handler registered for its type.
    Request { msg_id: MsgId, message_type: String, body: Option<Value> },
    /// A response that resolved one of our conversations.
    Response(Resolved<C>),
    /// Nothing to do: the message was logged and dropped.
    Dropped,
}

#[derive(Clone)]
struct PendingRequest {
    counterparty: PeerId,
    message_type: String,
}

pub struct ConversationTracker<C> {
    my_id: PeerId,
    settings: TrackerSettings,
    live: HashMap<MsgId, Conversation<C>>,
    timeouts: Scheduler<MsgId>,
    post_timeout: TtlCache<MsgId, TimedOut<C>>,
    outstanding: TtlCache<PeerId, u32>,
    freshness: TtlCache<PeerId, MsgId>,
    pending_requests: TtlCache<MsgId, PendingRequest>,
    /// Every request handed out for dispatch, answered or not.
    seen_requests: TtlCache<MsgId, ()>,
}

impl<C> ConversationTracker<C> {
    pub fn new(my_id: PeerId, settings: TrackerSettings) -> Self {
        ConversationTracker {
            my_id,
            live: HashMap::new(),
            timeouts: Scheduler::new(),
            post_timeout: TtlCache::new(settings.post_timeout_cache_size, Some(settings.post_timeout_max_age)),
            outstanding: TtlCache::new(OUTSTANDING_CACHE_SIZE, Some(settings.outstanding_max_age)),
            freshness: TtlCache::new(settings.freshness_cache_size, None),
            pending_requests: TtlCache::new(INBOUND_CACHE_SIZE, Some(settings.pending_request_max_age)),
            seen_requests: TtlCache::new(INBOUND_CACHE_SIZE, Some(settings.pending_request_max_age)),
            settings,
        }
    }

    /// Start a conversation. Returns the id of the query and its encoded envelope, ready to be sealed and sent.
    #[allow(clippy::too_many_arguments)]
    pub fn initiate(
        &mut self,
        counterparty: PeerId,
        message_type: &str,
        body: Option<Value>,
        metainfo: Option<&AddressRecord>,
        timeout: Duration,
        callback: C,
        late_callback: Option<C>,
        now: Instant,
    ) -> Result<(MsgId, Vec<u8>), EnvelopeError> {
        let freshness_proof = self.freshness.get(&counterparty, now).copied();
        let envelope = Envelope::initiating(message_type, body, counterparty, freshness_proof, metainfo)?;
        let encoded = envelope.encode()?;
        let msg_id = MsgId::digest(&encoded);
        let handle = self.timeouts.schedule(timeout, now, msg_id);
        let conversation = Conversation {
            counterparty,
            message_type: message_type.to_string(),
            callback,
            late_callback,
            timeout: handle,
            started: now,
        };
        self.live.insert(msg_id, conversation);
        let count = self.outstanding.get(&counterparty, now).copied().unwrap_or(0);
        self.outstanding.insert(counterparty, count + 1, now);
        trace!("Started conversation {msg_id} ({message_type}) with {counterparty}, timeout {timeout:?}");
        Ok((msg_id, encoded))
    }

    /// Resolve a conversation with a failure, for instance because its message could not be delivered. Unknown ids,
    /// including already resolved conversations, are ignored.
    pub fn fail(&mut self, msg_id: &MsgId, failure: ConversationFailure, now: Instant) -> Option<Resolved<C>> {
        let conversation = self.live.remove(msg_id)?;
        self.timeouts.cancel(conversation.timeout);
        debug!("Conversation {msg_id} with {} failed: {failure}", conversation.counterparty);
        let timed_out = TimedOut {
            counterparty: conversation.counterparty,
            message_type: conversation.message_type.clone(),
            started: conversation.started,
            late_callback: None,
        };
        self.post_timeout.insert(*msg_id, timed_out, now);
        Some(Resolved {
            msg_id: *msg_id,
            counterparty: conversation.counterparty,
            message_type: conversation.message_type,
            callback: conversation.callback,
            outcome: Err(failure),
            elapsed: now.saturating_duration_since(conversation.started),
            late: false,
        })
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.timeouts.next_deadline()
    }

    /// Time out every conversation whose deadline has passed.
    pub fn fire_timeouts(&mut self, now: Instant) -> Vec<Resolved<C>> {
        let mut resolved = Vec::new();
        for msg_id in self.timeouts.pop_due(now) {
            let Some(conversation) = self.live.remove(&msg_id) else {
                continue;
            };
            let (kind, counterparty) = (&conversation.message_type, conversation.counterparty);
            debug!("⏰ Conversation {msg_id} ({kind}) with {counterparty} timed out");
            let timed_out = TimedOut {
                counterparty: conversation.counterparty,
                message_type: conversation.message_type.clone(),
                started: conversation.started,
                late_callback: conversation.late_callback,
            };
            self.post_timeout.insert(msg_id, timed_out, now);
            resolved.push(Resolved {
                msg_id,
                counterparty: conversation.counterparty,
                message_type: conversation.message_type,
                callback: conversation.callback,
                outcome: Err(ConversationFailure::Timeout),
                elapsed: now.saturating_duration_since(conversation.started),
                late: false,
            });
        }
        resolved
    }

    /// Classify and correlate a decrypted message from `counterparty`.
    pub fn handle_incoming(
        &mut self,
        counterparty: PeerId,
        msg_id: MsgId,
        envelope: Envelope,
        now: Instant,
    ) -> Incoming<C> {
        self.freshness.insert(counterparty, msg_id, now);
        match envelope.kind() {
            Ok(MessageKind::Initiating { recipient, .. }) => {
                if recipient != self.my_id {
                    warn!("Dropping message {msg_id} from {counterparty} addressed to {recipient}");
                    return Incoming::Dropped;
                }
                if self.seen_requests.contains(&msg_id, now) {
                    debug!("Dropping duplicate request {msg_id} from {counterparty}");
                    return Incoming::Dropped;
                }
                let message_type = envelope.header.message_type.clone();
                let pending = PendingRequest { counterparty, message_type: message_type.clone() };
                self.seen_requests.insert(msg_id, (), now);
                self.pending_requests.insert(msg_id, pending, now);
                Incoming::Request { msg_id, message_type, body: envelope.body }
            }
            Ok(MessageKind::Response { reference }) => self.handle_response(counterparty, reference, envelope, now),
            Err(e) => {
                warn!("Dropping message {msg_id} from {counterparty}: {e}");
                Incoming::Dropped
            }
        }
    }

    fn handle_response(
        &mut self,
        counterparty: PeerId,
        reference: MsgId,
        envelope: Envelope,
        now: Instant,
    ) -> Incoming<C> {
        let response_kind = envelope.header.message_type.clone();
        if let Some(conversation) = self.live.get(&reference) {
            if conversation.counterparty != counterparty {
                let asked = conversation.counterparty;
                warn!("Dropping response to {reference} from {counterparty}, the query went to {asked}");
                return Incoming::Dropped;
            }
            if response_type(&conversation.message_type) != response_kind {
                let query_kind = &conversation.message_type;
                warn!("Dropping '{response_kind}' from {counterparty} in response to a '{query_kind}'");
                return Incoming::Dropped;
            }
            let Some(conversation) = self.live.remove(&reference) else {
                return Incoming::Dropped;
            };
            self.timeouts.cancel(conversation.timeout);
            self.decrement_outstanding(&counterparty, now);
            return Incoming::Response(Resolved {
                msg_id: reference,
                counterparty,
                message_type: conversation.message_type,
                callback: conversation.callback,
                outcome: outcome_of(envelope),
                elapsed: now.saturating_duration_since(conversation.started),
                late: false,
            });
        }
        let matches = self.post_timeout.get(&reference, now).map(|t| t.counterparty == counterparty);
        match matches {
            Some(true) => {}
            Some(false) => {
                warn!("Dropping late response to {reference} from {counterparty}, who was not asked");
                return Incoming::Dropped;
            }
            None => {
                debug!("Dropping response to unknown or expired conversation {reference} from {counterparty}");
                return Incoming::Dropped;
            }
        }
        let Some(timed_out) = self.post_timeout.remove(&reference) else {
            return Incoming::Dropped;
        };
        self.decrement_outstanding(&counterparty, now);
        let elapsed = now.saturating_duration_since(timed_out.started);
        let secs = elapsed.as_secs_f64();
        info!("Received '{response_kind}' to {reference} from {counterparty} {secs:.2}s after it was sent");
        match timed_out.late_callback {
            Some(callback) if response_type(&timed_out.message_type) == response_kind => Incoming::Response(Resolved {
                msg_id: reference,
                counterparty,
                message_type: timed_out.message_type,
                callback,
                outcome: outcome_of(envelope),
                elapsed,
                late: true,
            }),
            _ => Incoming::Dropped,
        }
    }

    fn decrement_outstanding(&mut self, counterparty: &PeerId, now: Instant) {
        if let Some(count) = self.outstanding.get_mut(counterparty, now) {
            *count = count.saturating_sub(1);
        }
    }

    /// Build the response to a request we received. Returns `None` when the request is unknown or already answered.
    pub fn respond(
        &mut self,
        request_id: &MsgId,
        body: Option<Value>,
        failure: Option<&str>,
        metainfo: Option<&AddressRecord>,
        now: Instant,
    ) -> Result<Option<(PeerId, Vec<u8>)>, EnvelopeError> {
        let Some(pending) = self.pending_requests.remove(request_id) else {
            return Ok(None);
        };
        let freshness_proof = self.freshness.get(&pending.counterparty, now).copied();
        let mut envelope = Envelope::response(&pending.message_type, body, *request_id, freshness_proof, metainfo)?;
        if let Some(reason) = failure {
            envelope = envelope.with_failure(reason);
        }
        Ok(Some((pending.counterparty, envelope.encode()?)))
    }

    /// Forget a request that will never be answered.
    pub fn drop_request(&mut self, request_id: &MsgId) {
        self.pending_requests.remove(request_id);
    }

    #[cfg(test)]
    fn is_unsatisfied(&self, msg_id: &MsgId) -> bool {
        self.live.contains_key(msg_id)
    }

    /// Number of conversations still waiting for their response.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn outstanding(&mut self, counterparty: &PeerId, now: Instant) -> u32 {
        self.outstanding.get(counterparty, now).copied().unwrap_or(0)
    }

    /// A handicap for counterparties that owe us many responses.
    pub fn pending_responses_handicap(&mut self, counterparty: &PeerId, now: Instant) -> f64 {
        self.outstanding(counterparty, now) as f64 * self.settings.outstanding_handicap_factor
    }

    pub fn freshness_proof(&mut self, counterparty: &PeerId, now: Instant) -> Option<MsgId> {
        self.freshness.get(counterparty, now).copied()
    }

    pub fn expire(&mut self, now: Instant) {
        self.post_timeout.expire(now);
        self.outstanding.expire(now);
        self.pending_requests.expire(now);
        self.seen_requests.expire(now);
    }

    /// Fail every live conversation and forget everything else.
    pub fn shutdown(&mut self, now: Instant) -> Vec<Resolved<C>> {
        let resolved = self
            .live
            .drain()
            .map(|(msg_id, c)| Resolved {
                msg_id,
                counterparty: c.counterparty,
                message_type: c.message_type,
                callback: c.callback,
                outcome: Err(ConversationFailure::Shutdown),
                elapsed: now.saturating_duration_since(c.started),
                late: false,
            })
            .collect();
        self.timeouts.clear();
        self.post_timeout.clear();
        self.outstanding.clear();
        self.freshness.clear();
        self.pending_requests.clear();
        self.seen_requests.clear();
        resolved
    }
}

fn outcome_of(envelope: Envelope) -> Outcome {
    match envelope.failure() {
        Some(reason) => Err(ConversationFailure::Remote(reason)),
        None => Ok(envelope),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    const FIVE_SECONDS: Duration = Duration::from_secs(5);

    struct Pair {
        alice: ConversationTracker<&'static str>,
        bob: ConversationTracker<&'static str>,
        a: PeerId,
        b: PeerId,
    }

    fn pair() -> Pair {
        let a = PeerId::digest(b"alice");
        let b = PeerId::digest(b"bob");
        Pair {
            alice: ConversationTracker::new(a, TrackerSettings::default()),
            bob: ConversationTracker::new(b, TrackerSettings::default()),
            a,
            b,
        }
    }

    fn deliver<C>(to: &mut ConversationTracker<C>, from: PeerId, bytes: &[u8], now: Instant) -> Incoming<C> {
        let envelope = Envelope::decode(bytes).expect("decode");
        to.handle_incoming(from, MsgId::digest(bytes), envelope, now)
    }

    #[test]
    fn request_and_response() {
        let Pair { mut alice, mut bob, a, b } = pair();
        let t0 = Instant::now();
        let body = Some(json!({"n": 1}));
        let timeout = Duration::from_secs(5);
        let (id, query) = alice.initiate(b, "ping", body, None, timeout, "done", None, t0).expect("initiate");
        assert_eq!(alice.outstanding(&b, t0), 1);
        let Incoming::Request { msg_id, message_type, body } = deliver(&mut bob, a, &query, t0) else {
            panic!("expected a request");
        };
        assert_eq!((msg_id, message_type.as_str(), body), (id, "ping", Some(json!({"n": 1}))));
        assert!(matches!(deliver(&mut bob, a, &query, t0), Incoming::Dropped), "duplicates are dropped");

        let (to, reply) = bob.respond(&id, Some(json!("pong")), None, None, t0).expect("encode").expect("pending");
        assert_eq!(to, a);
        assert!(bob.respond(&id, None, None, None, t0).expect("encode").is_none(), "responds only once");
        let again = deliver(&mut bob, a, &query, t0 + Duration::from_millis(100));
        assert!(matches!(again, Incoming::Dropped), "answered requests are not dispatched again");

        let later = t0 + Duration::from_millis(300);
        let Incoming::Response(resolved) = deliver(&mut alice, b, &reply, later) else {
            panic!("expected a response");
        };
        assert_eq!(resolved.callback, "done");
        assert!(!resolved.late);
        assert_eq!(resolved.elapsed, Duration::from_millis(300));
        assert_eq!(resolved.outcome.expect("success").body, Some(json!("pong")));
        assert_eq!(alice.outstanding(&b, later), 0);
        assert!(alice.fire_timeouts(t0 + Duration::from_secs(10)).is_empty(), "timer was cancelled");
        assert!(matches!(deliver(&mut alice, b, &reply, later), Incoming::Dropped));
    }

    #[test]
    fn timeout_then_late_response() {
        let Pair { mut alice, mut bob, a, b } = pair();
        let t0 = Instant::now();
        let (id, query) =
            alice.initiate(b, "ping", None, None, FIVE_SECONDS, "outcome", Some("late"), t0).expect("initiate");
        assert!(matches!(deliver(&mut bob, a, &query, t0), Incoming::Request { .. }));

        assert!(alice.fire_timeouts(t0 + Duration::from_millis(4999)).is_empty());
        let fired = alice.fire_timeouts(t0 + Duration::from_secs(5));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].callback, "outcome");
        assert_eq!(fired[0].outcome.as_ref().err(), Some(&ConversationFailure::Timeout));
        assert!(fired[0].elapsed >= Duration::from_secs(5) && fired[0].elapsed < Duration::from_secs(6));
        assert!(alice.fire_timeouts(t0 + Duration::from_secs(6)).is_empty());

        let (_, reply) = bob.respond(&id, None, None, None, t0).expect("encode").expect("pending");
        let Incoming::Response(late) = deliver(&mut alice, b, &reply, t0 + Duration::from_secs(7)) else {
            panic!("expected the late callback");
        };
        assert_eq!(late.callback, "late");
        assert!(late.late);
        assert!(late.outcome.is_ok());
        assert!(matches!(deliver(&mut alice, b, &reply, t0 + Duration::from_secs(8)), Incoming::Dropped));
    }

    #[test]
    fn late_response_without_late_callback_is_dropped() {
        let Pair { mut alice, mut bob, a, b } = pair();
        let t0 = Instant::now();
        let one_second = Duration::from_secs(1);
        let (id, query) = alice.initiate(b, "ping", None, None, one_second, "first", None, t0).expect("initiate");
        deliver(&mut bob, a, &query, t0);
        assert_eq!(alice.fire_timeouts(t0 + Duration::from_secs(1)).len(), 1);
        assert_eq!(alice.outstanding(&b, t0), 1, "timed out queries still count");
        let (_, reply) = bob.respond(&id, None, None, None, t0).expect("encode").expect("pending");
        assert!(matches!(deliver(&mut alice, b, &reply, t0 + Duration::from_secs(2)), Incoming::Dropped));
        assert_eq!(alice.outstanding(&b, t0), 0);
    }

    #[test]
    fn responses_must_match_counterparty_and_type() {
        let Pair { mut alice, a: _, b, .. } = pair();
        let mallory = PeerId::digest(b"mallory");
        let t0 = Instant::now();
        let (id, _) = alice.initiate(b, "ping", None, None, FIVE_SECONDS, "first", None, t0).expect("initiate");
        let forged = Envelope::response("ping", None, id, None, None).expect("envelope").encode().expect("encode");
        assert!(matches!(deliver(&mut alice, mallory, &forged, t0), Incoming::Dropped));
        let wrong_type = Envelope::response("pong", None, id, None, None).expect("envelope").encode().expect("encode");
        assert!(matches!(deliver(&mut alice, b, &wrong_type, t0), Incoming::Dropped));
        assert!(alice.is_unsatisfied(&id), "mismatched responses do not consume the conversation");
        assert!(matches!(deliver(&mut alice, b, &forged, t0), Incoming::Response(_)));
    }

    #[test]
    fn remote_failures_and_transport_failures() {
        let Pair { mut alice, mut bob, a, b } = pair();
        let t0 = Instant::now();
        let (id, query) = alice.initiate(b, "ping", None, None, FIVE_SECONDS, "first", None, t0).expect("initiate");
        deliver(&mut bob, a, &query, t0);
        let (_, reply) = bob.respond(&id, None, Some("no thanks"), None, t0).expect("encode").expect("pending");
        let Incoming::Response(resolved) = deliver(&mut alice, b, &reply, t0) else {
            panic!("expected a response");
        };
        assert_eq!(resolved.outcome.err(), Some(ConversationFailure::Remote("no thanks".into())));

        let (id2, _) = alice.initiate(b, "ping", None, None, FIVE_SECONDS, "second", None, t0).expect("initiate");
        let failed = alice.fail(&id2, ConversationFailure::NoAddress, t0).expect("live conversation");
        assert_eq!(failed.callback, "second");
        assert!(alice.fail(&id2, ConversationFailure::NoAddress, t0).is_none(), "fails only once");
        assert!(alice.fire_timeouts(t0 + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn freshness_proof_tracks_last_message() {
        let Pair { mut alice, mut bob, a, b } = pair();
        let t0 = Instant::now();
        let (_, q1) = alice.initiate(b, "ping", None, None, FIVE_SECONDS, "first", None, t0).expect("initiate");
        deliver(&mut bob, a, &q1, t0);
        assert_eq!(bob.freshness_proof(&a, t0), Some(MsgId::digest(&q1)));
        let (_, q2) = bob.initiate(a, "ping", None, None, FIVE_SECONDS, "first", None, t0).expect("initiate");
        let header = Envelope::decode(&q2).expect("decode").header;
        assert_eq!(header.freshness_proof, Some(MsgId::digest(&q1)));
    }

    #[test]
    fn malformed_and_misaddressed_messages_are_dropped() {
        let Pair { mut alice, b, .. } = pair();
        let t0 = Instant::now();
        let stranger = PeerId::digest(b"stranger");
        let misaddressed = Envelope::initiating("ping", None, stranger, None, None).expect("envelope");
        let bytes = misaddressed.encode().expect("encode");
        assert!(matches!(deliver(&mut alice, b, &bytes, t0), Incoming::Dropped));
        let mut broken = Envelope::initiating("ping", None, alice.my_id, None, None).expect("envelope");
        broken.header.reference = Some(stranger);
        let bytes = broken.encode().expect("encode");
        assert!(matches!(deliver(&mut alice, b, &bytes, t0), Incoming::Dropped));
    }

    #[test]
    fn shutdown_fails_everything_once() {
        let Pair { mut alice, b, .. } = pair();
        let t0 = Instant::now();
        alice.initiate(b, "a", None, None, FIVE_SECONDS, "first", None, t0).expect("initiate");
        alice.initiate(b, "b", None, None, FIVE_SECONDS, "second", None, t0).expect("initiate");
        let mut failed: Vec<_> = alice.shutdown(t0).into_iter().map(|r| (r.callback, r.outcome.err())).collect();
        failed.sort_by_key(|(c, _)| *c);
        let shutdown = Some(ConversationFailure::Shutdown);
        assert_eq!(failed, vec![("first", shutdown.clone()), ("second", shutdown)]);
        assert!(alice.fire_timeouts(t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(alice.pending_responses_handicap(&b, t0), 0.0);
    }
}
