//! The event loop owns all protocol state and runs in a single task.
//!
//! It reacts to four kinds of input: [`Command`]s from clients, [`IoEvent`]s from the socket tasks, completed lookups
//! and publications, and its own deadlines (conversation timeouts, relay polls and housekeeping). Nothing else touches
//! the session, conversation or connection state, so none of it needs locking.

use crate::config::EgtpConfig;
use crate::connection::{spawn_accept, spawn_connect, Connection};
use crate::conversation::{ConversationTracker, Incoming, Outcome, Resolved, TrackerSettings};
use crate::envelope::{message_id, Envelope};
use crate::errors::{ConversationFailure, TransportError};
use crate::handicapper::HandicapperSet;
use crate::handlers::{HandlerOutcome, HandlerRegistry, IncomingRequest, Responder};
use crate::hints::CommHints;
use crate::identity::{MsgId, NodeIdentity, PeerId, PublicKey};
use crate::lookup::{Lookup, LookupError, RelayDiscovery};
use crate::message_types::{Command, IoEvent, NodeStats, SendOptions};
use crate::pool::{ConnId, ConnectionPool, PooledConnection};
use crate::relay::{BundledMessages, MessageForYou, PollRequest, RelayRouter, RelayTask};
use crate::relay::{ARE_THERE_MESSAGES, MESSAGE_FOR_YOU};
use crate::scheduler::Scheduler;
use crate::session::{ParsedMessage, SessionCrypto, SessionError};
use crate::strategy::{choose_best, is_routable, AddressRecord, CommStrategy, StrategyError, TcpStrategy};
use crate::strategy::{RelayStrategy, RELAY_MESSAGE_TYPE};
use crate::transaction::{HelloCache, OwnAddress, Reachability, RttStats};
use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use log::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Pool keys. Accepted connections are keyed by their id until the first message tells us who is on the other end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum PoolKey {
    Peer(PeerId),
    Inbound(ConnId),
}

impl Display for PoolKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKey::Peer(id) => write!(f, "{id}"),
            PoolKey::Inbound(conn) => write!(f, "inbound #{conn}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Purpose {
    Query(MsgId),
    Response,
}

/// A plaintext message on its way to a counterparty, kept until its bytes are written so a failed send can be retried.
#[derive(Clone, Debug)]
pub(crate) struct Transmission {
    recipient: PeerId,
    plaintext: Vec<u8>,
    purpose: Purpose,
    hints: CommHints,
    attempt: u8,
}

/// Rides along with every queued send.
#[derive(Debug)]
pub(crate) enum SendTicket {
    Message(Transmission),
    /// Session control traffic. Nobody waits for it.
    Control,
}

/// Who hears about the end of a conversation.
enum Reply {
    Caller(oneshot::Sender<Outcome>),
    /// A message we asked a relayer to pass along.
    PassAlong(Transmission),
    Poll(PeerId),
}

enum Completion {
    Lookup { id: PeerId, result: Result<AddressRecord, LookupError> },
    Discovery(Result<Vec<PeerId>, LookupError>),
    Published(Result<(), LookupError>),
}

#[derive(Clone, Copy, Debug)]
enum Via {
    Conn(ConnId),
    Relayer(PeerId),
    Loopback,
}

impl Display for Via {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Via::Conn(conn) => write!(f, "connection #{conn}"),
            Via::Relayer(relayer) => write!(f, "relayer {relayer}"),
            Via::Loopback => write!(f, "loopback"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Timer {
    Cleanup,
}

pub struct EventLoop {
    config: EgtpConfig,
    my_id: PeerId,
    session: SessionCrypto,
    strategies: HashMap<PeerId, CommStrategy>,
    pool: ConnectionPool<PoolKey, Connection<SendTicket>>,
    next_conn_id: ConnId,
    tracker: ConversationTracker<Reply>,
    rtt: RttStats,
    hello: HelloCache,
    own_address: OwnAddress,
    handlers: HandlerRegistry,
    relay: RelayRouter,
    handicappers: HandicapperSet,
    timers: Scheduler<Timer>,
    lookup: Arc<dyn Lookup>,
    discovery: Arc<dyn RelayDiscovery>,
    pending_lookups: HashMap<PeerId, Vec<Transmission>>,
    completions: FuturesUnordered<BoxFuture<'static, Completion>>,
    command_receiver: mpsc::Receiver<Command>,
    io_sender: mpsc::UnboundedSender<IoEvent>,
    io_receiver: mpsc::UnboundedReceiver<IoEvent>,
    listener: Option<TcpListener>,
    listen_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn new(
        config: EgtpConfig,
        identity: NodeIdentity,
        listener: Option<TcpListener>,
        lookup: Arc<dyn Lookup>,
        discovery: Arc<dyn RelayDiscovery>,
        command_receiver: mpsc::Receiver<Command>,
    ) -> Self {
        let my_id = identity.peer_id();
        let own_address = OwnAddress::new(identity.public_key());
        let settings = TrackerSettings {
            post_timeout_cache_size: config.post_timeout_cache_size,
            post_timeout_max_age: config.post_timeout_max_age,
            outstanding_max_age: config.outstanding_max_age,
            outstanding_handicap_factor: config.outstanding_handicap_factor,
            freshness_cache_size: config.freshness_cache_size,
            ..Default::default()
        };
        let rtt = RttStats::new(
            config.default_timeout_mean,
            config.default_timeout_sigma,
            config.rtt_time_constant,
            config.max_timeout,
        );
        let listen_addr = listener.as_ref().and_then(|l| l.local_addr().ok());
        let (io_sender, io_receiver) = mpsc::unbounded();
        EventLoop {
            my_id,
            session: SessionCrypto::new(identity),
            strategies: HashMap::new(),
            pool: ConnectionPool::new(config.pool_limits()),
            next_conn_id: 1,
            tracker: ConversationTracker::new(my_id, settings),
            rtt,
            hello: HelloCache::new(config.hello_cache_size, config.hello_max_age),
            own_address,
            handlers: HandlerRegistry::new(),
            relay: RelayRouter::new(config.relay.clone()),
            handicappers: HandicapperSet::new(),
            timers: Scheduler::new(),
            lookup,
            discovery,
            pending_lookups: HashMap::new(),
            completions: FuturesUnordered::new(),
            command_receiver,
            io_sender,
            io_receiver,
            listener,
            listen_addr,
            accept_task: None,
            config,
        }
    }

    pub async fn run(mut self) {
        let now = Instant::now();
        if let Some(listener) = self.listener.take() {
            info!("👂 {} listening on {:?}", self.my_id, self.listen_addr);
            self.accept_task = Some(spawn_accept(listener, self.io_sender.clone()));
        }
        self.refresh_own_address();
        self.relay.start(now);
        self.timers.schedule(self.config.cleanup_interval, now, Timer::Cleanup);
        loop {
            let wakeup = tokio::time::Instant::from_std(self.next_deadline());
            tokio::select! {
                command = self.command_receiver.next() => match command {
                    Some(Command::Shutdown { sender }) => {
                        self.shutdown();
                        let _ = sender.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("Every client is gone. Shutting down.");
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.io_receiver.next() => self.handle_io_event(event),
                Some(done) = self.completions.next(), if !self.completions.is_empty() => {
                    self.handle_completion(done)
                }
                _ = tokio::time::sleep_until(wakeup) => self.handle_deadlines(Instant::now()),
            }
        }
        info!("Event loop for {} has stopped", self.my_id);
    }

    fn next_deadline(&self) -> Instant {
        [self.tracker.next_timeout(), self.relay.next_deadline(), self.timers.next_deadline()]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP)
    }

    fn handle_command(&mut self, command: Command) {
        trace!("Command: {command}");
        let now = Instant::now();
        match command {
            Command::Send { recipient, message_type, body, options, outcome, late } => {
                let late = late.map(Reply::Caller);
                self.start_conversation(recipient, &message_type, body, options, Reply::Caller(outcome), late, now);
            }
            Command::RegisterHandler { message_type, handler, sender } => {
                self.handlers.register(&message_type, handler);
                let _ = sender.send(());
            }
            Command::UnregisterHandler { message_type, sender } => {
                let _ = sender.send(self.handlers.unregister(&message_type));
            }
            Command::Respond { responder, body, failure, hints, sender } => {
                let responded = self.respond(responder, body, failure, hints, now);
                let _ = sender.send(responded);
            }
            Command::UseAddress { record, sender } => {
                let result = match record.peer_id() {
                    Some(id) => self.use_record(id, &record).map(|_| id),
                    None => Err(StrategyError::UnsupportedType("a record without a public key".into())),
                };
                let _ = sender.send(result);
            }
            Command::AddHandicapper { handicapper, sender } => {
                self.handicappers.add(handicapper);
                let _ = sender.send(());
            }
            Command::OwnAddress { sender } => {
                let _ = sender.send(self.own_address.record().cloned());
            }
            Command::Stats { sender } => {
                let stats = NodeStats {
                    connections: self.pool.len(),
                    known_strategies: self.strategies.len(),
                    conversations: self.tracker.live_count(),
                    preferred_relayers: self.relay.preferred().to_vec(),
                    listen_addr: self.listen_addr,
                };
                let _ = sender.send(stats);
            }
            // Handled by the loop itself
            Command::Shutdown { .. } => {}
        }
    }

    //------------------------------------------   Sending   ------------------------------------------------------//

    #[allow(clippy::too_many_arguments)]
    fn start_conversation(
        &mut self,
        recipient: PeerId,
        message_type: &str,
        body: Option<Value>,
        options: SendOptions,
        reply: Reply,
        late: Option<Reply>,
        now: Instant,
    ) {
        let metainfo = self.metainfo_for(&recipient, now);
        let timeout = options.timeout.unwrap_or_else(|| self.rtt.timeout_for(&recipient, message_type));
        let initiated =
            self.tracker.initiate(recipient, message_type, body, metainfo.as_ref(), timeout, reply, late, now);
        match initiated {
            Ok((msg_id, plaintext)) => {
                let hints = options.hints | CommHints::EXPECT_RESPONSE;
                let transmission =
                    Transmission { recipient, plaintext, purpose: Purpose::Query(msg_id), hints, attempt: 0 };
                self.transmit(transmission, now);
            }
            Err(e) => error!("Could not build a '{message_type}' message for {recipient}: {e}"),
        }
    }

    /// Our own address record, if the counterparty has not heard it from us recently.
    fn metainfo_for(&mut self, recipient: &PeerId, now: Instant) -> Option<AddressRecord> {
        if !self.config.send_metainfo || *recipient == self.my_id {
            return None;
        }
        let record = self.own_address.record()?.clone();
        self.hello.should_attach(recipient, now).then_some(record)
    }

    fn respond(
        &mut self,
        responder: Responder,
        body: Option<Value>,
        failure: Option<String>,
        hints: CommHints,
        now: Instant,
    ) -> bool {
        let metainfo = self.metainfo_for(&responder.counterparty, now);
        match self.tracker.respond(&responder.request_id, body, failure.as_deref(), metainfo.as_ref(), now) {
            Ok(Some((recipient, plaintext))) => {
                let hints = hints | CommHints::THIS_IS_A_RESPONSE;
                let transmission = Transmission { recipient, plaintext, purpose: Purpose::Response, hints, attempt: 0 };
                self.transmit(transmission, now);
                true
            }
            Ok(None) => {
                debug!("No pending {responder}. It was already answered or has expired.");
                false
            }
            Err(e) => {
                error!("Could not build the response to {responder}: {e}");
                false
            }
        }
    }

    fn transmit(&mut self, t: Transmission, now: Instant) {
        if t.recipient == self.my_id {
            let _ = self.io_sender.unbounded_send(IoEvent::Loopback { plaintext: t.plaintext });
            return;
        }
        let Some(strategy) = self.strategies.get(&t.recipient) else {
            self.await_lookup(t);
            return;
        };
        let relay = match strategy.bottom() {
            CommStrategy::Relay(relay) => Some(relay.clone()),
            _ => None,
        };
        let sealed = match self.session.generate_message(&t.recipient, &t.plaintext) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.send_failed(SendTicket::Message(t), TransportError::NoStrategy(e.to_string()), now);
                return;
            }
        };
        match relay {
            Some(relay) => self.relay_send(t, &sealed, relay, now),
            None => self.tcp_send(t, &sealed, now),
        }
    }

    fn tcp_send(&mut self, t: Transmission, sealed: &[u8], now: Instant) {
        let conn = match self.connection_for(&t.recipient, now) {
            Ok(conn) => conn,
            Err(e) => return self.send_failed(SendTicket::Message(t), e, now),
        };
        if let Some(tcp) = self.strategies.get_mut(&t.recipient).and_then(|s| s.as_tcp_mut()) {
            tcp.hints.record_send(t.hints);
        }
        let last_words = t.hints.contains(CommHints::EXPECT_NO_MORE_COMMS);
        let Some(connection) = self.pool.get_by_id_mut(conn) else {
            let error = TransportError::ConnectionClosed("the connection went away".into());
            return self.send_failed(SendTicket::Message(t), error, now);
        };
        match connection.send(sealed, SendTicket::Message(t), now) {
            Ok(()) if last_words => connection.close_when_drained(),
            Ok(()) => {}
            Err(rejected) => self.send_failed(rejected.ticket, rejected.error, now),
        }
    }

    /// The connection to send to `recipient` on. Dials a new one if the strategy knows an address but has no open
    /// connection.
    fn connection_for(&mut self, recipient: &PeerId, now: Instant) -> Result<ConnId, TransportError> {
        let Some(tcp) = self.strategies.get(recipient).and_then(|s| s.as_tcp()) else {
            return Err(TransportError::NoStrategy(format!("{recipient} cannot be reached over TCP")));
        };
        if let Some(conn) = tcp.conn {
            if self.pool.get_by_id_mut(conn).is_some_and(|c| !c.is_closing()) {
                return Ok(conn);
            }
        }
        let (Some(host), Some(port)) = (tcp.host.clone(), tcp.port) else {
            return Err(TransportError::NoStrategy(format!("no address for {recipient} and no open connection")));
        };
        let id = self.next_conn_id();
        let conn = Connection::connecting(id, format!("{host}:{port}"), self.config.max_message_size, now);
        self.admit(PoolKey::Peer(*recipient), conn, now)?;
        debug!("Dialling {recipient} at {host}:{port} on connection #{id}");
        spawn_connect(id, host, port, self.config.connect_timeout, self.io_sender.clone());
        if let Some(tcp) = self.strategies.get_mut(recipient).and_then(|s| s.as_tcp_mut()) {
            tcp.conn = Some(id);
        }
        Ok(id)
    }

    fn next_conn_id(&mut self) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    fn admit(&mut self, key: PoolKey, conn: Connection<SendTicket>, now: Instant) -> Result<(), TransportError> {
        let strategies = &self.strategies;
        match self.pool.insert(key, conn, |k| pool_hints(strategies, k), now) {
            Ok(evicted) => {
                for (key, conn) in evicted {
                    let error = TransportError::ConnectionClosed("evicted from the connection pool".into());
                    self.close_connection(key, conn, error, now);
                }
                Ok(())
            }
            Err((e, mut conn)) => {
                debug!("Refusing {conn}: {e}");
                conn.close();
                Err(TransportError::TooManyBusyConnections)
            }
        }
    }

    fn relay_send(&mut self, t: Transmission, sealed: &[u8], relay: RelayStrategy, now: Instant) {
        if let Err(e) = relay.check_forward(&self.my_id, None) {
            return self.send_failed(SendTicket::Message(t), e, now);
        }
        let body = match serde_json::to_value(relay.pass_along_body(t.recipient, sealed)) {
            Ok(body) => body,
            Err(e) => {
                let error = TransportError::RelayFailed(e.to_string());
                return self.send_failed(SendTicket::Message(t), error, now);
            }
        };
        trace!("Asking {} to pass a message along to {}", relay.relayer_id, t.recipient);
        let relayer = relay.relayer_id;
        let options = SendOptions { timeout: None, hints: t.hints & CommHints::EXPECT_MORE_TRANSACTIONS };
        self.start_conversation(relayer, RELAY_MESSAGE_TYPE, Some(body), options, Reply::PassAlong(t), None, now);
    }

    /// A send did not make it. The first failure forgets the strategy and retries through a fresh lookup; the second
    /// fails the conversation.
    fn send_failed(&mut self, ticket: SendTicket, error: TransportError, now: Instant) {
        let SendTicket::Message(t) = ticket else {
            return;
        };
        if t.attempt == 0 {
            debug!("Send to {} failed: {error}. Retrying with a fresh address.", t.recipient);
            self.forget_strategy(&t.recipient, now);
            self.transmit(Transmission { attempt: 1, ..t }, now);
            return;
        }
        warn!("Giving up on a message to {}: {error}", t.recipient);
        self.give_up(t, error.into(), now);
    }

    fn give_up(&mut self, t: Transmission, failure: ConversationFailure, now: Instant) {
        match t.purpose {
            Purpose::Query(msg_id) => {
                if let Some(resolved) = self.tracker.fail(&msg_id, failure, now) {
                    self.resolve(resolved, now);
                }
            }
            Purpose::Response => debug!("Dropped a response to {}: {failure}", t.recipient),
        }
    }

    fn await_lookup(&mut self, t: Transmission) {
        let id = t.recipient;
        let waiting = self.pending_lookups.entry(id).or_default();
        waiting.push(t);
        if waiting.len() > 1 {
            return;
        }
        debug!("🔍 Looking up the address of {id}");
        let lookup = self.lookup.clone();
        let task = async move {
            let result = match tokio::time::timeout(LOOKUP_TIMEOUT, lookup.lookup(id)).await {
                Ok(result) => result,
                Err(_) => Err(LookupError::SoftTimeout),
            };
            Completion::Lookup { id, result }
        };
        self.completions.push(task.boxed());
    }

    //------------------------------------------   Receiving   ----------------------------------------------------//

    fn handle_wire(&mut self, wire: &[u8], via: Via, now: Instant) {
        let ParsedMessage { sender, sender_key, plaintext } = match self.session.parse(wire) {
            Ok(parsed) => parsed,
            Err(SessionError::UnknownSession { session_id, invalidate_msg }) => {
                debug!("Message for unknown session {session_id} via {via}. Asking the sender to start over.");
                if let Via::Conn(conn) = via {
                    self.send_control(conn, &invalidate_msg, now);
                }
                return;
            }
            Err(SessionError::SessionInvalidated { counterparty, session_id }) => {
                debug!("{counterparty} dropped session {session_id}. The next message starts a new one.");
                return;
            }
            Err(e) => {
                warn!("Dropping a message via {via}: {e}");
                return;
            }
        };
        if let Via::Conn(conn) = via {
            self.learn_connection(sender, sender_key, conn, now);
        }
        self.handle_plaintext(sender, plaintext, via, now);
    }

    fn send_control(&mut self, conn: ConnId, bytes: &[u8], now: Instant) {
        if let Some(connection) = self.pool.get_by_id_mut(conn) {
            if let Err(rejected) = connection.send(bytes, SendTicket::Control, now) {
                debug!("Could not send control message: {}", rejected.error);
            }
        }
    }

    /// The first authenticated message on a connection tells us who is on the other end. From then on the connection
    /// is one way to reach them.
    fn learn_connection(&mut self, sender: PeerId, key: PublicKey, conn: ConnId, now: Instant) {
        if self.pool.key_of(conn) == Some(&PoolKey::Inbound(conn)) {
            let peer_key = PoolKey::Peer(sender);
            let taken = self.pool.get(&peer_key).is_some_and(|c| !c.is_closing());
            if !taken {
                if let Some((key, old)) = self.pool.rekey(&PoolKey::Inbound(conn), peer_key) {
                    let error = TransportError::ConnectionClosed("replaced by a newer connection".into());
                    self.close_connection(key, old, error, now);
                }
            }
        }
        let lower = CommStrategy::Tcp(TcpStrategy::on_connection(conn, Some(sender)));
        self.adopt_strategy(sender, CommStrategy::crypto(key, lower));
    }

    fn handle_plaintext(&mut self, sender: PeerId, plaintext: Vec<u8>, via: Via, now: Instant) {
        let msg_id = message_id(&plaintext);
        let envelope = match Envelope::decode(&plaintext) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping message {msg_id} from {sender} via {via}: {e}");
                return;
            }
        };
        if sender != self.my_id {
            if let Some(record) = envelope.sender_address() {
                match self.use_record(sender, &record) {
                    Ok(()) => trace!("Learned an address for {sender} from their message"),
                    Err(e) => debug!("Ignoring the address {sender} sent us: {e}"),
                }
            }
        }
        match self.tracker.handle_incoming(sender, msg_id, envelope, now) {
            Incoming::Request { msg_id, message_type, body } => {
                self.dispatch_request(sender, msg_id, message_type, body, now)
            }
            Incoming::Response(resolved) => {
                self.record_receive(&sender, CommHints::THIS_IS_A_RESPONSE);
                self.resolve(resolved, now);
            }
            Incoming::Dropped => {}
        }
    }

    fn dispatch_request(
        &mut self,
        sender: PeerId,
        msg_id: MsgId,
        message_type: String,
        body: Option<Value>,
        now: Instant,
    ) {
        let responder = Responder { request_id: msg_id, counterparty: sender };
        if message_type == MESSAGE_FOR_YOU {
            self.record_receive(&sender, CommHints::EXPECT_TO_RESPOND);
            self.accept_relayed(sender, body, now);
            self.respond(responder, Some(json!({"result": "success"})), None, CommHints::NO_HINT, now);
            return;
        }
        let request = IncomingRequest { counterparty: sender, message_type, body, responder };
        match self.handlers.dispatch(&request) {
            None => {
                warn!("No handler for '{}' from {sender}. Dropping it.", request.message_type);
                // They may have sent it because they think we are someone else
                self.hello.forget(&sender);
                self.tracker.drop_request(&msg_id);
            }
            Some(HandlerOutcome::Respond(body, hints)) => {
                self.record_receive(&sender, CommHints::EXPECT_TO_RESPOND);
                self.respond(responder, body, None, hints, now);
            }
            Some(HandlerOutcome::Fail(reason)) => {
                self.record_receive(&sender, CommHints::EXPECT_TO_RESPOND);
                self.respond(responder, None, Some(reason), CommHints::NO_HINT, now);
            }
            Some(HandlerOutcome::NoResponse) => self.tracker.drop_request(&msg_id),
            Some(HandlerOutcome::Async) => {
                self.record_receive(&sender, CommHints::EXPECT_TO_RESPOND);
                trace!("{responder} will be answered later");
            }
        }
    }

    fn record_receive(&mut self, sender: &PeerId, hint: CommHints) {
        if let Some(tcp) = self.strategies.get_mut(sender).and_then(|s| s.as_tcp_mut()) {
            tcp.hints.record_receive(hint);
        }
    }

    /// A relayer pushed a message it was holding for us.
    fn accept_relayed(&mut self, relayer: PeerId, body: Option<Value>, now: Instant) {
        let message = body
            .and_then(|b| serde_json::from_value::<MessageForYou>(b).ok())
            .and_then(|m| hex::decode(m.message).ok());
        let Some(wire) = message else {
            warn!("Relayer {relayer} pushed a malformed message");
            return;
        };
        self.handle_wire(&wire, Via::Relayer(relayer), now);
        if self.relay.on_relayed_message(relayer, now) {
            self.refresh_own_address();
        }
    }

    fn resolve(&mut self, resolved: Resolved<Reply>, now: Instant) {
        if resolved.outcome.is_ok() && !resolved.late {
            self.rtt.record(&resolved.counterparty, &resolved.message_type, resolved.elapsed);
        }
        match resolved.callback {
            Reply::Caller(sender) => {
                if sender.send(resolved.outcome).is_err() {
                    trace!("Nobody is waiting for conversation {} any more", resolved.msg_id);
                }
            }
            Reply::PassAlong(t) => {
                let refusal = match resolved.outcome {
                    Ok(envelope) => match envelope.body.as_ref().and_then(|b| b.get("result")).and_then(Value::as_str) {
                        Some("success") | Some("ok") | None => None,
                        Some(other) => Some(other.to_string()),
                    },
                    Err(failure) => Some(failure.to_string()),
                };
                match refusal {
                    None => trace!("Relayer {} took a message for {}", resolved.counterparty, t.recipient),
                    Some(reason) => self.send_failed(SendTicket::Message(t), TransportError::RelayFailed(reason), now),
                }
            }
            Reply::Poll(relayer) => self.on_poll_outcome(relayer, resolved.outcome, now),
        }
    }

    //------------------------------------------   Addresses   ----------------------------------------------------//

    fn use_record(&mut self, id: PeerId, record: &AddressRecord) -> Result<(), StrategyError> {
        let strategy = record.to_strategy()?;
        let CommStrategy::Crypto(crypto) = &strategy else {
            return Err(StrategyError::UnsupportedType(format!("{strategy} without a public key")));
        };
        let found = crypto.pubkey.id();
        if found != id {
            return Err(StrategyError::BrokerMismatch { expected: id, found });
        }
        if id != self.my_id {
            self.adopt_strategy(id, strategy);
        }
        Ok(())
    }

    fn adopt_strategy(&mut self, id: PeerId, candidate: CommStrategy) {
        if let CommStrategy::Crypto(crypto) = &candidate {
            self.session.store_key(crypto.pubkey.clone());
        }
        let current = self.strategies.remove(&id);
        let previous = current.as_ref().and_then(|s| s.as_tcp()).cloned();
        if let Some(mut best) = choose_best(current, Some(candidate)) {
            if let (Some(previous), Some(tcp)) = (previous, best.as_tcp_mut()) {
                tcp.inherit(&previous);
            }
            trace!("Reaching {id} via {best}");
            self.strategies.insert(id, best);
        }
    }

    /// Drop what we know about reaching `id`, and the connection that went with it.
    fn forget_strategy(&mut self, id: &PeerId, now: Instant) {
        let Some(strategy) = self.strategies.remove(id) else {
            return;
        };
        debug!("Forgetting {strategy} for {id}");
        if let Some(conn) = strategy.as_tcp().and_then(|t| t.conn) {
            if let Some((key, connection)) = self.pool.remove_connection(conn) {
                let error = TransportError::ConnectionClosed("its comm strategy was dropped".into());
                self.close_connection(key, connection, error, now);
            }
        }
    }

    fn reachability(&self) -> Reachability {
        if let Some(addr) = self.listen_addr {
            let host = self
                .config
                .announce_host
                .clone()
                .or_else(|| (!addr.ip().is_unspecified()).then(|| addr.ip().to_string()));
            if let Some(host) = host {
                if self.config.allow_nonroutable_ip || is_routable(&host) {
                    return Reachability::Tcp { host, port: self.config.announce_port.unwrap_or(addr.port()) };
                }
            }
        }
        match self.relay.favorite() {
            Some(relayer) => Reachability::Relay { relayer },
            None => Reachability::Pickup,
        }
    }

    fn refresh_own_address(&mut self) {
        let reachability = self.reachability();
        self.relay.set_reachable_directly(matches!(reachability, Reachability::Tcp { .. }));
        let Some(record) = self.own_address.update(reachability) else {
            return;
        };
        // Everybody needs to hear the new address
        self.hello.clear();
        let lookup = self.lookup.clone();
        let id = self.my_id;
        self.completions.push(async move { Completion::Published(lookup.publish(id, record).await) }.boxed());
    }

    fn handle_completion(&mut self, completion: Completion) {
        let now = Instant::now();
        match completion {
            Completion::Lookup { id, result } => {
                let waiting = self.pending_lookups.remove(&id).unwrap_or_default();
                let found = match result {
                    Ok(record) => self.use_record(id, &record).map_err(|e| LookupError::Failed(e.to_string())),
                    Err(e) => Err(e),
                };
                match found {
                    Ok(()) => {
                        debug!("Found an address for {id}");
                        waiting.into_iter().for_each(|t| self.transmit(t, now));
                    }
                    Err(e) => {
                        info!("No address for {id}: {e}");
                        waiting.into_iter().for_each(|t| self.give_up(t, ConversationFailure::NoAddress, now));
                    }
                }
            }
            Completion::Discovery(result) => {
                let candidates = result.unwrap_or_else(|e| {
                    warn!("Relay discovery failed: {e}");
                    Vec::new()
                });
                let my_id = self.my_id;
                let best = self.handicappers.best(
                    candidates.iter().filter(|c| **c != my_id),
                    ARE_THERE_MESSAGES,
                    |c| self.relay.stick_handicap(c) + self.tracker.pending_responses_handicap(c, now),
                );
                if self.relay.finish_shopping(best, now) {
                    self.refresh_own_address();
                }
            }
            Completion::Published(Ok(())) => trace!("Published our address"),
            Completion::Published(Err(e)) => warn!("Could not publish our address: {e}"),
        }
    }

    //------------------------------------------   Relays   -------------------------------------------------------//

    fn poll_relayer(&mut self, relayer: PeerId, now: Instant) {
        if !self.relay.is_polling() {
            return;
        }
        let body = serde_json::to_value(PollRequest::default()).ok();
        let timeout = self.config.relay.min_poll_delay.max(MIN_POLL_TIMEOUT);
        let options = SendOptions { timeout: Some(timeout), hints: CommHints::EXPECT_MORE_TRANSACTIONS };
        trace!("Polling {relayer} for messages");
        let late = Some(Reply::Poll(relayer));
        self.start_conversation(relayer, ARE_THERE_MESSAGES, body, options, Reply::Poll(relayer), late, now);
    }

    fn on_poll_outcome(&mut self, relayer: PeerId, outcome: Outcome, now: Instant) {
        let success = match outcome {
            Ok(envelope) => match serde_json::from_value::<BundledMessages>(envelope.body.unwrap_or(Value::Null)) {
                Ok(bundle) => {
                    for message in bundle.messages {
                        match hex::decode(&message) {
                            Ok(wire) => {
                                self.handle_wire(&wire, Via::Relayer(relayer), now);
                                if self.relay.on_relayed_message(relayer, now) {
                                    self.refresh_own_address();
                                }
                            }
                            Err(e) => warn!("Relayer {relayer} returned a message that is not hex: {e}"),
                        }
                    }
                    true
                }
                Err(e) => {
                    warn!("Relayer {relayer} returned a malformed poll response: {e}");
                    false
                }
            },
            Err(failure) => {
                debug!("Polling {relayer} failed: {failure}");
                false
            }
        };
        if self.relay.on_poll_result(relayer, success, now) {
            self.go_shopping();
        }
    }

    fn go_shopping(&mut self) {
        if !self.relay.begin_shopping() {
            return;
        }
        debug!("🛒 Shopping for relayers");
        let discovery = self.discovery.clone();
        let task = async move {
            let result = match tokio::time::timeout(LOOKUP_TIMEOUT, discovery.discover_relays()).await {
                Ok(result) => result,
                Err(_) => Err(LookupError::SoftTimeout),
            };
            Completion::Discovery(result)
        };
        self.completions.push(task.boxed());
    }

    //------------------------------------------   I/O and housekeeping   -----------------------------------------//

    fn handle_io_event(&mut self, event: IoEvent) {
        trace!("I/O event: {event:?}");
        let now = Instant::now();
        match event {
            IoEvent::Accepted { stream, remote } => {
                let id = self.next_conn_id();
                let max = self.config.max_message_size;
                let conn = Connection::accepted(id, stream, remote, max, self.io_sender.clone(), now);
                if let Err(e) = self.admit(PoolKey::Inbound(id), conn, now) {
                    warn!("Dropped a connection from {remote}: {e}");
                }
            }
            IoEvent::Connected { conn, stream } => match self.pool.get_by_id_mut(conn) {
                Some(connection) => {
                    debug!("Connected {connection}");
                    connection.attach(stream, self.io_sender.clone(), now);
                }
                None => trace!("Connection #{conn} was dropped while it was being dialled"),
            },
            IoEvent::ConnectFailed { conn, reason } => {
                self.drop_connection(conn, TransportError::ConnectFailed(reason), now)
            }
            IoEvent::Received { conn, bytes } => {
                let Some(connection) = self.pool.get_by_id_mut(conn) else {
                    return;
                };
                let received = connection.on_received(&bytes, now);
                received.messages.iter().for_each(|m| self.handle_wire(m, Via::Conn(conn), now));
                if let Some(e) = received.error {
                    self.drop_connection(conn, e, now);
                }
            }
            IoEvent::Written { conn, n } => {
                let Some(connection) = self.pool.get_by_id_mut(conn) else {
                    return;
                };
                let sent = connection.on_written(n, now);
                trace!("{} message(s) sent on connection #{conn}", sent.len());
                if connection.is_drained() {
                    let reason = TransportError::ConnectionClosed("no more traffic expected".into());
                    self.drop_connection(conn, reason, now);
                }
            }
            IoEvent::Closed { conn, reason } => {
                self.drop_connection(conn, TransportError::ConnectionClosed(reason), now)
            }
            IoEvent::Loopback { plaintext } => self.handle_plaintext(self.my_id, plaintext, Via::Loopback, now),
        }
    }

    fn drop_connection(&mut self, conn: ConnId, error: TransportError, now: Instant) {
        if let Some((key, connection)) = self.pool.remove_connection(conn) {
            self.close_connection(key, connection, error, now);
        }
    }

    /// Close a connection that has already left the pool, and fail whatever it still had queued.
    fn close_connection(
        &mut self,
        key: PoolKey,
        mut conn: Connection<SendTicket>,
        error: TransportError,
        now: Instant,
    ) {
        debug!("Closing {conn} ({key}): {error}");
        let id = conn.id();
        let unsent = conn.close();
        for strategy in self.strategies.values_mut() {
            if let Some(tcp) = strategy.as_tcp_mut().filter(|t| t.conn == Some(id)) {
                tcp.conn = None;
            }
        }
        self.strategies.retain(|_, s| s.is_useful());
        for ticket in unsent {
            self.send_failed(ticket, error.clone(), now);
        }
    }

    fn handle_deadlines(&mut self, now: Instant) {
        for resolved in self.tracker.fire_timeouts(now) {
            self.resolve(resolved, now);
        }
        for task in self.relay.pop_due(now) {
            match task {
                RelayTask::Poll(relayer) => self.poll_relayer(relayer, now),
                RelayTask::Shop if self.relay.is_polling() => self.go_shopping(),
                RelayTask::Shop => self.relay.skip_shopping(now),
            }
        }
        for timer in self.timers.pop_due(now) {
            match timer {
                Timer::Cleanup => {
                    self.cleanup(now);
                    self.timers.schedule(self.config.cleanup_interval, now, Timer::Cleanup);
                }
            }
        }
    }

    fn cleanup(&mut self, now: Instant) {
        let before = self.strategies.len();
        self.strategies.retain(|_, s| s.is_useful());
        if self.strategies.len() < before {
            debug!("🧹 Forgot {} comm strategies that no longer work", before - self.strategies.len());
        }
        let strategies = &self.strategies;
        let cleaned = self.pool.cleanup_nice(|k| pool_hints(strategies, k), now);
        if !cleaned.success {
            warn!("Connection pool is over capacity with busy connections");
        }
        for (key, conn) in cleaned.evicted {
            self.close_connection(key, conn, TransportError::ConnectionClosed("idle".into()), now);
        }
        self.tracker.expire(now);
        self.hello.expire(now);
    }

    fn shutdown(&mut self) {
        info!("👋 {} shutting down", self.my_id);
        let now = Instant::now();
        for resolved in self.tracker.shutdown(now) {
            if let Reply::Caller(sender) = resolved.callback {
                let _ = sender.send(resolved.outcome);
            }
        }
        for (_, mut conn) in self.pool.drain() {
            conn.close();
        }
        if let Some(accept) = self.accept_task.take() {
            accept.abort();
        }
        self.pending_lookups.clear();
        self.completions = FuturesUnordered::new();
        self.strategies.clear();
        self.session.forget_sessions();
        self.hello.clear();
        self.relay.clear();
        self.timers.clear();
    }
}

/// Usage hints for a pooled connection, taken from the strategy that owns it.
fn pool_hints(strategies: &HashMap<PeerId, CommStrategy>, key: &PoolKey) -> CommHints {
    match key {
        PoolKey::Peer(id) => strategies.get(id).and_then(|s| s.as_tcp()).map(|t| t.hints.hints).unwrap_or_default(),
        PoolKey::Inbound(_) => CommHints::NO_HINT,
    }
}
