//! Comm strategies: the ways a counterparty can be reached, and the rules for choosing between two of them.
//!
//! A strategy is either a leaf (`Tcp`, `Relay`, `Pickup`) or a `Crypto` wrapper that binds a public key to exactly one
//! leaf. Strategies are learned from address records (lookup results and the metainfo attached to incoming messages)
//! and from the connection a message arrived on.

use crate::errors::TransportError;
use crate::hints::HintState;
use crate::identity::{PeerId, PublicKey};
use crate::pool::ConnId;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use thiserror::Error;

pub const RELAY_MESSAGE_TYPE: &str = "pass this along v2";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("Unsupported comm strategy type '{0}'")]
    UnsupportedType(String),
    #[error("The {kind} strategy record is missing '{field}'")]
    MissingField { kind: &'static str, field: &'static str },
    #[error("Invalid port number '{0}'")]
    BadPort(String),
    #[error("The strategy record names broker {found}, expected {expected}")]
    BrokerMismatch { expected: PeerId, found: PeerId },
    #[error("The address record has no strategies")]
    Empty,
}

/// The wire form of a strategy, as found in address records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    #[serde(rename = "comm strategy type")]
    pub kind: String,
    #[serde(rename = "broker id", default, skip_serializing_if = "Option::is_none")]
    pub broker_id: Option<PeerId>,
    #[serde(rename = "comm strat sequence num", default, skip_serializing_if = "Option::is_none")]
    pub seqno: Option<i64>,
    #[serde(rename = "IP address", default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "port number", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(rename = "relayer id", default, skip_serializing_if = "Option::is_none")]
    pub relayer_id: Option<PeerId>,
    #[serde(rename = "pubkey", default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<PublicKey>,
    #[serde(rename = "lowerstrategy", default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<Box<StrategyRecord>>,
}

/// What a node announces about how to reach it: the "hello" attached to outgoing messages and published through
/// lookup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    #[serde(rename = "connection strategies")]
    pub strategies: Vec<StrategyRecord>,
}

impl AddressRecord {
    pub fn new(strategy: &CommStrategy) -> Self {
        AddressRecord { strategies: vec![strategy.to_record()] }
    }

    /// The id of the node this record describes, taken from the first strategy's public key.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.strategies.first()?.pubkey.as_ref().map(|k| k.id())
    }

    /// The outermost sequence number, looking through crypto wrappers.
    pub fn sequence_number(&self) -> Option<i64> {
        let mut record = self.strategies.first()?;
        loop {
            if record.seqno.is_some() {
                return record.seqno;
            }
            record = record.lower.as_deref()?;
        }
    }

    pub fn to_strategy(&self) -> Result<CommStrategy, StrategyError> {
        let first = self.strategies.first().ok_or(StrategyError::Empty)?;
        CommStrategy::from_record(first, None, None)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TcpStrategy {
    pub broker_id: Option<PeerId>,
    pub seqno: Option<i64>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// The open connection this strategy sends on, cleared when that connection closes.
    pub conn: Option<ConnId>,
    pub hints: HintState,
}

impl TcpStrategy {
    pub fn to_address(host: &str, port: u16, broker_id: Option<PeerId>, seqno: Option<i64>) -> Self {
        let host = Some(host.to_string());
        TcpStrategy { broker_id, seqno, host, port: Some(port), conn: None, hints: HintState::default() }
    }

    pub fn on_connection(conn: ConnId, broker_id: Option<PeerId>) -> Self {
        TcpStrategy { broker_id, seqno: None, host: None, port: None, conn: Some(conn), hints: HintState::default() }
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Take over what an earlier strategy for the same counterparty knew: its address, when this one has none, and
    /// its accumulated hints, when this one has none.
    pub fn inherit(&mut self, previous: &TcpStrategy) {
        if self.host.is_none() && self.port.is_none() {
            self.host.clone_from(&previous.host);
            self.port = previous.port;
            self.seqno = self.seqno.or(previous.seqno);
        }
        if self.hints == HintState::default() {
            self.hints = previous.hints.clone();
        }
    }

    pub fn is_routable(&self) -> bool {
        self.host.as_deref().is_some_and(is_routable)
    }

    fn same(&self, other: &TcpStrategy) -> bool {
        match self.conn {
            Some(conn) => other.conn == Some(conn),
            None => other.conn.is_none() && self.host == other.host && self.port == other.port,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelayStrategy {
    pub relayer_id: PeerId,
    pub broker_id: Option<PeerId>,
    pub seqno: Option<i64>,
}

/// The body of a `pass this along v2` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassAlongBody {
    pub recipient: PeerId,
    /// The sealed message for the recipient, hex encoded.
    pub message: String,
    #[serde(rename = "comm strat sequence num")]
    pub seqno: i64,
}

impl RelayStrategy {
    /// Refuse relays that could loop: through ourselves, through the recipient itself, or a forward whose sequence
    /// number does not strictly decrease.
    pub fn check_forward(&self, my_id: &PeerId, incoming_seqno: Option<i64>) -> Result<(), TransportError> {
        if self.relayer_id == *my_id {
            return Err(TransportError::RelayFailed("refusing to relay a message through ourselves".into()));
        }
        if Some(self.relayer_id) == self.broker_id {
            return Err(TransportError::RelayFailed(format!("refusing to relay to {} via itself", self.relayer_id)));
        }
        if let Some(incoming) = incoming_seqno {
            if self.seqno.map_or(true, |own| incoming >= own) {
                return Err(TransportError::RelayFailed(format!(
                    "relay might not terminate: incoming sequence number {incoming}, ours {:?}",
                    self.seqno
                )));
            }
        }
        Ok(())
    }

    pub fn pass_along_body(&self, recipient: PeerId, message: &[u8]) -> PassAlongBody {
        PassAlongBody { recipient, message: hex::encode(message), seqno: self.seqno.unwrap_or(-1) }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CryptoStrategy {
    pub pubkey: PublicKey,
    pub lower: Box<CommStrategy>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PickupStrategy {
    pub broker_id: Option<PeerId>,
    pub seqno: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommStrategy {
    Tcp(TcpStrategy),
    Relay(RelayStrategy),
    Crypto(CryptoStrategy),
    Pickup(PickupStrategy),
}

impl Display for CommStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommStrategy::Tcp(t) => match (&t.host, t.port, t.conn) {
                (_, _, Some(conn)) => write!(f, "TCP(conn #{conn})"),
                (Some(host), Some(port), None) => write!(f, "TCP({host}:{port})"),
                _ => write!(f, "TCP(?)"),
            },
            CommStrategy::Relay(r) => write!(f, "Relay(via {})", r.relayer_id),
            CommStrategy::Crypto(c) => write!(f, "Crypto({}, {})", c.pubkey.id(), c.lower),
            CommStrategy::Pickup(_) => write!(f, "Pickup"),
        }
    }
}

impl CommStrategy {
    pub fn crypto(pubkey: PublicKey, lower: CommStrategy) -> Self {
        CommStrategy::Crypto(CryptoStrategy { pubkey, lower: Box::new(lower) })
    }

    pub fn broker_id(&self) -> Option<PeerId> {
        match self {
            CommStrategy::Tcp(t) => t.broker_id,
            CommStrategy::Relay(r) => r.broker_id,
            CommStrategy::Crypto(c) => Some(c.pubkey.id()),
            CommStrategy::Pickup(p) => p.broker_id,
        }
    }

    pub fn seqno(&self) -> Option<i64> {
        match self {
            CommStrategy::Tcp(t) => t.seqno,
            CommStrategy::Relay(r) => r.seqno,
            CommStrategy::Crypto(c) => c.lower.seqno(),
            CommStrategy::Pickup(p) => p.seqno,
        }
    }

    /// The leaf strategy that actually moves bytes.
    pub fn bottom(&self) -> &CommStrategy {
        match self {
            CommStrategy::Crypto(c) => c.lower.bottom(),
            other => other,
        }
    }

    pub fn bottom_mut(&mut self) -> &mut CommStrategy {
        match self {
            CommStrategy::Crypto(c) => c.lower.bottom_mut(),
            other => other,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpStrategy> {
        match self.bottom() {
            CommStrategy::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_tcp_mut(&mut self) -> Option<&mut TcpStrategy> {
        match self.bottom_mut() {
            CommStrategy::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_open_tcp(&self) -> bool {
        self.as_tcp().is_some_and(TcpStrategy::is_open)
    }

    /// Reachable by someone who does not already have a connection to us.
    pub fn is_reachable(&self) -> bool {
        match self.bottom() {
            CommStrategy::Tcp(t) => t.is_routable(),
            CommStrategy::Relay(_) => true,
            _ => false,
        }
    }

    /// Still worth remembering.
    pub fn is_useful(&self) -> bool {
        match self {
            CommStrategy::Tcp(t) => t.is_open() || (t.host.is_some() && t.port.is_some()),
            CommStrategy::Relay(_) => true,
            CommStrategy::Crypto(c) => c.lower.is_useful(),
            CommStrategy::Pickup(_) => false,
        }
    }

    /// Whether two strategies are the same way of reaching someone.
    pub fn same(&self, other: &CommStrategy) -> bool {
        match (self, other) {
            (CommStrategy::Tcp(a), CommStrategy::Tcp(b)) => a.same(b),
            (CommStrategy::Relay(a), CommStrategy::Relay(b)) => a.relayer_id == b.relayer_id,
            (CommStrategy::Crypto(a), CommStrategy::Crypto(b)) => a.pubkey == b.pubkey && a.lower.same(&b.lower),
            (CommStrategy::Pickup(_), CommStrategy::Pickup(_)) => true,
            _ => false,
        }
    }

    pub fn to_record(&self) -> StrategyRecord {
        match self {
            CommStrategy::Tcp(t) => StrategyRecord {
                kind: "TCP".into(),
                broker_id: t.broker_id,
                seqno: t.seqno,
                host: t.host.clone(),
                port: t.port.map(|p| p.to_string()),
                ..Default::default()
            },
            CommStrategy::Relay(r) => StrategyRecord {
                kind: "relay".into(),
                broker_id: r.broker_id,
                seqno: r.seqno,
                relayer_id: Some(r.relayer_id),
                ..Default::default()
            },
            CommStrategy::Crypto(c) => StrategyRecord {
                kind: "crypto".into(),
                broker_id: Some(c.pubkey.id()),
                pubkey: Some(c.pubkey.clone()),
                lower: Some(Box::new(c.lower.to_record())),
                ..Default::default()
            },
            CommStrategy::Pickup(p) => {
                StrategyRecord { kind: "pickup".into(), broker_id: p.broker_id, seqno: p.seqno, ..Default::default() }
            }
        }
    }

    /// Build a strategy from its record. `broker_id` and `seqno` are inherited from an enclosing record when the
    /// nested one does not carry them.
    pub fn from_record(
        record: &StrategyRecord,
        broker_id: Option<PeerId>,
        seqno: Option<i64>,
    ) -> Result<CommStrategy, StrategyError> {
        let broker_id = match (broker_id, record.broker_id) {
            (Some(expected), Some(found)) if expected != found => {
                return Err(StrategyError::BrokerMismatch { expected, found });
            }
            (Some(id), _) | (None, Some(id)) => Some(id),
            (None, None) => None,
        };
        let seqno = record.seqno.or(seqno);
        match record.kind.to_ascii_lowercase().as_str() {
            "tcp" => {
                let missing = |field| StrategyError::MissingField { kind: "TCP", field };
                let host = record.host.clone().ok_or_else(|| missing("IP address"))?;
                let port = record.port.as_deref().ok_or_else(|| missing("port number"))?;
                let port = port.trim().parse::<u16>().map_err(|_| StrategyError::BadPort(port.to_string()))?;
                Ok(CommStrategy::Tcp(TcpStrategy::to_address(&host, port, broker_id, seqno)))
            }
            "relay" => {
                let relayer_id =
                    record.relayer_id.ok_or(StrategyError::MissingField { kind: "relay", field: "relayer id" })?;
                Ok(CommStrategy::Relay(RelayStrategy { relayer_id, broker_id, seqno }))
            }
            "pickup" => Ok(CommStrategy::Pickup(PickupStrategy { broker_id, seqno })),
            "crypto" => {
                let missing = |field| StrategyError::MissingField { kind: "crypto", field };
                let pubkey = record.pubkey.clone().ok_or_else(|| missing("pubkey"))?;
                let id = pubkey.id();
                if let Some(expected) = broker_id.filter(|b| *b != id) {
                    return Err(StrategyError::BrokerMismatch { expected, found: id });
                }
                let lower = record.lower.as_deref().ok_or_else(|| missing("lowerstrategy"))?;
                let lower = CommStrategy::from_record(lower, Some(id), seqno)?;
                if matches!(lower, CommStrategy::Crypto(_)) {
                    return Err(StrategyError::UnsupportedType("crypto inside crypto".into()));
                }
                Ok(CommStrategy::crypto(pubkey, lower))
            }
            other => Err(StrategyError::UnsupportedType(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preference {
    Current,
    Candidate,
}

/// Decide between the strategy in use and a newly suggested one. Pass the newer suggestion as `candidate`: real ties
/// go to it, while two strategies that are the same keep the current one.
pub fn prefer(current: &CommStrategy, candidate: &CommStrategy) -> Preference {
    use Preference::*;
    let (cur, cand) = (current.bottom(), candidate.bottom());
    if cur.same(cand) {
        return Current;
    }
    match (cur.is_open_tcp(), cand.is_open_tcp()) {
        (true, false) => return Current,
        (false, true) => return Candidate,
        _ => {}
    }
    let (seq_cur, seq_cand) = (cur.seqno().unwrap_or(-1), cand.seqno().unwrap_or(-1));
    if seq_cur != seq_cand {
        return if seq_cur > seq_cand { Current } else { Candidate };
    }
    match (cur, cand) {
        (CommStrategy::Tcp(a), CommStrategy::Tcp(b)) => {
            if a.is_open() {
                return Candidate;
            }
            match (a.is_routable(), b.is_routable()) {
                (true, false) => Current,
                _ => Candidate,
            }
        }
        (CommStrategy::Tcp(_), _) => Current,
        (_, CommStrategy::Tcp(_)) => Candidate,
        (CommStrategy::Relay(_), CommStrategy::Relay(_)) => Candidate,
        (CommStrategy::Relay(_), _) => Current,
        _ => Candidate,
    }
}

/// The better of two optional strategies. Two crypto strategies for the same key merge: the current wrapper is kept
/// and its lower strategy becomes the better of the two lower strategies.
pub fn choose_best(current: Option<CommStrategy>, candidate: Option<CommStrategy>) -> Option<CommStrategy> {
    let (current, candidate) = match (current, candidate) {
        (None, other) | (other, None) => return other,
        (Some(cur), Some(cand)) => (cur, cand),
    };
    match (current, candidate) {
        (CommStrategy::Crypto(mut cur), CommStrategy::Crypto(cand)) if cur.pubkey == cand.pubkey => {
            if let Some(lower) = choose_best(Some(*cur.lower.clone()), Some(*cand.lower)) {
                *cur.lower = lower;
            }
            Some(CommStrategy::Crypto(cur))
        }
        (cur, cand) => match prefer(&cur, &cand) {
            Preference::Current => Some(cur),
            Preference::Candidate => Some(cand),
        },
    }
}

/// Whether a host is reachable from the public internet. Names that are not IP literals are assumed to be.
pub fn is_routable(host: &str) -> bool {
    let host = host.trim();
    if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
        return false;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            !(ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
                || ip.octets()[0] == 0)
        }
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            !(ip.is_loopback() || ip.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80)
        }
        Err(_) => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hints::CommHints;
    use crate::identity::NodeIdentity;

    fn tcp(host: &str, port: u16, seqno: Option<i64>) -> CommStrategy {
        CommStrategy::Tcp(TcpStrategy::to_address(host, port, None, seqno))
    }

    fn open(conn: ConnId) -> CommStrategy {
        CommStrategy::Tcp(TcpStrategy::on_connection(conn, None))
    }

    fn relay(seqno: Option<i64>) -> CommStrategy {
        CommStrategy::Relay(RelayStrategy { relayer_id: PeerId::digest(b"relayer"), broker_id: None, seqno })
    }

    fn pickup() -> CommStrategy {
        CommStrategy::Pickup(PickupStrategy { broker_id: None, seqno: None })
    }

    fn best(a: &CommStrategy, b: &CommStrategy) -> CommStrategy {
        choose_best(Some(a.clone()), Some(b.clone())).expect("one of two")
    }

    #[test]
    fn tie_break_rules() {
        let routable = tcp("8.8.8.8", 80, None);
        let private = tcp("10.0.0.1", 80, None);
        assert_eq!(choose_best(None, Some(pickup())), Some(pickup()));
        assert_eq!(choose_best(Some(relay(None)), None), Some(relay(None)));
        assert_eq!(best(&open(1), &tcp("8.8.8.8", 80, Some(9))), open(1));
        assert_eq!(best(&relay(None), &open(2)), open(2));
        assert_eq!(best(&relay(Some(5)), &routable), relay(Some(5)));
        assert_eq!(best(&routable, &relay(None)), routable);
        assert_eq!(best(&pickup(), &routable), routable);
        assert_eq!(best(&routable, &private), routable);
        assert_eq!(best(&private, &routable), routable);
        assert_eq!(best(&open(1), &open(2)), open(2));
        assert_eq!(best(&tcp("1.2.3.4", 1, None), &tcp("5.6.7.8", 1, None)), tcp("5.6.7.8", 1, None));
        assert_eq!(best(&relay(None), &pickup()), relay(None));
        assert_eq!(best(&pickup(), &relay(None)), relay(None));
    }

    #[test]
    fn same_strategy_keeps_current() {
        let mut current = tcp("8.8.8.8", 80, None);
        if let CommStrategy::Tcp(t) = &mut current {
            t.hints.expected_responses = 3;
        }
        let suggested = tcp("8.8.8.8", 80, None);
        let chosen = best(&current, &suggested);
        assert_eq!(chosen.as_tcp().map(|t| t.hints.expected_responses), Some(3));
    }

    #[test]
    fn open_connection_inherits_address_and_hints() {
        let mut dialled = TcpStrategy::to_address("8.8.8.8", 80, None, Some(4));
        dialled.hints.record_send(CommHints::EXPECT_RESPONSE);
        let mut accepted = TcpStrategy::on_connection(7, None);
        accepted.inherit(&dialled);
        assert_eq!((accepted.host.as_deref(), accepted.port, accepted.seqno), (Some("8.8.8.8"), Some(80), Some(4)));
        assert_eq!(accepted.conn, Some(7));
        assert_eq!(accepted.hints.expected_responses, 1);
        accepted.conn = None;
        assert!(CommStrategy::Tcp(accepted).is_useful(), "the address outlives the connection");

        let mut elsewhere = TcpStrategy::to_address("9.9.9.9", 81, None, Some(5));
        elsewhere.inherit(&dialled);
        assert_eq!((elsewhere.host.as_deref(), elsewhere.port), (Some("9.9.9.9"), Some(81)));
        assert_eq!(elsewhere.hints, dialled.hints);
    }

    #[test]
    fn choose_best_is_idempotent() {
        let identity = NodeIdentity::random_with_nickname("key", 1024).expect("identity");
        let key = identity.public_key();
        let strategies = vec![
            open(1),
            open(2),
            tcp("8.8.8.8", 80, None),
            tcp("8.8.8.8", 81, Some(3)),
            tcp("192.168.1.1", 80, Some(3)),
            tcp("example.org", 4000, None),
            relay(None),
            relay(Some(7)),
            pickup(),
            CommStrategy::crypto(key.clone(), open(1)),
            CommStrategy::crypto(key.clone(), tcp("8.8.8.8", 80, Some(1))),
            CommStrategy::crypto(key, relay(Some(2))),
        ];
        for a in &strategies {
            for b in &strategies {
                let once = best(a, b);
                assert_eq!(best(&once, b), once, "choose_best({a}, {b})");
                assert_eq!(best(a, b), once, "deterministic for ({a}, {b})");
            }
        }
    }

    #[test]
    fn crypto_keeps_outer_wrapper() {
        let identity = NodeIdentity::random_with_nickname("key", 1024).expect("identity");
        let key = identity.public_key();
        let current = CommStrategy::crypto(key.clone(), relay(None));
        let suggested = CommStrategy::crypto(key.clone(), open(4));
        let chosen = best(&current, &suggested);
        assert_eq!(chosen, CommStrategy::crypto(key.clone(), open(4)));
        assert_eq!(chosen.broker_id(), Some(key.id()));
        assert!(chosen.is_open_tcp());
    }

    #[test]
    fn reachability() {
        assert!(is_routable("8.8.8.8"));
        assert!(is_routable("peer.example.org"));
        assert!(!is_routable("127.0.0.1"));
        assert!(!is_routable("192.168.0.4"));
        assert!(!is_routable("::1"));
        assert!(!is_routable("fe80::1"));
        assert!(tcp("8.8.8.8", 80, None).is_reachable());
        assert!(!tcp("10.1.1.1", 80, None).is_reachable());
        assert!(relay(None).is_reachable());
        assert!(!pickup().is_reachable());
        assert!(!pickup().is_useful());
        assert!(open(3).is_useful());
        let mut closed = open(3);
        if let Some(t) = closed.as_tcp_mut() {
            t.conn = None;
        }
        assert!(!closed.is_useful());
    }

    #[test]
    fn records() {
        let identity = NodeIdentity::random_with_nickname("record", 1024).expect("identity");
        let key = identity.public_key();
        let strategy = CommStrategy::crypto(key.clone(), tcp("8.8.4.4", 5555, Some(12)));
        let json = serde_json::to_value(AddressRecord::new(&strategy)).expect("serialize record");
        let first = &json["connection strategies"][0];
        assert_eq!(first["comm strategy type"], "crypto");
        assert_eq!(first["lowerstrategy"]["port number"], "5555");
        assert_eq!(first["lowerstrategy"]["IP address"], "8.8.4.4");
        let record: AddressRecord = serde_json::from_value(json).expect("deserialize record");
        assert_eq!(record.peer_id(), Some(key.id()));
        let parsed = record.to_strategy().expect("parse record");
        assert_eq!(parsed.broker_id(), Some(key.id()));
        assert_eq!(parsed.seqno(), Some(12));
        assert_eq!(parsed.as_tcp().and_then(|t| t.broker_id), Some(key.id()));

        let mut bad = StrategyRecord { kind: "carrier pigeon".into(), ..Default::default() };
        assert!(matches!(CommStrategy::from_record(&bad, None, None), Err(StrategyError::UnsupportedType(_))));
        bad.kind = "Relay".into();
        assert!(matches!(CommStrategy::from_record(&bad, None, None), Err(StrategyError::MissingField { .. })));
        let port = StrategyRecord {
            kind: "tcp".into(),
            host: Some("1.2.3.4".into()),
            port: Some("eighty".into()),
            ..Default::default()
        };
        assert!(matches!(CommStrategy::from_record(&port, None, None), Err(StrategyError::BadPort(_))));
    }

    #[test]
    fn relay_loop_guards() {
        let me = PeerId::digest(b"me");
        let them = PeerId::digest(b"them");
        let relayer = PeerId::digest(b"relayer");
        let strat = RelayStrategy { relayer_id: relayer, broker_id: Some(them), seqno: Some(5) };
        assert!(strat.check_forward(&me, None).is_ok());
        assert!(strat.check_forward(&me, Some(4)).is_ok());
        assert!(strat.check_forward(&me, Some(5)).is_err());
        assert!(strat.check_forward(&relayer, None).is_err());
        let via_self = RelayStrategy { relayer_id: them, broker_id: Some(them), seqno: None };
        assert!(via_self.check_forward(&me, None).is_err());
        let unnumbered = RelayStrategy { seqno: None, ..strat.clone() };
        assert!(unnumbered.check_forward(&me, Some(0)).is_err());
        let body = unnumbered.pass_along_body(them, b"\x01\x02");
        assert_eq!(body.seqno, -1);
        assert_eq!(body.message, "0102");
    }
}
