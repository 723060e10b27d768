//! Bookkeeping for the transaction layer: round-trip statistics that pick timeouts, the hello cache that decides
//! when to attach our address record, and the sequence numbering of that record.

use crate::cache::TtlCache;
use crate::identity::{PeerId, PublicKey};
use crate::strategy::{AddressRecord, CommStrategy, PickupStrategy, RelayStrategy, TcpStrategy};
use log::*;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Exponentially weighted mean and deviation of a series of samples, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightedStat {
    pub mean: f64,
    pub sigma: f64,
    mean_squares: f64,
}

impl WeightedStat {
    pub fn new(mean: f64, sigma: f64) -> Self {
        WeightedStat { mean, sigma, mean_squares: mean * mean + sigma * sigma }
    }

    /// Fold in a sample. `history_weight` is in `[0, 1]`: 0 ignores history, 1 ignores the sample.
    pub fn update(self, sample: f64, history_weight: f64) -> Self {
        let w = history_weight;
        let mean = w * self.mean + (1.0 - w) * sample;
        let mean_squares = w * self.mean_squares + (1.0 - w) * sample * sample;
        let variance = mean_squares - mean * mean;
        // Too few samples to tell apart: stay lenient.
        let sigma = if variance > 0.0 { variance.sqrt() } else { mean.abs().sqrt() };
        WeightedStat { mean, sigma, mean_squares }
    }

    /// The statistic after a single sample.
    pub fn first(sample: f64) -> Self {
        WeightedStat { mean: sample, sigma: sample.abs().sqrt(), mean_squares: sample * sample }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64((self.mean + 2.0 * self.sigma).max(0.0))
    }
}

/// Round-trip times per counterparty and message type, with a per-type fallback for counterparties we have no
/// history with.
pub struct RttStats {
    per_counterparty: HashMap<(PeerId, String), WeightedStat>,
    per_type: HashMap<String, WeightedStat>,
    default: WeightedStat,
    history_weight: f64,
    max_timeout: Duration,
}

impl RttStats {
    pub fn new(default_mean: Duration, default_sigma: Duration, time_constant: f64, max_timeout: Duration) -> Self {
        RttStats {
            per_counterparty: HashMap::new(),
            per_type: HashMap::new(),
            default: WeightedStat::new(default_mean.as_secs_f64(), default_sigma.as_secs_f64()),
            history_weight: (-1.0 / time_constant.max(f64::MIN_POSITIVE)).exp(),
            max_timeout,
        }
    }

    pub fn timeout_for(&self, counterparty: &PeerId, message_type: &str) -> Duration {
        let stat = self
            .per_counterparty
            .get(&(*counterparty, message_type.to_string()))
            .or_else(|| self.per_type.get(message_type))
            .unwrap_or(&self.default);
        stat.timeout().min(self.max_timeout)
    }

    /// Record a completed round trip. Timed out conversations are never recorded.
    pub fn record(&mut self, counterparty: &PeerId, message_type: &str, elapsed: Duration) {
        let sample = elapsed.as_secs_f64();
        let key = (*counterparty, message_type.to_string());
        if let Some(stat) = self.per_counterparty.get(&key) {
            if sample > stat.mean + 2.0 * stat.sigma {
                let mean = stat.mean;
                debug!("Unusually long delay for '{message_type}' to {counterparty}: {sample:.2}s (mean {mean:.2}s)");
            }
        }
        let w = self.history_weight;
        let stat = self.per_counterparty.get(&key).map_or(WeightedStat::first(sample), |s| s.update(sample, w));
        self.per_counterparty.insert(key, stat);
        let stat = self.per_type.get(message_type).map_or(WeightedStat::first(sample), |s| s.update(sample, w));
        self.per_type.insert(message_type.to_string(), stat);
    }

    pub fn stat(&self, counterparty: &PeerId, message_type: &str) -> Option<WeightedStat> {
        self.per_counterparty.get(&(*counterparty, message_type.to_string())).copied()
    }
}

/// Remembers who has already seen our current address record.
pub struct HelloCache {
    seen: TtlCache<PeerId, ()>,
}

impl HelloCache {
    pub fn new(max_items: usize, max_age: Duration) -> Self {
        HelloCache { seen: TtlCache::new(max_items, Some(max_age)) }
    }

    /// Whether to attach our address record to a message for `counterparty`. Answers yes once per counterparty until
    /// the entry expires or is forgotten.
    pub fn should_attach(&mut self, counterparty: &PeerId, now: Instant) -> bool {
        if self.seen.contains(counterparty, now) {
            return false;
        }
        self.seen.insert(*counterparty, (), now);
        true
    }

    pub fn forget(&mut self, counterparty: &PeerId) {
        self.seen.remove(counterparty);
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn expire(&mut self, now: Instant) {
        self.seen.expire(now);
    }
}

/// How we can currently be reached.
#[derive(Clone, Debug, PartialEq)]
pub enum Reachability {
    Tcp { host: String, port: u16 },
    Relay { relayer: PeerId },
    Pickup,
}

/// Our own address record and its sequence number.
pub struct OwnAddress {
    pubkey: PublicKey,
    seqno: i64,
    current: Option<(Reachability, AddressRecord)>,
}

impl OwnAddress {
    /// Sequence numbers start at the current Unix time, so they keep increasing across restarts.
    pub fn new(pubkey: PublicKey) -> Self {
        let seqno = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
        OwnAddress { pubkey, seqno, current: None }
    }

    pub fn record(&self) -> Option<&AddressRecord> {
        self.current.as_ref().map(|(_, record)| record)
    }

    pub fn reachability(&self) -> Option<&Reachability> {
        self.current.as_ref().map(|(r, _)| r)
    }

    /// Recompute the record. Returns the new record when it differs from the last one, with a bumped sequence number.
    pub fn update(&mut self, reachability: Reachability) -> Option<AddressRecord> {
        if self.reachability() == Some(&reachability) {
            return None;
        }
        self.seqno += 1;
        let id = self.pubkey.id();
        let seqno = Some(self.seqno);
        let lower = match &reachability {
            Reachability::Tcp { host, port } => {
                CommStrategy::Tcp(TcpStrategy::to_address(host, *port, Some(id), seqno))
            }
            Reachability::Relay { relayer } => {
                CommStrategy::Relay(RelayStrategy { relayer_id: *relayer, broker_id: Some(id), seqno })
            }
            Reachability::Pickup => CommStrategy::Pickup(PickupStrategy { broker_id: Some(id), seqno }),
        };
        let record = AddressRecord::new(&CommStrategy::crypto(self.pubkey.clone(), lower));
        info!("📇 Our address is now {reachability:?} (seqno {})", self.seqno);
        self.current = Some((reachability, record.clone()));
        Some(record)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::NodeIdentity;

    #[test]
    fn default_and_learned_timeouts() {
        let max = Duration::from_secs(3600);
        let mut stats = RttStats::new(Duration::from_secs(120), Duration::from_secs(20), 10.0, max);
        let peer = PeerId::digest(b"peer");
        let other = PeerId::digest(b"other");
        assert_eq!(stats.timeout_for(&peer, "ping"), Duration::from_secs(160));
        stats.record(&peer, "ping", Duration::from_secs(4));
        let first = stats.stat(&peer, "ping").expect("stat");
        assert!((first.mean - 4.0).abs() < 1e-9);
        assert!((first.sigma - 2.0).abs() < 1e-9, "a single sample gives sigma = sqrt(mean)");
        assert_eq!(stats.timeout_for(&peer, "ping"), Duration::from_secs(8));
        assert_eq!(stats.timeout_for(&other, "ping"), Duration::from_secs(8), "falls back to the per-type estimate");
        assert_eq!(stats.timeout_for(&peer, "pong"), Duration::from_secs(160));

        for _ in 0..50 {
            stats.record(&peer, "ping", Duration::from_secs(1));
        }
        let settled = stats.stat(&peer, "ping").expect("stat");
        assert!(settled.mean < 1.2, "mean converges towards recent samples: {}", settled.mean);
    }

    #[test]
    fn timeouts_are_capped() {
        let stats = RttStats::new(Duration::from_secs(120), Duration::from_secs(20), 10.0, Duration::from_secs(30));
        assert_eq!(stats.timeout_for(&PeerId::digest(b"p"), "ping"), Duration::from_secs(30));
    }

    #[test]
    fn hello_once_per_counterparty() {
        let t0 = Instant::now();
        let mut hello = HelloCache::new(10, Duration::from_secs(60));
        let peer = PeerId::digest(b"peer");
        assert!(hello.should_attach(&peer, t0));
        assert!(!hello.should_attach(&peer, t0));
        assert!(hello.should_attach(&peer, t0 + Duration::from_secs(61)));
        hello.forget(&peer);
        assert!(hello.should_attach(&peer, t0 + Duration::from_secs(62)));
        hello.clear();
        assert!(hello.should_attach(&peer, t0 + Duration::from_secs(62)));
    }

    #[test]
    fn own_address_bumps_sequence_number_on_change() {
        let identity = NodeIdentity::random_with_nickname("me", 1024).expect("identity");
        let mut own = OwnAddress::new(identity.public_key());
        let tcp = Reachability::Tcp { host: "1.2.3.4".into(), port: 4000 };
        let first = own.update(tcp.clone()).expect("first record");
        assert_eq!(first.peer_id(), Some(identity.peer_id()));
        assert!(own.update(tcp).is_none());
        let second = own.update(Reachability::Pickup).expect("changed record");
        assert!(second.sequence_number() > first.sequence_number());
        let strategy = second.to_strategy().expect("strategy");
        assert!(matches!(strategy.bottom(), CommStrategy::Pickup(_)));
    }
}
