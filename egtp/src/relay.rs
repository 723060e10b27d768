//! Receiving messages through relayers.
//!
//! A node that cannot be reached directly keeps a short list of preferred relayers, best first, and polls them for
//! messages held on its behalf. The router only keeps the list and the polling schedule. The event loop runs the
//! polls, the discovery trips and the handicapping, and reports back.
//!
//! - The i-th preferred relayer is polled every `min_poll_delay * 2^i`.
//! - Every so often the node goes shopping for relayers, and the winner of the handicapping becomes the favourite.
//!   It also goes shopping when a poll of the favourite fails.
//! - A relayer that delivers a message is polled again soon, and may be promoted one place.

use crate::config::RelayConfig;
use crate::identity::PeerId;
use crate::scheduler::Scheduler;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A relayer pushing a message it holds for us.
pub const MESSAGE_FOR_YOU: &str = "message for you";
/// Our poll for messages held by a relayer.
pub const ARE_THERE_MESSAGES: &str = "are there messages";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayTask {
    Poll(PeerId),
    Shop,
}

/// Body of a `message for you` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageForYou {
    /// A sealed message, hex encoded.
    pub message: String,
}

/// Body of the response to `are there messages`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BundledMessages {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Sealed messages, hex encoded.
    #[serde(default)]
    pub messages: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    #[serde(rename = "response version")]
    pub response_version: u32,
}

impl Default for PollRequest {
    fn default() -> Self {
        PollRequest { response_version: 3 }
    }
}

pub struct RelayRouter {
    config: RelayConfig,
    preferred: Vec<PeerId>,
    next_polls: HashMap<PeerId, Instant>,
    tasks: Scheduler<RelayTask>,
    active: bool,
    shopping: bool,
    started: bool,
}

impl RelayRouter {
    pub fn new(config: RelayConfig) -> Self {
        RelayRouter {
            config,
            preferred: Vec::new(),
            next_polls: HashMap::new(),
            tasks: Scheduler::new(),
            active: false,
            shopping: false,
            started: false,
        }
    }

    /// Start polling the relayers we already know of, and start the regular shopping trips.
    pub fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;
        let min = self.config.min_poll_delay;
        for (i, relayer) in self.preferred.clone().into_iter().enumerate() {
            self.schedule_poll(relayer, poll_delay(min, i).saturating_sub(min), now);
        }
        self.tasks.schedule(Duration::ZERO, now, RelayTask::Shop);
    }

    /// Whether we should be polling: our primary address is a relay, or we were asked to poll anyway.
    pub fn set_reachable_directly(&mut self, direct: bool) {
        self.active = !self.config.never_poll && (!direct || self.config.poll_relayer);
    }

    pub fn is_polling(&self) -> bool {
        self.active
    }

    pub fn favorite(&self) -> Option<PeerId> {
        self.preferred.first().copied()
    }

    pub fn preferred(&self) -> &[PeerId] {
        &self.preferred
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.next_deadline()
    }

    pub fn pop_due(&mut self, now: Instant) -> Vec<RelayTask> {
        let due = self.tasks.pop_due(now);
        for task in &due {
            if let RelayTask::Poll(relayer) = task {
                self.next_polls.remove(relayer);
            }
        }
        due
    }

    /// Schedule a poll, unless one is already due at roughly the same time or earlier.
    pub fn schedule_poll(&mut self, relayer: PeerId, delay: Duration, now: Instant) {
        let at = now + delay;
        if let Some(next) = self.next_polls.get(&relayer) {
            if at + self.config.min_poll_delay >= *next {
                return;
            }
        }
        self.tasks.schedule_at(at, RelayTask::Poll(relayer));
        self.next_polls.insert(relayer, at);
    }

    /// The "stick with what works" handicap: every relayer but the favourite costs extra.
    pub fn stick_handicap(&self, candidate: &PeerId) -> f64 {
        if self.favorite() == Some(*candidate) {
            0.0
        } else {
            self.config.stick_with_relayer_handicap
        }
    }

    /// Begin a shopping trip. Returns false if one is already under way.
    pub fn begin_shopping(&mut self) -> bool {
        if self.shopping {
            return false;
        }
        self.shopping = true;
        true
    }

    /// Apply the winner of a shopping trip and schedule the next one. Returns true if the favourite changed.
    pub fn finish_shopping(&mut self, best: Option<PeerId>, now: Instant) -> bool {
        self.shopping = false;
        self.tasks.schedule(self.config.relayer_shopping_delay, now, RelayTask::Shop);
        let Some(best) = best else {
            debug!("Couldn't find any relayers while shopping. Will try again later.");
            return false;
        };
        if self.favorite() == Some(best) {
            return false;
        }
        self.preferred.retain(|r| *r != best);
        self.preferred.insert(0, best);
        self.preferred.truncate(self.config.num_preferred_relayers);
        self.adopt_favorite(now);
        true
    }

    /// The shopping task fired while we are not polling. Try again later.
    pub fn skip_shopping(&mut self, now: Instant) {
        self.tasks.schedule(self.config.relayer_shopping_delay, now, RelayTask::Shop);
    }

    /// Report how a poll went. Returns true if we should go shopping.
    pub fn on_poll_result(&mut self, relayer: PeerId, success: bool, now: Instant) -> bool {
        let shop = !success && self.favorite() == Some(relayer);
        if self.active {
            if let Some(i) = self.preferred.iter().position(|r| *r == relayer) {
                self.schedule_poll(relayer, poll_delay(self.config.min_poll_delay, i), now);
            }
        }
        shop
    }

    /// A relayer delivered a message for us. Returns true if it became the favourite.
    pub fn on_relayed_message(&mut self, relayer: PeerId, now: Instant) -> bool {
        let promoted = rand::random::<bool>() && self.promote(relayer, now);
        self.schedule_poll(relayer, self.config.min_poll_delay, now);
        promoted
    }

    /// Move a relayer up one place, or into the middle of the list if it is not in it. Returns true if it became the
    /// favourite.
    fn promote(&mut self, relayer: PeerId, now: Instant) -> bool {
        match self.preferred.iter().position(|r| *r == relayer) {
            Some(0) => false,
            Some(i) => {
                self.preferred.swap(i, i - 1);
                trace!("Relayer {relayer} promoted to rank {}", i - 1);
                if i == 1 {
                    self.adopt_favorite(now);
                }
                i == 1
            }
            None => {
                let middle = (self.config.num_preferred_relayers / 2).min(self.preferred.len());
                self.preferred.insert(middle, relayer);
                self.preferred.truncate(self.config.num_preferred_relayers);
                trace!("Relayer {relayer} joins the preferred relayers at rank {middle}");
                let favorite = self.preferred.len() == 1;
                if favorite {
                    self.adopt_favorite(now);
                }
                favorite
            }
        }
    }

    fn adopt_favorite(&mut self, now: Instant) {
        if let Some(favorite) = self.favorite() {
            info!("🔁 {favorite} is now our favourite relayer");
            self.schedule_poll(favorite, Duration::ZERO, now);
        }
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.next_polls.clear();
        self.shopping = false;
        self.started = false;
    }
}

fn poll_delay(min: Duration, rank: usize) -> Duration {
    min.saturating_mul(1u32 << rank.min(16))
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId::digest(&[n])
    }

    fn router() -> RelayRouter {
        let mut router = RelayRouter::new(RelayConfig::default());
        router.set_reachable_directly(false);
        router
    }

    #[test]
    fn shopping_installs_a_favourite_and_polls_it() {
        let t0 = Instant::now();
        let mut r = router();
        r.start(t0);
        assert_eq!(r.pop_due(t0), vec![RelayTask::Shop]);
        assert!(r.begin_shopping());
        assert!(!r.begin_shopping(), "one trip at a time");
        assert!(r.finish_shopping(Some(id(1)), t0));
        assert_eq!(r.favorite(), Some(id(1)));
        assert_eq!(r.pop_due(t0), vec![RelayTask::Poll(id(1))]);
        assert_eq!(r.next_deadline(), Some(t0 + Duration::from_secs(300)));

        assert!(r.begin_shopping());
        assert!(!r.finish_shopping(Some(id(1)), t0), "same winner, no change");
        assert!(r.begin_shopping());
        assert!(r.finish_shopping(Some(id(2)), t0));
        assert_eq!(r.preferred(), &[id(2), id(1)]);
    }

    #[test]
    fn poll_backoff_by_rank() {
        let t0 = Instant::now();
        let mut r = router();
        r.begin_shopping();
        r.finish_shopping(Some(id(1)), t0);
        r.begin_shopping();
        r.finish_shopping(Some(id(2)), t0);
        r.pop_due(t0);
        assert!(!r.on_poll_result(id(1), true, t0));
        assert!(r.tasks.any_due_by(t0 + Duration::from_secs(120), |t| *t == RelayTask::Poll(id(1))));
        assert!(!r.tasks.any_due_by(t0 + Duration::from_secs(119), |t| *t == RelayTask::Poll(id(1))));
        assert!(r.on_poll_result(id(2), false, t0), "a failed poll of the favourite sends us shopping");
        assert!(r.tasks.any_due_by(t0 + Duration::from_secs(60), |t| *t == RelayTask::Poll(id(2))));
    }

    #[test]
    fn polls_are_not_duplicated() {
        let t0 = Instant::now();
        let mut r = router();
        r.schedule_poll(id(1), Duration::from_secs(60), t0);
        r.schedule_poll(id(1), Duration::from_secs(90), t0);
        r.schedule_poll(id(1), Duration::from_secs(10), t0);
        assert_eq!(r.pop_due(t0 + Duration::from_secs(100)), vec![RelayTask::Poll(id(1))]);
        r.schedule_poll(id(1), Duration::ZERO, t0);
        assert_eq!(r.pop_due(t0).len(), 1);
    }

    #[test]
    fn promotion() {
        let t0 = Instant::now();
        let mut r = router();
        assert!(r.promote(id(1), t0), "the first relayer is the favourite");
        for n in 2..=9 {
            r.promote(id(n), t0);
        }
        assert_eq!(r.preferred().len(), 8);
        assert_eq!(r.favorite(), Some(id(1)));
        let second = r.preferred()[1];
        assert!(r.promote(second, t0));
        assert_eq!(r.favorite(), Some(second));
        assert!(!r.promote(second, t0));
        assert_eq!(r.stick_handicap(&second), 0.0);
        assert_eq!(r.stick_handicap(&id(1)), 500.0);
    }

    #[test]
    fn polling_follows_reachability() {
        let mut config = RelayConfig::default();
        let mut r = RelayRouter::new(config.clone());
        r.set_reachable_directly(true);
        assert!(!r.is_polling());
        r.set_reachable_directly(false);
        assert!(r.is_polling());
        config.never_poll = true;
        let mut r = RelayRouter::new(config.clone());
        r.set_reachable_directly(false);
        assert!(!r.is_polling());
        config.never_poll = false;
        config.poll_relayer = true;
        let mut r = RelayRouter::new(config);
        r.set_reachable_directly(true);
        assert!(r.is_polling());
    }
}
