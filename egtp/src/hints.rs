//! Advisory hints about expected future traffic with a counterparty.
//!
//! Hints travel with every send and accumulate on the TCP strategy used for a counterparty. The connection pool
//! reads them to decide which connections are worth keeping open.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CommHints: u32 {
        /// We expect the counterparty to answer this message.
        const EXPECT_RESPONSE = 1 << 0;
        /// We will probably talk to this counterparty again, but not necessarily soon.
        const EXPECT_MORE_TRANSACTIONS = 1 << 1;
        /// The connection may be torn down as soon as this message is delivered.
        const EXPECT_NO_MORE_COMMS = 1 << 2;
        /// We owe the counterparty a response.
        const EXPECT_TO_RESPOND = 1 << 3;
        const THIS_IS_A_RESPONSE = 1 << 4;
    }
}

impl CommHints {
    pub const NO_HINT: CommHints = CommHints::empty();
}

impl Default for CommHints {
    fn default() -> Self {
        CommHints::NO_HINT
    }
}

impl Serialize for CommHints {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CommHints {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bits = u32::deserialize(deserializer)?;
        Ok(CommHints::from_bits_truncate(bits))
    }
}

impl Display for CommHints {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(CommHints, &str); 5] = [
            (CommHints::EXPECT_RESPONSE, "expect-response"),
            (CommHints::EXPECT_MORE_TRANSACTIONS, "expect-more-transactions"),
            (CommHints::EXPECT_NO_MORE_COMMS, "expect-no-more-comms"),
            (CommHints::EXPECT_TO_RESPOND, "expect-to-respond"),
            (CommHints::THIS_IS_A_RESPONSE, "this-is-a-response"),
        ];
        if self.is_empty() {
            return write!(f, "no-hint");
        }
        let names = NAMES.iter().filter(|(h, _)| self.contains(*h)).map(|(_, n)| *n).collect::<Vec<_>>();
        write!(f, "{}", names.join("|"))
    }
}

/// Hint state accumulated on a strategy over many sends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HintState {
    pub hints: CommHints,
    pub expected_responses: u32,
    pub expected_sends: u32,
}

impl HintState {
    /// Fold the hint of an outgoing message into the accumulated state.
    pub fn record_send(&mut self, hint: CommHints) {
        if hint.contains(CommHints::THIS_IS_A_RESPONSE)
            && self.hints.contains(CommHints::EXPECT_TO_RESPOND)
            && self.expected_sends > 0
        {
            self.expected_sends -= 1;
            if self.expected_sends == 0 {
                self.hints.remove(CommHints::EXPECT_TO_RESPOND);
            }
        }
        if hint.contains(CommHints::EXPECT_RESPONSE) {
            self.expected_responses += 1;
        }
        self.hints |= hint & !CommHints::THIS_IS_A_RESPONSE;
    }

    /// Fold the hint of an incoming message into the accumulated state.
    pub fn record_receive(&mut self, hint: CommHints) {
        if hint.contains(CommHints::THIS_IS_A_RESPONSE) && self.expected_responses > 0 {
            self.expected_responses -= 1;
            if self.expected_responses == 0 {
                self.hints.remove(CommHints::EXPECT_RESPONSE);
            }
        }
        if hint.contains(CommHints::EXPECT_TO_RESPOND) {
            self.expected_sends += 1;
            self.hints |= CommHints::EXPECT_TO_RESPOND;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bit_values() {
        assert_eq!(CommHints::EXPECT_RESPONSE.bits(), 1);
        assert_eq!(CommHints::EXPECT_MORE_TRANSACTIONS.bits(), 2);
        assert_eq!(CommHints::EXPECT_NO_MORE_COMMS.bits(), 4);
        assert_eq!(CommHints::EXPECT_TO_RESPOND.bits(), 8);
        assert_eq!(CommHints::THIS_IS_A_RESPONSE.bits(), 16);
        assert!(CommHints::from_bits(32).is_none());
        assert_eq!(CommHints::from_bits(9), Some(CommHints::EXPECT_RESPONSE | CommHints::EXPECT_TO_RESPOND));
    }

    #[test]
    fn responding_clears_expect_to_respond() {
        let mut state = HintState::default();
        state.record_receive(CommHints::EXPECT_TO_RESPOND);
        assert!(state.hints.contains(CommHints::EXPECT_TO_RESPOND));
        assert_eq!(state.expected_sends, 1);
        state.record_send(CommHints::THIS_IS_A_RESPONSE);
        assert_eq!(state.expected_sends, 0);
        assert!(!state.hints.intersects(CommHints::EXPECT_TO_RESPOND | CommHints::THIS_IS_A_RESPONSE));
    }

    #[test]
    fn expected_responses_are_counted() {
        let mut state = HintState::default();
        state.record_send(CommHints::EXPECT_RESPONSE);
        state.record_send(CommHints::EXPECT_RESPONSE | CommHints::EXPECT_MORE_TRANSACTIONS);
        assert_eq!(state.expected_responses, 2);
        state.record_receive(CommHints::THIS_IS_A_RESPONSE);
        assert!(state.hints.contains(CommHints::EXPECT_RESPONSE));
        state.record_receive(CommHints::THIS_IS_A_RESPONSE);
        assert!(!state.hints.contains(CommHints::EXPECT_RESPONSE));
        assert!(state.hints.contains(CommHints::EXPECT_MORE_TRANSACTIONS));
        assert_eq!(format!("{}", state.hints), "expect-more-transactions");
    }
}
