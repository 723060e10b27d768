//! Scoring of candidate counterparties. Lower is better.

use crate::identity::PeerId;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Handicap {
    Cost(f64),
    Disqualified,
}

impl Handicap {
    pub fn add(self, other: Handicap) -> Handicap {
        match (self, other) {
            (Handicap::Cost(a), Handicap::Cost(b)) => Handicap::Cost(a + b),
            _ => Handicap::Disqualified,
        }
    }

    pub fn cost(&self) -> Option<f64> {
        match self {
            Handicap::Cost(c) => Some(*c),
            Handicap::Disqualified => None,
        }
    }
}

pub trait Handicapper: Send {
    fn handicap(&self, counterparty: &PeerId, message_type: &str) -> Handicap;
}

impl<F> Handicapper for F
where
    F: Fn(&PeerId, &str) -> Handicap + Send,
{
    fn handicap(&self, counterparty: &PeerId, message_type: &str) -> Handicap {
        self(counterparty, message_type)
    }
}

#[derive(Default)]
pub struct HandicapperSet {
    handicappers: Vec<Box<dyn Handicapper>>,
}

impl HandicapperSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handicapper: Box<dyn Handicapper>) {
        self.handicappers.push(handicapper);
    }

    pub fn len(&self) -> usize {
        self.handicappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handicappers.is_empty()
    }

    pub fn handicap(&self, counterparty: &PeerId, message_type: &str) -> Handicap {
        self.handicappers
            .iter()
            .fold(Handicap::Cost(0.0), |acc, h| acc.add(h.handicap(counterparty, message_type)))
    }

    /// The cheapest candidate that no handicapper disqualifies. `extra` adds per-candidate costs known only to the
    /// caller. Ties go to the earliest candidate.
    pub fn best<'a, I, F>(&self, candidates: I, message_type: &str, mut extra: F) -> Option<PeerId>
    where
        I: IntoIterator<Item = &'a PeerId>,
        F: FnMut(&PeerId) -> f64,
    {
        let mut best: Option<(PeerId, f64)> = None;
        for candidate in candidates {
            let Some(cost) = self.handicap(candidate, message_type).cost() else {
                continue;
            };
            let cost = cost + extra(candidate);
            if best.map_or(true, |(_, b)| cost < b) {
                best = Some((*candidate, cost));
            }
        }
        best.map(|(id, _)| id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sums_and_disqualifies() {
        let a = PeerId::digest(b"a");
        let b = PeerId::digest(b"b");
        let c = PeerId::digest(b"c");
        let mut set = HandicapperSet::new();
        set.add(Box::new(move |id: &PeerId, _: &str| {
            if *id == a {
                Handicap::Cost(10.0)
            } else {
                Handicap::Cost(1.0)
            }
        }));
        set.add(Box::new(move |id: &PeerId, _: &str| {
            if *id == c {
                Handicap::Disqualified
            } else {
                Handicap::Cost(1.0)
            }
        }));
        assert_eq!(set.handicap(&a, "ping"), Handicap::Cost(11.0));
        assert_eq!(set.handicap(&c, "ping"), Handicap::Disqualified);
        assert_eq!(set.best([a, b, c].iter(), "ping", |_| 0.0), Some(b));
        assert_eq!(set.best([a, b, c].iter(), "ping", |id| if *id == b { 100.0 } else { 0.0 }), Some(a));
        assert_eq!(set.best([c].iter(), "ping", |_| 0.0), None);
    }
}
