//! Stage-B acknowledgement decisions.
//!
//! The server does not acknowledge every valid stage-B packet; it models a
//! lossy link by skipping some acks, forcing the client to retransmit.  The
//! decision is behind the [`AckPolicy`] trait so tests can script exact
//! ack/no-ack sequences.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Default probability that a valid stage-B packet is acknowledged.
pub const DEFAULT_ACK_PROBABILITY: f64 = 2.0 / 3.0;

/// Decides whether the server acknowledges a correctly received packet.
pub trait AckPolicy: Send {
    fn should_ack(&mut self, packet_id: u32) -> bool;
}

/// Builds one policy per session.
pub type AckPolicyFactory = dyn Fn() -> Box<dyn AckPolicy> + Send + Sync;

/// Acknowledge with a fixed probability.
#[derive(Debug)]
pub struct RandomAck {
    probability: f64,
    rng: StdRng,
}

impl RandomAck {
    /// `probability` is clamped to `[0.0, 1.0]`.
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn seeded(probability: f64, seed: u64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomAck {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_PROBABILITY)
    }
}

impl AckPolicy for RandomAck {
    fn should_ack(&mut self, _packet_id: u32) -> bool {
        self.rng.random_bool(self.probability)
    }
}

/// Acknowledge everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAck;

impl AckPolicy for AlwaysAck {
    fn should_ack(&mut self, _packet_id: u32) -> bool {
        true
    }
}

/// Replay a fixed sequence of decisions, then acknowledge everything.
#[derive(Debug, Default, Clone)]
pub struct ScriptedAck {
    decisions: VecDeque<bool>,
}

impl ScriptedAck {
    pub fn new(decisions: impl IntoIterator<Item = bool>) -> Self {
        Self {
            decisions: decisions.into_iter().collect(),
        }
    }
}

impl AckPolicy for ScriptedAck {
    fn should_ack(&mut self, _packet_id: u32) -> bool {
        self.decisions.pop_front().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_replays_then_acks() {
        let mut p = ScriptedAck::new([false, true, false]);
        let got: Vec<bool> = (0..5).map(|i| p.should_ack(i)).collect();
        assert_eq!(got, vec![false, true, false, true, true]);
    }

    #[test]
    fn random_extremes_are_deterministic() {
        let mut never = RandomAck::seeded(0.0, 1);
        let mut always = RandomAck::seeded(1.0, 1);
        assert!((0..100).all(|i| !never.should_ack(i)));
        assert!((0..100).all(|i| always.should_ack(i)));
    }

    #[test]
    fn random_default_acks_some_and_skips_some() {
        let mut p = RandomAck::seeded(DEFAULT_ACK_PROBABILITY, 99);
        let acked = (0..300).filter(|&i| p.should_ack(i)).count();
        assert!(acked > 100 && acked < 300, "acked={acked}");
    }
}
