//! Per-session handshake parameters and their generator.
//!
//! [`SessionParams`] is produced once, when a session starts, and is never
//! mutated afterwards.  Generation is kept apart from the protocol logic so
//! tests can build a [`ParamGenerator`] from a fixed seed and get the same
//! parameters every run.

use std::ops::Range;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Range for `packet_count` and `packet_count2`.
pub const COUNT_RANGE: Range<u32> = 10..20;
/// Range for `payload_size` and `payload_size2`.
pub const SIZE_RANGE: Range<u32> = 10..60;
/// Range for every secret.
pub const SECRET_RANGE: Range<u32> = 0..500;

/// Everything the server reveals over the course of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionParams {
    // Revealed in stage A.
    pub packet_count: u32,
    pub payload_size: u32,
    pub udp_port: u16,
    pub secret_a: u32,
    // Revealed at the end of stage B.
    pub tcp_port: u16,
    pub secret_b: u32,
    // Revealed in stage C.
    pub packet_count2: u32,
    pub payload_size2: u32,
    pub secret_c: u32,
    pub fill_byte: u8,
    // Revealed in stage D.
    pub secret_d: u32,
}

/// Random source for [`SessionParams`].
#[derive(Debug)]
pub struct ParamGenerator {
    rng: StdRng,
}

impl ParamGenerator {
    /// Deterministic generator.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw a fresh parameter set for a session bound to `udp_port` / `tcp_port`.
    pub fn generate(&mut self, udp_port: u16, tcp_port: u16) -> SessionParams {
        let rng = &mut self.rng;
        SessionParams {
            packet_count: rng.random_range(COUNT_RANGE),
            payload_size: rng.random_range(SIZE_RANGE),
            udp_port,
            secret_a: rng.random_range(SECRET_RANGE),
            tcp_port,
            secret_b: rng.random_range(SECRET_RANGE),
            packet_count2: rng.random_range(COUNT_RANGE),
            payload_size2: rng.random_range(SIZE_RANGE),
            secret_c: rng.random_range(SECRET_RANGE),
            // Non-negative when read as a signed byte.
            fill_byte: rng.random_range(0..=0x7f),
            secret_d: rng.random_range(SECRET_RANGE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_values_fall_in_range() {
        let mut generator = ParamGenerator::seeded(7);
        for _ in 0..500 {
            let p = generator.generate(10_001, 10_002);
            assert!(COUNT_RANGE.contains(&p.packet_count));
            assert!(COUNT_RANGE.contains(&p.packet_count2));
            assert!(SIZE_RANGE.contains(&p.payload_size));
            assert!(SIZE_RANGE.contains(&p.payload_size2));
            for s in [p.secret_a, p.secret_b, p.secret_c, p.secret_d] {
                assert!(SECRET_RANGE.contains(&s));
            }
            assert!(p.fill_byte <= 0x7f);
            assert_eq!((p.udp_port, p.tcp_port), (10_001, 10_002));
        }
    }

    #[test]
    fn same_seed_same_params() {
        let a = ParamGenerator::seeded(42).generate(1, 2);
        let b = ParamGenerator::seeded(42).generate(1, 2);
        assert_eq!(a, b);
    }
}
