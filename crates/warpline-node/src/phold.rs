//! PHOLD: the classic synthetic benchmark for optimistic simulators.
//!
//! Every LP starts with a fixed population of events. Each event, when
//! executed, schedules exactly one successor: with some probability on a
//! random LP, otherwise on the executing LP, at `now + lookahead + jitter`.
//! The population therefore stays constant and the traffic pattern is
//! entirely determined by the seed.
//!
//! All randomness lives in the LP state, so restoring a checkpoint also
//! restores the random stream and re-execution after a rollback draws the
//! same numbers.

use bytes::Bytes;
use tracing::warn;
use warpline_core::{EventContext, Model};
use warpline_proto::{LpId, VirtualTime};

/// PHOLD parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PholdConfig {
    /// Total LPs across all nodes
    pub lps: u32,
    /// Initial events per LP
    pub population: u32,
    /// Chance, in percent, that a successor goes to a random LP
    pub remote_percent: u8,
    /// Minimum distance between an event and its successor
    pub lookahead: u64,
    /// Upper bound on the random part of the distance
    pub jitter: u64,
    /// Seed for every random stream
    pub seed: u64,
}

impl Default for PholdConfig {
    fn default() -> Self {
        Self { lps: 64, population: 4, remote_percent: 50, lookahead: 1, jitter: 10, seed: 42 }
    }
}

/// Per-LP PHOLD state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PholdState {
    /// Random stream position
    pub rng: u64,
    /// Events executed
    pub processed: u64,
    /// Order-sensitive digest of every executed event
    pub digest: u64,
}

/// The PHOLD model.
#[derive(Debug, Clone, Copy)]
pub struct Phold {
    config: PholdConfig,
}

impl Phold {
    /// Model with these parameters.
    pub fn new(config: PholdConfig) -> Self {
        Self { config }
    }

    /// Parameters.
    pub fn config(&self) -> &PholdConfig {
        &self.config
    }

    /// The initial population: `(lp, time, payload)` for every seed event,
    /// grouped by LP and in seeding order.
    pub fn initial_events(&self) -> Vec<(LpId, VirtualTime, Bytes)> {
        let mut events = Vec::new();
        for lp in 0..self.config.lps {
            let mut rng = self.config.seed ^ (u64::from(lp) << 32) ^ 0x5EED;
            for _ in 0..self.config.population {
                let at = 1 + next(&mut rng) % (self.config.jitter + 1);
                let token = next(&mut rng);
                events.push((lp, VirtualTime::new(at), Bytes::copy_from_slice(&token.to_be_bytes())));
            }
        }
        events
    }
}

/// `splitmix64` step.
fn next(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn mix(digest: u64, value: u64) -> u64 {
    let mut state = digest ^ value;
    next(&mut state)
}

impl Model for Phold {
    type State = PholdState;

    fn init(&self, lp: LpId) -> PholdState {
        PholdState { rng: self.config.seed ^ u64::from(lp).wrapping_mul(0xA24B_AED4_963E_E407), processed: 0, digest: 0 }
    }

    fn on_event(&self, ctx: &mut EventContext, state: &mut PholdState, payload: &[u8]) {
        let now = ctx.now();
        let token = <[u8; 8]>::try_from(payload).map_or(0, u64::from_be_bytes);
        state.processed += 1;
        state.digest = mix(mix(state.digest, now.ticks()), token);

        let lps = u64::from(self.config.lps.max(1));
        let remote = next(&mut state.rng) % 100 < u64::from(self.config.remote_percent);
        let dest = if remote {
            LpId::try_from(next(&mut state.rng) % lps).unwrap_or(ctx.lp())
        } else {
            ctx.lp()
        };
        let delay = self.config.lookahead.max(1) + next(&mut state.rng) % (self.config.jitter + 1);
        let token = next(&mut state.rng);

        let at = now.saturating_add(delay);
        if let Err(e) = ctx.schedule(dest, at, Bytes::copy_from_slice(&token.to_be_bytes())) {
            warn!(lp = ctx.lp(), %now, error = %e, "successor dropped");
        }
    }

    fn state_size(&self, _state: &PholdState) -> usize {
        std::mem::size_of::<PholdState>()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;
    use warpline_core::Scheduled;

    use super::*;

    fn run_once(model: &Phold, lp: LpId, state: &mut PholdState, at: u64) -> Scheduled {
        let mut ctx = EventContext::new(lp, VirtualTime::new(at), false);
        model.on_event(&mut ctx, state, &7u64.to_be_bytes());
        let (mut scheduled, request) = ctx.into_parts();
        assert!(request.is_none());
        assert_eq!(scheduled.len(), 1);
        scheduled.pop().unwrap()
    }

    #[test]
    fn population_is_seeded_per_lp() {
        let model = Phold::new(PholdConfig { lps: 3, population: 2, ..PholdConfig::default() });
        let events = model.initial_events();
        assert_eq!(events.len(), 6);
        assert_eq!(events.iter().map(|(lp, ..)| *lp).collect::<Vec<_>>(), vec![0, 0, 1, 1, 2, 2]);
        assert!(events.iter().all(|(_, at, payload)| at.ticks() >= 1 && payload.len() == 8));
    }

    #[test]
    fn local_only_stays_home() {
        let model = Phold::new(PholdConfig { remote_percent: 0, ..PholdConfig::default() });
        let mut state = model.init(5);
        for at in 1..20 {
            let Scheduled::Event { dest, .. } = run_once(&model, 5, &mut state, at) else {
                unreachable!("PHOLD only schedules events")
            };
            assert_eq!(dest, 5);
        }
        assert_eq!(state.processed, 19);
    }

    proptest! {
        #[test]
        fn same_state_same_successor(seed in any::<u64>(), lp in 0u32..64, at in 1u64..1_000_000) {
            let model = Phold::new(PholdConfig { seed, ..PholdConfig::default() });
            let mut a = model.init(lp);
            let mut b = a.clone();
            prop_assert_eq!(run_once(&model, lp, &mut a, at), run_once(&model, lp, &mut b, at));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn successor_respects_lookahead(lookahead in 1u64..50, jitter in 0u64..50, at in 1u64..1_000_000) {
            let model = Phold::new(PholdConfig { lookahead, jitter, ..PholdConfig::default() });
            let mut state = model.init(0);
            let Scheduled::Event { dest, at: next_at, .. } = run_once(&model, 0, &mut state, at) else {
                unreachable!("PHOLD only schedules events")
            };
            prop_assert!(dest < 64);
            prop_assert!(next_at.ticks() >= at + lookahead);
            prop_assert!(next_at.ticks() <= at + lookahead + jitter);
        }
    }
}
