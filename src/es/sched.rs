//! Scheduler-noise entropy source.
//!
//! Measures the timing of voluntary context switches: a `yield` forces the
//! scheduler to run, and the elapsed time depends on the runqueue state of
//! the whole machine. The default rate is zero; operators who have assessed
//! their workload may credit it via the configuration.

use std::time::Instant;

use zeroize::Zeroizing;

use super::{condition_into, EntropySource, SeedSlot};
use crate::config::Config;
use crate::defs::ESDM_ES_PAYLOAD_BYTES;

pub struct SchedEs;

fn harvest(dest: &mut [u8]) {
    for byte in dest.iter_mut() {
        let mut folded = 0u128;
        for _ in 0..4 {
            let start = Instant::now();
            std::thread::yield_now();
            folded ^= start.elapsed().as_nanos();
        }
        *byte = (folded as u8) ^ ((folded >> 8) as u8);
    }
}

impl EntropySource for SchedEs {
    fn name(&self) -> &'static str {
        "Scheduler"
    }

    fn rate_bits(&self, config: &Config) -> u32 {
        config.sched_entropy_rate()
    }

    fn poll(&self, requested_bits: u32, slot: &mut SeedSlot, config: &Config) {
        let rate = self.rate_bits(config);
        if rate == 0 || requested_bits == 0 {
            slot.bits = 0;
            return;
        }

        let mut raw = Zeroizing::new([0u8; ESDM_ES_PAYLOAD_BYTES]);
        harvest(raw.as_mut());
        condition_into(slot, raw.as_ref(), requested_bits.min(rate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_claims_nothing() {
        let cfg = Config::new(true);
        let mut slot = SeedSlot::empty();
        SchedEs.poll(256, &mut slot, &cfg);
        assert_eq!(slot.bits, 0);
    }

    #[test]
    fn test_raised_rate_claims_capped() {
        let cfg = Config::new(true);
        cfg.set_sched_entropy_rate(32);
        let mut slot = SeedSlot::empty();
        SchedEs.poll(256, &mut slot, &cfg);
        assert!(slot.bits <= 32);
    }
}
