//! CPU hardware RNG entropy source.
//!
//! Uses RDSEED where available and falls back to RDRAND. The raw output is
//! never credited at face value: samples are collected with an oversampling
//! factor derived from the configured rate and conditioned through SHA-512.

use zeroize::Zeroizing;

use super::{condition_into, EntropySource, SeedSlot};
use crate::config::Config;
use crate::defs::{ESDM_DRNG_SECURITY_STRENGTH_BITS, ESDM_ES_PAYLOAD_BYTES};

pub struct CpuEs;

#[cfg(target_arch = "x86_64")]
mod hw {
    use core::arch::x86_64::{_rdrand64_step, _rdseed64_step};

    const MAX_RETRIES: usize = 10;

    pub(super) fn fill(dest: &mut [u8]) -> bool {
        if !std::arch::is_x86_feature_detected!("rdrand") {
            return false;
        }
        let have_rdseed = std::arch::is_x86_feature_detected!("rdseed");

        let mut i = 0;
        let mut retries = 0;
        while i < dest.len() {
            let mut val: u64 = 0;
            // RDSEED draws from the conditioner directly; prefer it and
            // fall back to RDRAND when it is transiently exhausted.
            let ok = unsafe {
                (have_rdseed && _rdseed64_step(&mut val) == 1) || _rdrand64_step(&mut val) == 1
            };
            if ok {
                let bytes = val.to_le_bytes();
                let todo = bytes.len().min(dest.len() - i);
                dest[i..i + todo].copy_from_slice(&bytes[..todo]);
                i += todo;
                retries = 0;
            } else {
                retries += 1;
                if retries > MAX_RETRIES {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod hw {
    pub(super) fn fill(_dest: &mut [u8]) -> bool {
        false
    }
}

impl EntropySource for CpuEs {
    fn name(&self) -> &'static str {
        "CPU"
    }

    fn rate_bits(&self, config: &Config) -> u32 {
        config.cpu_entropy_rate()
    }

    fn poll(&self, requested_bits: u32, slot: &mut SeedSlot, config: &Config) {
        let rate = self.rate_bits(config);
        if rate == 0 || requested_bits == 0 {
            slot.bits = 0;
            return;
        }

        // Oversample: to claim `rate` bits per strength, collect
        // strength/rate times the nominal payload before conditioning.
        let factor = (ESDM_DRNG_SECURITY_STRENGTH_BITS / rate.max(1)).max(1) as usize;
        let mut raw = Zeroizing::new(vec![0u8; ESDM_ES_PAYLOAD_BYTES * factor]);

        if !hw::fill(&mut raw) {
            slot.bits = 0;
            return;
        }

        condition_into(slot, &raw, requested_bits.min(rate));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_claims_at_most_rate() {
        let cfg = Config::new(true);
        let es = CpuEs;
        let mut slot = SeedSlot::empty();
        es.poll(4096, &mut slot, &cfg);
        assert!(slot.bits <= es.rate_bits(&cfg));
    }

    #[test]
    fn test_zero_rate_claims_nothing() {
        let cfg = Config::new(true);
        cfg.set_cpu_entropy_rate(0);
        let mut slot = SeedSlot::empty();
        CpuEs.poll(256, &mut slot, &cfg);
        assert_eq!(slot.bits, 0);
    }
}
