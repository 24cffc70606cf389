//! Kernel RNG passthrough entropy source.
//!
//! Pulls from the operating system CSPRNG via `getrandom`. Outside FIPS
//! mode the kernel RNG is trusted with the configured rate; in FIPS mode it
//! contributes data but no credited entropy, since its internal conditioning
//! is not assessable from user space.

use zeroize::Zeroizing;

use super::{condition_into, EntropySource, SeedSlot};
use crate::config::Config;
use crate::defs::ESDM_ES_PAYLOAD_BYTES;

pub struct KrngEs;

impl EntropySource for KrngEs {
    fn name(&self) -> &'static str {
        "KernelRNG"
    }

    fn rate_bits(&self, config: &Config) -> u32 {
        if config.fips_enabled() {
            0
        } else {
            config.krng_entropy_rate()
        }
    }

    fn poll(&self, requested_bits: u32, slot: &mut SeedSlot, config: &Config) {
        let mut raw = Zeroizing::new([0u8; ESDM_ES_PAYLOAD_BYTES]);
        if getrandom::getrandom(raw.as_mut()).is_err() {
            slot.bits = 0;
            return;
        }

        // The payload is mixed in even when no entropy is credited.
        let claim = requested_bits.min(self.rate_bits(config));
        condition_into(slot, raw.as_ref(), claim);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForceFips;

    #[test]
    fn test_poll_delivers_payload() {
        let cfg = Config::new(true);
        cfg.set_force_fips(ForceFips::Disabled);
        let mut slot = SeedSlot::empty();
        KrngEs.poll(256, &mut slot, &cfg);
        assert!(slot.data.iter().any(|&b| b != 0));
        assert_eq!(slot.bits, KrngEs.rate_bits(&cfg).min(256));
    }

    #[test]
    fn test_fips_mode_credits_nothing() {
        let cfg = Config::new(true);
        cfg.set_force_fips(ForceFips::Enabled);
        let mut slot = SeedSlot::empty();
        KrngEs.poll(256, &mut slot, &cfg);
        assert_eq!(slot.bits, 0);
        // Payload still present for defence in depth.
        assert!(slot.data.iter().any(|&b| b != 0));
    }
}
