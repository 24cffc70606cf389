//! Auxiliary entropy pool.
//!
//! The only push-mode source: callers hand in data (`write_data`, the
//! privileged `rnd_add_entropy`) which is compressed into a running SHA-512
//! digest together with an entropy counter. Polls consume the counter, so
//! credited entropy is handed out exactly once.

use parking_lot::Mutex;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use super::{EntropySource, EsError, SeedSlot};
use crate::config::Config;
use crate::defs::{
    ESDM_AUX_POOL_CAP_BITS, ESDM_DRNG_SECURITY_STRENGTH_BITS, ESDM_ES_PAYLOAD_BYTES,
};

struct AuxInner {
    digest: [u8; ESDM_ES_PAYLOAD_BYTES],
    entropy_bits: u32,
}

impl Drop for AuxInner {
    fn drop(&mut self) {
        self.digest.zeroize();
    }
}

pub struct AuxPool {
    inner: Mutex<AuxInner>,
}

impl AuxPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AuxInner {
                digest: [0u8; ESDM_ES_PAYLOAD_BYTES],
                entropy_bits: 0,
            }),
        }
    }

    /// Mixes `data` into the pool. In FIPS mode caller-supplied entropy is
    /// never credited; the data itself is still compressed in.
    pub fn insert(&self, data: &[u8], credited_bits: u32, config: &Config) {
        let credited = if config.fips_enabled() { 0 } else { credited_bits };
        let mut inner = self.inner.lock();

        let mut hasher = Sha512::new();
        hasher.update(inner.digest);
        hasher.update(data);
        inner.digest.copy_from_slice(&hasher.finalize());

        inner.entropy_bits = inner
            .entropy_bits
            .saturating_add(credited)
            .min(ESDM_AUX_POOL_CAP_BITS);
    }

    /// Uncredited write path backing the `write_data` RPC.
    pub fn write_data(&self, data: &[u8], config: &Config) {
        self.insert(data, 0, config);
    }

    pub fn ent_cnt(&self) -> u32 {
        self.inner.lock().entropy_bits
    }

    /// Privileged counter adjustment; the result is clamped to the pool
    /// capacity. Negative deltas drain the counter.
    pub fn add_to_ent_cnt(&self, delta: i32) {
        let mut inner = self.inner.lock();
        let cnt = inner.entropy_bits as i64 + delta as i64;
        inner.entropy_bits = cnt.clamp(0, ESDM_AUX_POOL_CAP_BITS as i64) as u32;
    }

    /// Drops all accounted entropy. The pool data survives; only the
    /// accounting is reset.
    pub fn clear(&self) {
        self.inner.lock().entropy_bits = 0;
    }
}

impl Default for AuxPool {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for AuxPool {
    fn name(&self) -> &'static str {
        "AuxPool"
    }

    fn rate_bits(&self, _config: &Config) -> u32 {
        self.ent_cnt().min(ESDM_DRNG_SECURITY_STRENGTH_BITS)
    }

    fn poll(&self, requested_bits: u32, slot: &mut SeedSlot, _config: &Config) {
        let mut inner = self.inner.lock();

        // Forward-secure extraction: output and the successor state are
        // two distinct domain-separated digests of the pool.
        let mut out = Sha512::new();
        out.update(inner.digest);
        out.update([0x00]);
        slot.data.copy_from_slice(&out.finalize());

        let mut next = Sha512::new();
        next.update(inner.digest);
        next.update([0x01]);
        inner.digest.copy_from_slice(&next.finalize());

        let claim = requested_bits
            .min(inner.entropy_bits)
            .min(ESDM_DRNG_SECURITY_STRENGTH_BITS);
        inner.entropy_bits -= claim;
        slot.bits = claim;
    }

    fn add_entropy(&self, data: &[u8], bits: u32, config: &Config) -> Result<(), EsError> {
        if data.is_empty() {
            return Err(EsError::InvalidArgument);
        }
        // More credit than data bits is a caller error.
        if bits as usize > data.len() * 8 {
            return Err(EsError::InvalidArgument);
        }
        self.insert(data, bits, config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForceFips;

    fn cfg_no_fips() -> Config {
        let cfg = Config::new(true);
        cfg.set_force_fips(ForceFips::Disabled);
        cfg
    }

    #[test]
    fn test_write_back_credits_without_fips() {
        let cfg = cfg_no_fips();
        let pool = AuxPool::new();
        pool.add_entropy(&[0u8; 64], 64, &cfg).unwrap();
        assert_eq!(pool.ent_cnt(), 64);
    }

    #[test]
    fn test_write_back_credits_zero_in_fips() {
        let cfg = Config::new(true);
        cfg.set_force_fips(ForceFips::Enabled);
        let pool = AuxPool::new();
        pool.add_entropy(&[0u8; 64], 64, &cfg).unwrap();
        assert_eq!(pool.ent_cnt(), 0);
    }

    #[test]
    fn test_poll_consumes_entropy() {
        let cfg = cfg_no_fips();
        let pool = AuxPool::new();
        pool.insert(&[1u8; 32], 100, &cfg);

        let mut slot = SeedSlot::empty();
        pool.poll(60, &mut slot, &cfg);
        assert_eq!(slot.bits, 60);
        assert_eq!(pool.ent_cnt(), 40);

        pool.poll(256, &mut slot, &cfg);
        assert_eq!(slot.bits, 40);
        assert_eq!(pool.ent_cnt(), 0);
    }

    #[test]
    fn test_clear_resets_accounting_only() {
        let cfg = cfg_no_fips();
        let pool = AuxPool::new();
        pool.insert(&[2u8; 16], 128, &cfg);
        pool.clear();
        assert_eq!(pool.ent_cnt(), 0);

        // Pool still delivers payload data after a clear.
        let mut slot = SeedSlot::empty();
        pool.poll(256, &mut slot, &cfg);
        assert!(slot.data.iter().any(|&b| b != 0));
        assert_eq!(slot.bits, 0);
    }

    #[test]
    fn test_counter_adjustment_clamps() {
        let pool = AuxPool::new();
        pool.add_to_ent_cnt(10_000);
        assert_eq!(pool.ent_cnt(), ESDM_AUX_POOL_CAP_BITS);
        pool.add_to_ent_cnt(-20_000);
        assert_eq!(pool.ent_cnt(), 0);
    }

    #[test]
    fn test_over_crediting_rejected() {
        let cfg = cfg_no_fips();
        let pool = AuxPool::new();
        assert_eq!(
            pool.add_entropy(&[0u8; 4], 64, &cfg),
            Err(EsError::InvalidArgument)
        );
    }
}
