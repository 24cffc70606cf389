//! Entropy accounting across all sources.
//!
//! The accountant decides how much entropy to request per polling round,
//! fills the seed buffer from every source, and converts per-source claims
//! into one credited total. In FIPS mode the SP 800-90C oversampling rules
//! apply: requests grow by a fixed margin and every per-source credit is
//! reduced by the oversampling rate before threshold comparisons.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::aux_pool::AuxPool;
use super::{cpu::CpuEs, jitter::JitterEs, krng::KrngEs, sched::SchedEs};
use super::{EntropySource, SeedBuf, ESDM_ES_COUNT};
use crate::config::Config;
use crate::defs::*;

pub struct EsMgr {
    sources: [Arc<dyn EntropySource>; ESDM_ES_COUNT],
    aux: Arc<AuxPool>,
    entropy_thresh: AtomicU32,
    /// Wake-up channel for the seeding thread; config setters and entropy
    /// insertions pulse it.
    monitor: Mutex<bool>,
    monitor_cond: Condvar,
}

impl EsMgr {
    pub fn new() -> Self {
        let aux = Arc::new(AuxPool::new());
        let sources: [Arc<dyn EntropySource>; ESDM_ES_COUNT] = [
            Arc::new(CpuEs),
            Arc::new(JitterEs),
            Arc::new(KrngEs),
            Arc::new(SchedEs),
            aux.clone(),
        ];
        Self {
            sources,
            aux,
            entropy_thresh: AtomicU32::new(ESDM_INIT_ENTROPY_BITS),
            monitor: Mutex::new(false),
            monitor_cond: Condvar::new(),
        }
    }

    pub fn aux(&self) -> &AuxPool {
        &self.aux
    }

    pub fn sources(&self) -> &[Arc<dyn EntropySource>] {
        &self.sources
    }

    /// Entropy in bits one seeding round shall gather. Initial seeding asks
    /// for more than the security strength; FIPS mode adds the per-source
    /// oversampling margin on top.
    pub fn seed_entropy_target(&self, fully_seeded: bool, config: &Config) -> u32 {
        let mut bits = ESDM_DRNG_SECURITY_STRENGTH_BITS;
        if !fully_seeded {
            bits += ESDM_SEED_INIT_ADD_BITS;
        }
        if ESDM_OVERSAMPLE_ENTROPY_SOURCES && config.fips_enabled() {
            bits += ESDM_OVERSAMPLE_ES_BITS;
        }
        bits
    }

    /// Polls every source for up to `requested_bits` into `buf`.
    pub fn fill_seed_buffer(&self, buf: &mut SeedBuf, requested_bits: u32, config: &Config) {
        for (idx, source) in self.sources.iter().enumerate() {
            source.poll(requested_bits, &mut buf.slots[idx], config);
            log::debug!(
                "entropy source {} delivered {} bits",
                source.name(),
                buf.slots[idx].bits
            );
        }
    }

    fn reduce_by_osr(&self, bits: u32, config: &Config) -> u32 {
        if ESDM_OVERSAMPLE_ENTROPY_SOURCES && config.fips_enabled() {
            bits.saturating_sub(ESDM_OVERSAMPLE_ES_BITS)
        } else {
            bits
        }
    }

    /// Credited entropy of a filled seed buffer, after oversampling
    /// reduction, with each source capped at the security strength.
    pub fn credited_bits(&self, buf: &SeedBuf, config: &Config) -> u32 {
        buf.slots
            .iter()
            .map(|s| self.reduce_by_osr(s.bits.min(ESDM_DRNG_SECURITY_STRENGTH_BITS), config))
            .sum()
    }

    pub fn is_full_seed(&self, credited_bits: u32) -> bool {
        credited_bits >= ESDM_DRNG_SECURITY_STRENGTH_BITS
    }

    pub fn is_min_seed(&self, credited_bits: u32) -> bool {
        credited_bits >= ESDM_MIN_SEED_ENTROPY_BITS
    }

    /// Entropy the sources could deliver right now, after oversampling
    /// reduction. An estimate from declared rates, not a measurement.
    pub fn avail_entropy_bits(&self, config: &Config) -> u32 {
        self.sources
            .iter()
            .map(|s| {
                self.reduce_by_osr(
                    s.rate_bits(config).min(ESDM_DRNG_SECURITY_STRENGTH_BITS),
                    config,
                )
            })
            .sum()
    }

    pub fn entropy_thresh(&self) -> u32 {
        self.entropy_thresh.load(Ordering::Relaxed)
    }

    pub fn set_entropy_thresh(&self, bits: u32) {
        self.entropy_thresh.store(bits, Ordering::Relaxed);
    }

    /// Whether the seeding scheduler should run another round: the DRNGs
    /// are not fully seeded yet and the sources can plausibly deliver the
    /// pool threshold.
    pub fn reseed_wanted(&self, all_fully_seeded: bool, config: &Config) -> bool {
        !all_fully_seeded && self.avail_entropy_bits(config) >= self.entropy_thresh()
    }

    /// Whether the status record should advertise hunger for entropy.
    pub fn need_entropy(&self, config: &Config) -> bool {
        self.avail_entropy_bits(config) < self.entropy_thresh()
    }

    /// Pulses the seeding thread (new entropy, retuned rates, forced
    /// reseed).
    pub fn wake_seeder(&self) {
        let mut pending = self.monitor.lock();
        *pending = true;
        self.monitor_cond.notify_all();
    }

    /// Parks the seeding thread until woken or `timeout` elapsed. Returns
    /// true when a wake-up was pending.
    pub fn wait_seeder(&self, timeout: Duration) -> bool {
        let mut pending = self.monitor.lock();
        if !*pending {
            self.monitor_cond.wait_for(&mut pending, timeout);
        }
        core::mem::replace(&mut *pending, false)
    }
}

impl Default for EsMgr {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForceFips;

    fn cfg(fips: bool) -> Config {
        let cfg = Config::new(true);
        cfg.set_force_fips(if fips { ForceFips::Enabled } else { ForceFips::Disabled });
        cfg
    }

    #[test]
    fn test_seed_target_grows_for_initial_and_fips() {
        let es = EsMgr::new();
        let plain = cfg(false);
        let fips = cfg(true);

        assert_eq!(
            es.seed_entropy_target(true, &plain),
            ESDM_DRNG_SECURITY_STRENGTH_BITS
        );
        assert_eq!(
            es.seed_entropy_target(false, &plain),
            ESDM_DRNG_SECURITY_STRENGTH_BITS + ESDM_SEED_INIT_ADD_BITS
        );
        assert_eq!(
            es.seed_entropy_target(false, &fips),
            ESDM_DRNG_SECURITY_STRENGTH_BITS + ESDM_SEED_INIT_ADD_BITS + ESDM_OVERSAMPLE_ES_BITS
        );
    }

    #[test]
    fn test_credited_bits_reduced_in_fips() {
        let es = EsMgr::new();
        let mut buf = SeedBuf::new();
        buf.slots[0].bits = 100;
        buf.slots[1].bits = 30;

        assert_eq!(es.credited_bits(&buf, &cfg(false)), 130);
        // Each contributing source is docked the oversampling margin.
        assert_eq!(
            es.credited_bits(&buf, &cfg(true)),
            100u32.saturating_sub(ESDM_OVERSAMPLE_ES_BITS)
        );
    }

    #[test]
    fn test_full_seed_round_without_fips() {
        // With the kernel RNG trusted at full strength, one polling round
        // must credit enough for a full seed.
        let es = EsMgr::new();
        let config = cfg(false);
        let mut buf = SeedBuf::new();
        let target = es.seed_entropy_target(false, &config);
        es.fill_seed_buffer(&mut buf, target, &config);
        assert!(es.is_full_seed(es.credited_bits(&buf, &config)));
    }

    #[test]
    fn test_seeder_wakeup() {
        let es = EsMgr::new();
        es.wake_seeder();
        assert!(es.wait_seeder(Duration::from_millis(1)));
        // Second wait times out with no pending pulse.
        assert!(!es.wait_seeder(Duration::from_millis(1)));
    }

    #[test]
    fn test_reseed_wanted_honours_threshold() {
        let es = EsMgr::new();
        let config = cfg(false);
        assert!(es.reseed_wanted(false, &config));
        es.set_entropy_thresh(u32::MAX);
        assert!(!es.reseed_wanted(false, &config));
        assert!(es.need_entropy(&config));
    }
}
