//! Runtime configuration.
//!
//! A single record of tunables: per-source entropy rates, the reseed
//! ceiling, the node cap and FIPS forcing. All fields are atomics so that
//! RPC workers can retune a running daemon without taking any lock.
//!
//! # Design
//! - Entropy rates are the operator's conservative estimate, clamped to
//!   `[0, ESDM_DRNG_SECURITY_STRENGTH_BITS]` on every store.
//! - `fips_enabled` prefers the runtime override and falls back to the
//!   environment's FIPS status.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::defs::*;

/// Runtime override for the environment's FIPS status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceFips {
    Unset,
    Enabled,
    Disabled,
}

impl ForceFips {
    fn to_u8(self) -> u8 {
        match self {
            ForceFips::Unset => 0,
            ForceFips::Enabled => 1,
            ForceFips::Disabled => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ForceFips::Enabled,
            2 => ForceFips::Disabled,
            _ => ForceFips::Unset,
        }
    }
}

/// Runtime-tunable ESDM configuration.
pub struct Config {
    cpu_entropy_rate_bits: AtomicU32,
    jent_entropy_rate_bits: AtomicU32,
    krng_entropy_rate_bits: AtomicU32,
    sched_entropy_rate_bits: AtomicU32,
    drng_max_wo_reseed: AtomicU32,
    max_nodes: AtomicU32,
    force_fips: AtomicU8,
    /// FIPS status of the surrounding environment, sampled at creation.
    env_fips: bool,
    testmode: bool,
}

fn entropy_rate_max(val: u32) -> u32 {
    val.min(ESDM_DRNG_SECURITY_STRENGTH_BITS)
}

/// Reads the kernel FIPS flag; the `ESDM_SERVER_FORCE_FIPS` environment
/// variable overrides it when set to any value.
fn env_fips_enabled() -> bool {
    if std::env::var_os("ESDM_SERVER_FORCE_FIPS").is_some() {
        return true;
    }
    match std::fs::read_to_string("/proc/sys/crypto/fips_enabled") {
        Ok(v) => v.trim() == "1",
        Err(_) => false,
    }
}

impl Config {
    pub fn new(testmode: bool) -> Self {
        let cfg = Self {
            cpu_entropy_rate_bits: AtomicU32::new(ESDM_CPU_ENTROPY_RATE),
            jent_entropy_rate_bits: AtomicU32::new(ESDM_JENT_ENTROPY_RATE),
            krng_entropy_rate_bits: AtomicU32::new(ESDM_KERNEL_RNG_ENTROPY_RATE),
            sched_entropy_rate_bits: AtomicU32::new(ESDM_SCHED_ENTROPY_RATE),
            drng_max_wo_reseed: AtomicU32::new(ESDM_DRNG_MAX_WITHOUT_RESEED),
            max_nodes: AtomicU32::new(u32::MAX),
            force_fips: AtomicU8::new(ForceFips::Unset.to_u8()),
            env_fips: env_fips_enabled(),
            testmode,
        };
        cfg.init();
        cfg
    }

    /// Applies the clamps and the FIPS Jitter upgrade. Idempotent.
    pub(crate) fn init(&self) {
        for rate in [
            &self.cpu_entropy_rate_bits,
            &self.jent_entropy_rate_bits,
            &self.krng_entropy_rate_bits,
            &self.sched_entropy_rate_bits,
        ] {
            rate.store(entropy_rate_max(rate.load(Ordering::Relaxed)), Ordering::Relaxed);
        }

        // In FIPS mode the Jitter RNG carries full entropy unless the
        // operator overrode the default, or the default is zero (an RBG2
        // construction that intends to exclude the Jitter RNG).
        if self.fips_enabled()
            && ESDM_JENT_ENTROPY_RATE > 0
            && self.jent_entropy_rate() == ESDM_JENT_ENTROPY_RATE
        {
            self.set_jent_entropy_rate(ESDM_DRNG_SECURITY_STRENGTH_BITS);
        }
    }

    pub fn testmode(&self) -> bool {
        self.testmode
    }

    pub fn cpu_entropy_rate(&self) -> u32 {
        self.cpu_entropy_rate_bits.load(Ordering::Relaxed)
    }

    pub fn set_cpu_entropy_rate(&self, bits: u32) {
        self.cpu_entropy_rate_bits.store(entropy_rate_max(bits), Ordering::Relaxed);
    }

    pub fn jent_entropy_rate(&self) -> u32 {
        self.jent_entropy_rate_bits.load(Ordering::Relaxed)
    }

    pub fn set_jent_entropy_rate(&self, bits: u32) {
        self.jent_entropy_rate_bits.store(entropy_rate_max(bits), Ordering::Relaxed);
    }

    pub fn krng_entropy_rate(&self) -> u32 {
        self.krng_entropy_rate_bits.load(Ordering::Relaxed)
    }

    pub fn set_krng_entropy_rate(&self, bits: u32) {
        self.krng_entropy_rate_bits.store(entropy_rate_max(bits), Ordering::Relaxed);
    }

    pub fn sched_entropy_rate(&self) -> u32 {
        self.sched_entropy_rate_bits.load(Ordering::Relaxed)
    }

    pub fn set_sched_entropy_rate(&self, bits: u32) {
        self.sched_entropy_rate_bits.store(entropy_rate_max(bits), Ordering::Relaxed);
    }

    pub fn drng_max_wo_reseed(&self) -> u32 {
        self.drng_max_wo_reseed.load(Ordering::Relaxed)
    }

    pub fn max_nodes(&self) -> u32 {
        self.max_nodes.load(Ordering::Relaxed).max(1)
    }

    /// Test-only tunable, honoured in test mode.
    pub fn set_drng_max_wo_reseed(&self, val: u32) {
        if self.testmode {
            self.drng_max_wo_reseed.store(val, Ordering::Relaxed);
        }
    }

    /// Test-only tunable, honoured in test mode.
    pub fn set_max_nodes(&self, val: u32) {
        if self.testmode {
            self.max_nodes.store(val, Ordering::Relaxed);
        }
    }

    pub fn force_fips(&self) -> ForceFips {
        ForceFips::from_u8(self.force_fips.load(Ordering::Relaxed))
    }

    pub fn set_force_fips(&self, val: ForceFips) {
        self.force_fips.store(val.to_u8(), Ordering::Relaxed);
    }

    pub fn fips_enabled(&self) -> bool {
        match self.force_fips() {
            ForceFips::Unset => self.env_fips,
            ForceFips::Enabled => true,
            ForceFips::Disabled => false,
        }
    }

    /// Number of scheduling nodes the manager may allocate DRNGs for.
    pub fn online_nodes(&self) -> u32 {
        let online = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        online.min(self.max_nodes())
    }

    /// Node the calling thread currently executes on.
    pub fn curr_node(&self) -> u32 {
        let cpu = unsafe { libc::sched_getcpu() };
        let cpu = if cpu < 0 { 0 } else { cpu as u32 };
        cpu % self.max_nodes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entropy_rate_clamp() {
        let cfg = Config::new(true);
        for v in [0u32, 1, 255, 256, 257, 4096, u32::MAX] {
            cfg.set_cpu_entropy_rate(v);
            assert_eq!(
                cfg.cpu_entropy_rate(),
                v.min(ESDM_DRNG_SECURITY_STRENGTH_BITS)
            );
        }
    }

    #[test]
    fn test_force_fips_round_trip() {
        let cfg = Config::new(true);
        cfg.set_force_fips(ForceFips::Enabled);
        assert!(cfg.fips_enabled());
        cfg.set_force_fips(ForceFips::Disabled);
        assert!(!cfg.fips_enabled());
    }

    #[test]
    fn test_fips_jitter_upgrade() {
        // init() on a FIPS-forced config raises the default Jitter rate to
        // the full security strength.
        let cfg = Config::new(true);
        cfg.set_jent_entropy_rate(ESDM_JENT_ENTROPY_RATE);
        cfg.set_force_fips(ForceFips::Enabled);
        cfg.init();
        assert_eq!(cfg.jent_entropy_rate(), ESDM_DRNG_SECURITY_STRENGTH_BITS);
    }

    #[test]
    fn test_testmode_gates_test_setters() {
        let cfg = Config::new(false);
        let before = cfg.drng_max_wo_reseed();
        cfg.set_drng_max_wo_reseed(7);
        assert_eq!(cfg.drng_max_wo_reseed(), before);

        let cfg = Config::new(true);
        cfg.set_drng_max_wo_reseed(7);
        assert_eq!(cfg.drng_max_wo_reseed(), 7);
    }

    #[test]
    fn test_nodes_intersect_max_nodes() {
        let cfg = Config::new(true);
        cfg.set_max_nodes(1);
        assert_eq!(cfg.online_nodes(), 1);
        assert_eq!(cfg.curr_node(), 0);
    }
}
