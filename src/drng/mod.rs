//! DRNG instances.
//!
//! One [`Drng`] owns an allocated DRBG state plus the reseed bookkeeping:
//! the request countdown, the count of generate operations since the last
//! full seed, the seed timestamp and the force-reseed latch. All crypto
//! operations run under the instance's exclusive lock; the hash descriptor
//! sits behind a reader/writer lock so it can be swapped at runtime.

pub mod mgr;

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::crypto::{CryptoError, DrngCb, DrngState, HashCb};
use crate::defs::ESDM_DRNG_RESEED_THRESH;
use crate::error::EsdmError;

/// Wall-clock seconds since the epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Seconds elapsed since `base`. Returns 0 when `base` lies in the future,
/// which makes the stagger-dated seed timestamps safe to compare.
pub(crate) fn time_after_now(base: u64) -> u64 {
    now_secs().saturating_sub(base)
}

struct DrngCore {
    state: Option<Box<dyn DrngState>>,
    cb: Arc<dyn DrngCb>,
}

pub struct Drng {
    core: Mutex<DrngCore>,
    hash: RwLock<Arc<dyn HashCb>>,
    requests: AtomicI32,
    requests_since_fully_seeded: AtomicU32,
    last_seeded: AtomicU64,
    fully_seeded: AtomicBool,
    force_reseed: AtomicBool,
}

impl Drng {
    /// A new, unallocated instance carrying the given descriptors.
    pub fn new(hash_cb: Arc<dyn HashCb>, drng_cb: Arc<dyn DrngCb>) -> Self {
        Self {
            core: Mutex::new(DrngCore {
                state: None,
                cb: drng_cb,
            }),
            hash: RwLock::new(hash_cb),
            requests: AtomicI32::new(ESDM_DRNG_RESEED_THRESH as i32),
            requests_since_fully_seeded: AtomicU32::new(0),
            last_seeded: AtomicU64::new(0),
            fully_seeded: AtomicBool::new(false),
            force_reseed: AtomicBool::new(true),
        }
    }

    /// Allocates the DRBG state through the descriptor. Idempotent.
    pub fn alloc(&self, security_strength_bytes: usize) -> Result<(), CryptoError> {
        let mut core = self.core.lock();
        if core.state.is_none() {
            core.state = Some(core.cb.alloc(security_strength_bytes)?);
            drop(core);
            self.reset();
        }
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        self.core.lock().state.is_some()
    }

    /// Clears counters and latches a reseed: the instance must prove itself
    /// again before it counts as fully seeded.
    pub fn reset(&self) {
        self.requests
            .store(ESDM_DRNG_RESEED_THRESH as i32, Ordering::Relaxed);
        self.requests_since_fully_seeded.store(0, Ordering::Relaxed);
        self.last_seeded.store(now_secs(), Ordering::Relaxed);
        self.fully_seeded.store(false, Ordering::Relaxed);
        self.force_reseed.store(true, Ordering::Relaxed);
        log::debug!("reset DRNG");
    }

    /// Injects seed material under the instance lock.
    ///
    /// On success the request countdown is rearmed, the timestamp advances
    /// and the force-reseed latch clears; a seed carrying full entropy also
    /// clears the generate-operation debt. On failure only the force-reseed
    /// latch is set; the state is no worse than before.
    pub fn inject(&self, material: &[u8], fully_seeded: bool, drng_type: &str) {
        let mut core = self.core.lock();
        let Some(state) = core.state.as_mut() else {
            return;
        };
        log::debug!("seeding {} DRNG with {} bytes", drng_type, material.len());

        if state.seed(material).is_err() {
            log::warn!("seeding of {} DRNG failed", drng_type);
            self.force_reseed.store(true, Ordering::Relaxed);
            return;
        }

        let gc = (ESDM_DRNG_RESEED_THRESH as i64 - self.requests.load(Ordering::Relaxed) as i64)
            .max(0) as u32;
        log::debug!(
            "{} DRNG stats since last seeding: {} secs; generate calls: {}",
            drng_type,
            time_after_now(self.last_seeded.load(Ordering::Relaxed)),
            gc
        );

        if fully_seeded {
            self.requests_since_fully_seeded.store(0, Ordering::Relaxed);
        } else {
            self.requests_since_fully_seeded
                .fetch_add(gc, Ordering::Relaxed);
        }
        self.last_seeded.store(now_secs(), Ordering::Relaxed);
        self.requests
            .store(ESDM_DRNG_RESEED_THRESH as i32, Ordering::Relaxed);
        self.force_reseed.store(false, Ordering::Relaxed);

        if fully_seeded && !self.fully_seeded.swap(true, Ordering::Relaxed) {
            log::debug!("{} DRNG fully seeded", drng_type);
        }
    }

    /// Generates one chunk under the instance lock. The DRBG must fill the
    /// whole slice; anything less is a fault.
    pub fn generate_chunk(&self, out: &mut [u8]) -> Result<usize, EsdmError> {
        let mut core = self.core.lock();
        let Some(state) = core.state.as_mut() else {
            return Err(EsdmError::NotAvailable);
        };
        match state.generate(out) {
            Ok(n) if n == out.len() => Ok(n),
            Ok(_) | Err(_) => {
                log::warn!("getting random data from DRNG failed");
                Err(EsdmError::Fatal)
            }
        }
    }

    /// Deallocates the DRBG state (shutdown path).
    pub fn dealloc(&self) {
        self.core.lock().state = None;
    }

    pub fn hash_cb(&self) -> Arc<dyn HashCb> {
        self.hash.read().clone()
    }

    /// Swaps the hash descriptor; waits for all concurrent readers.
    pub fn swap_hash_cb(&self, cb: Arc<dyn HashCb>) -> Result<(), CryptoError> {
        cb.selftest()?;
        *self.hash.write() = cb;
        Ok(())
    }

    /// Runs the selftests of both descriptors under their respective locks.
    pub fn selftest(&self) -> Result<(), CryptoError> {
        {
            let hash = self.hash.read();
            hash.selftest()?;
            log::debug!("hash selftest passed ({})", hash.name());
        }
        let core = self.core.lock();
        core.cb.selftest()?;
        log::debug!("DRNG selftest passed ({})", core.cb.name());
        Ok(())
    }

    /// Decrements the request countdown; true when it hits zero.
    pub(crate) fn requests_elapsed(&self) -> bool {
        self.requests.fetch_sub(1, Ordering::Relaxed) == 1
    }

    pub fn requests(&self) -> i32 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn requests_since_fully_seeded(&self) -> u32 {
        self.requests_since_fully_seeded.load(Ordering::Relaxed)
    }

    pub fn last_seeded(&self) -> u64 {
        self.last_seeded.load(Ordering::Relaxed)
    }

    pub(crate) fn stagger_last_seeded(&self, secs: u64) {
        self.last_seeded.fetch_add(secs, Ordering::Relaxed);
    }

    pub fn fully_seeded(&self) -> bool {
        self.fully_seeded.load(Ordering::Relaxed)
    }

    pub(crate) fn unset_fully_seeded(&self) {
        self.fully_seeded.store(false, Ordering::Relaxed);
    }

    pub fn force_reseed(&self) -> bool {
        self.force_reseed.load(Ordering::Relaxed)
    }

    pub fn set_force_reseed(&self, force: bool) {
        self.force_reseed.store(force, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Programmable DRBG descriptor for manager tests.

    use super::*;
    use core::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts every `seed` call across all states allocated from this
    /// descriptor; optionally fails seeding or stalls inside it.
    pub struct CountingCb {
        pub seeds: Arc<AtomicUsize>,
        pub fail_seed: Arc<AtomicBool>,
        pub seed_delay: Duration,
    }

    impl CountingCb {
        pub fn new() -> Self {
            Self {
                seeds: Arc::new(AtomicUsize::new(0)),
                fail_seed: Arc::new(AtomicBool::new(false)),
                seed_delay: Duration::ZERO,
            }
        }
    }

    struct CountingState {
        seeds: Arc<AtomicUsize>,
        fail_seed: Arc<AtomicBool>,
        seed_delay: Duration,
        counter: u64,
    }

    impl DrngCb for CountingCb {
        fn name(&self) -> &'static str {
            "counting test DRBG"
        }

        fn alloc(&self, _bytes: usize) -> Result<Box<dyn DrngState>, CryptoError> {
            Ok(Box::new(CountingState {
                seeds: self.seeds.clone(),
                fail_seed: self.fail_seed.clone(),
                seed_delay: self.seed_delay,
                counter: 0,
            }))
        }

        fn selftest(&self) -> Result<(), CryptoError> {
            Ok(())
        }
    }

    impl DrngState for CountingState {
        fn seed(&mut self, _data: &[u8]) -> Result<(), CryptoError> {
            if !self.seed_delay.is_zero() {
                std::thread::sleep(self.seed_delay);
            }
            if self.fail_seed.load(Ordering::Relaxed) {
                return Err(CryptoError::SeedFailed);
            }
            self.seeds.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn generate(&mut self, out: &mut [u8]) -> Result<usize, CryptoError> {
            for b in out.iter_mut() {
                self.counter = self.counter.wrapping_add(0x9e3779b97f4a7c15);
                *b = (self.counter >> 32) as u8;
            }
            Ok(out.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingCb;
    use super::*;
    use crate::crypto::{default_drng_cb, default_hash_cb};
    use crate::defs::ESDM_DRNG_SECURITY_STRENGTH_BYTES;

    fn allocated_drng() -> Drng {
        let drng = Drng::new(default_hash_cb(), Arc::new(CountingCb::new()));
        drng.alloc(ESDM_DRNG_SECURITY_STRENGTH_BYTES).unwrap();
        drng
    }

    #[test]
    fn test_inject_rearms_request_countdown() {
        let drng = allocated_drng();
        let mut out = [0u8; 8];
        for _ in 0..5 {
            drng.requests_elapsed();
            drng.generate_chunk(&mut out).unwrap();
        }
        assert!(drng.requests() < ESDM_DRNG_RESEED_THRESH as i32);

        drng.inject(&[1u8; 32], true, "test");
        assert_eq!(drng.requests(), ESDM_DRNG_RESEED_THRESH as i32);
        assert!(drng.fully_seeded());
        assert!(!drng.force_reseed());
        assert_eq!(drng.requests_since_fully_seeded(), 0);
    }

    #[test]
    fn test_partial_seed_accumulates_generate_debt() {
        let drng = allocated_drng();
        drng.inject(&[1u8; 32], true, "test");

        for _ in 0..3 {
            drng.requests_elapsed();
        }
        drng.inject(&[2u8; 32], false, "test");
        assert_eq!(drng.requests_since_fully_seeded(), 3);
        // A weak reseed does not demote the instance.
        assert!(drng.fully_seeded());
    }

    #[test]
    fn test_failed_seed_latches_force_reseed() {
        let cb = CountingCb::new();
        let fail = cb.fail_seed.clone();
        let drng = Drng::new(default_hash_cb(), Arc::new(cb));
        drng.alloc(ESDM_DRNG_SECURITY_STRENGTH_BYTES).unwrap();
        drng.inject(&[1u8; 32], true, "test");
        assert!(!drng.force_reseed());

        fail.store(true, Ordering::Relaxed);
        drng.inject(&[2u8; 32], true, "test");
        assert!(drng.force_reseed());
        // Failure must not clear the fully-seeded property.
        assert!(drng.fully_seeded());
    }

    #[test]
    fn test_generate_without_state_unavailable() {
        let drng = Drng::new(default_hash_cb(), default_drng_cb());
        let mut out = [0u8; 4];
        assert_eq!(drng.generate_chunk(&mut out), Err(EsdmError::NotAvailable));
    }

    #[test]
    fn test_time_after_now_future_base_is_zero() {
        assert_eq!(time_after_now(now_secs() + 3600), 0);
        assert!(time_after_now(0) > 0);
    }

    #[test]
    fn test_selftest_with_builtin_callbacks() {
        let drng = Drng::new(default_hash_cb(), default_drng_cb());
        assert!(drng.selftest().is_ok());
    }
}
