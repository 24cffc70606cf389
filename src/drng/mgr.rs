//! DRNG manager and seeding scheduler.
//!
//! Owns the always-present initial DRNG, the lazily allocated per-node
//! instances and the atomic fallback DRNG. The seeding scheduler decides
//! when a reseed is due, composes the seed buffer from the entropy sources
//! and enforces the at-most-one-reseed-in-flight interlock through a
//! non-blocking pool lock.
//!
//! # Concurrency
//! - The pool lock serialises seeding, never generation: a generator that
//!   sees a due reseed but loses the trylock latches `force_reseed` and
//!   keeps generating.
//! - Per-instance locks serialise seed and generate on one DRNG; across
//!   instances no ordering is promised.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{time_after_now, Drng};
use crate::config::Config;
use crate::crypto::{default_drng_cb, default_hash_cb};
use crate::defs::*;
use crate::error::EsdmError;
use crate::es::mgr::EsMgr;
use crate::es::SeedBuf;
use crate::state::StateMachine;

/// Seconds of reseed-deadline stagger applied per node index after a
/// successful per-node seed.
const NODE_STAGGER_SECS: u64 = 60;

pub struct DrngMgr {
    init: Arc<Drng>,
    /// Per-node instances, present once more than one node is online.
    nodes: RwLock<Option<Vec<Option<Arc<Drng>>>>>,
    /// Fallback instance seeded alongside every regular seed operation.
    atomic: Arc<Drng>,
    avail: AtomicBool,
    /// Admits at most one seeding operation at a time. try-lock only.
    pool_lock: Mutex<()>,
    reseed_max_time: AtomicU64,
    init_lock: Mutex<()>,
}

impl DrngMgr {
    pub fn new() -> Self {
        Self::with_callbacks(default_drng_cb())
    }

    /// Manager with a non-default DRBG descriptor; the builtin hash is
    /// always the starting hash callback.
    pub fn with_callbacks(drng_cb: Arc<dyn crate::crypto::DrngCb>) -> Self {
        Self {
            init: Arc::new(Drng::new(default_hash_cb(), drng_cb.clone())),
            nodes: RwLock::new(None),
            atomic: Arc::new(Drng::new(default_hash_cb(), drng_cb)),
            avail: AtomicBool::new(false),
            pool_lock: Mutex::new(()),
            reseed_max_time: AtomicU64::new(ESDM_DRNG_RESEED_MAX_TIME),
            init_lock: Mutex::new(()),
        }
    }

    pub fn available(&self) -> bool {
        self.avail.load(Ordering::Relaxed)
    }

    pub fn init_instance(&self) -> Arc<Drng> {
        self.init.clone()
    }

    pub fn atomic_instance(&self) -> Arc<Drng> {
        self.atomic.clone()
    }

    pub fn min_reseed_secs(&self) -> u64 {
        self.reseed_max_time.load(Ordering::Relaxed)
    }

    /// Allocates the initial and atomic DRNGs, runs the selftests and
    /// flips availability. Idempotent; selftest failure is fatal and
    /// leaves the manager unavailable.
    pub fn initialize(&self, state: &StateMachine) -> Result<(), EsdmError> {
        if self.available() {
            return Ok(());
        }

        let _guard = self.init_lock.lock();
        if self.available() {
            return Ok(());
        }
        log::info!("initialize DRNG manager");

        self.init
            .alloc(ESDM_DRNG_SECURITY_STRENGTH_BYTES)
            .map_err(|_| EsdmError::Fatal)?;
        self.atomic
            .alloc(ESDM_DRNG_SECURITY_STRENGTH_BYTES)
            .map_err(|_| EsdmError::Fatal)?;

        if let Err(e) = self.init.selftest() {
            log::error!("crypto selftest failed: {}", e);
            state.set_selftest_passed(false);
            return Err(EsdmError::Fatal);
        }
        state.set_selftest_passed(true);

        self.avail.store(true, Ordering::Relaxed);
        log::debug!("ESDM for general use is available");
        Ok(())
    }

    /// Creates the per-node slot array when the machine has more than one
    /// node. Instances themselves are allocated on first use.
    pub fn ensure_node_array(&self, config: &Config) {
        let online = config.online_nodes();
        if online <= 1 {
            return;
        }
        let mut nodes = self.nodes.write();
        if nodes.is_none() {
            *nodes = Some(vec![None; online as usize]);
            log::debug!("per-node DRNG array sized for {} nodes", online);
        }
    }

    /// The DRNG serving the calling thread: the node instance when it
    /// exists and is fully seeded, the initial instance otherwise.
    fn select_instance(&self, config: &Config) -> Arc<Drng> {
        let nodes = self.nodes.read();
        if let Some(vec) = nodes.as_ref() {
            let node = config.curr_node() as usize % vec.len();
            if let Some(drng) = vec[node].as_ref() {
                if drng.fully_seeded() {
                    log::debug!("generate request served by DRNG on node {}", node);
                    return drng.clone();
                }
            }
        }
        self.init.clone()
    }

    /// True when a reseed of `drng` is due: the request countdown elapsed,
    /// a reseed was forced, or the instance exceeded its time-based
    /// reseed deadline.
    fn must_reseed(&self, drng: &Drng) -> bool {
        drng.requests_elapsed()
            || drng.force_reseed()
            || time_after_now(drng.last_seeded() + self.min_reseed_secs()) > 0
    }

    /// One complete seeding operation: fill the seed buffer, inject into
    /// `drng` and the atomic DRNG, advance the global state. Returns the
    /// credited entropy. Caller must hold the pool lock.
    fn seed_one(
        &self,
        drng: &Drng,
        drng_type: &str,
        es: &EsMgr,
        state: &StateMachine,
        config: &Config,
    ) -> u32 {
        let mut buf = SeedBuf::new();
        let target = es.seed_entropy_target(drng.fully_seeded(), config);
        es.fill_seed_buffer(&mut buf, target, config);

        let credited = es.credited_bits(&buf, config);
        let full = es.is_full_seed(credited);

        {
            let material = buf.seed_material();
            drng.inject(&material, full, drng_type);
            self.atomic.inject(&material, full, "atomic");
        }

        state.init_ops(credited, self.available());
        credited
    }

    /// Picks the first not-fully-seeded instance, allocating per-node
    /// DRNGs on first use. No lock is held by the caller afterwards.
    fn next_unseeded(&self) -> Option<(usize, Arc<Drng>)> {
        let mut nodes = self.nodes.write();
        let vec = nodes.as_mut()?;
        for node in 0..vec.len() {
            if vec[node].is_none() {
                let drng = Arc::new(Drng::new(default_hash_cb(), default_drng_cb()));
                if drng.alloc(ESDM_DRNG_SECURITY_STRENGTH_BYTES).is_err() {
                    continue;
                }
                log::debug!("allocated DRNG for node {}", node);
                vec[node] = Some(drng);
            }
            let drng = vec[node].as_ref().map(Arc::clone);
            if let Some(drng) = drng {
                if !drng.fully_seeded() {
                    return Some((node, drng));
                }
            }
        }
        None
    }

    /// One round of the seeding scheduler: seed the first not-fully-seeded
    /// instance. Returns the credited bits, or None when every instance is
    /// already fully seeded.
    fn seed_work_round(&self, es: &EsMgr, state: &StateMachine, config: &Config) -> Option<u32> {
        let has_nodes = self.nodes.read().is_some();

        if has_nodes {
            if let Some((node, drng)) = self.next_unseeded() {
                log::debug!("reseed triggered for DRNG on node {}", node);
                let credited = self.seed_one(&drng, "regular", es, state, config);
                if drng.fully_seeded() {
                    // Stagger the next time-based reseed deadline so the
                    // nodes do not all come due in the same second.
                    drng.stagger_last_seeded(node as u64 * NODE_STAGGER_SECS);
                }
                return Some(credited);
            }
        } else if !self.init.fully_seeded() {
            return Some(self.seed_one(&self.init, "regular", es, state, config));
        }

        state.set_all_nodes_seeded(true);
        None
    }

    /// Runs the seeding scheduler if no other seeding is in flight.
    /// Returns false when the pool lock was contended.
    pub fn try_seed_work(&self, es: &EsMgr, state: &StateMachine, config: &Config) -> bool {
        let Some(_guard) = self.pool_lock.try_lock() else {
            return false;
        };

        loop {
            match self.seed_work_round(es, state, config) {
                None => break,
                // A round that credits nothing cannot make progress; leave
                // the retry to the next wake-up.
                Some(0) => break,
                Some(_) => {
                    if !es.reseed_wanted(state.all_nodes_seeded(), config) {
                        break;
                    }
                }
            }
        }
        true
    }

    /// Forces a reseed before the next generate call. When the initial
    /// DRNG itself is over the reseed threshold it alone is forced, as it
    /// is the fallback for everything else; otherwise all per-node DRNGs
    /// and the atomic DRNG are forced.
    pub fn force_reseed(&self) {
        let nodes = self.nodes.read();
        let over_thresh = self.init.requests_since_fully_seeded() > ESDM_DRNG_RESEED_THRESH;

        let vec = match nodes.as_ref() {
            Some(vec) if !over_thresh => vec,
            _ => {
                self.init.set_force_reseed(self.init.fully_seeded());
                log::debug!("force reseed of initial DRNG");
                return;
            }
        };

        for (node, slot) in vec.iter().enumerate() {
            if let Some(drng) = slot {
                drng.set_force_reseed(drng.fully_seeded());
                log::debug!("force reseed of DRNG on node {}", node);
            }
        }
        self.atomic.set_force_reseed(self.atomic.fully_seeded());
    }

    /// Random data from `drng`, reseeding opportunistically.
    fn drng_get(
        &self,
        drng: &Drng,
        out: &mut [u8],
        es: &EsMgr,
        state: &StateMachine,
        config: &Config,
    ) -> Result<usize, EsdmError> {
        if out.is_empty() {
            return Ok(0);
        }
        if !self.available() {
            return Err(EsdmError::NotAvailable);
        }

        let len = out.len().min(isize::MAX as usize);

        if drng.requests_since_fully_seeded() > config.drng_max_wo_reseed() {
            log::warn!("DRNG exceeded maximum generate operations without reseed");
            drng.unset_fully_seeded();
            state.set_all_nodes_seeded(false);
        }

        let mut processed = 0;
        while processed < len {
            let todo = (len - processed).min(ESDM_DRNG_MAX_REQSIZE);

            if self.must_reseed(drng) {
                match self.pool_lock.try_lock() {
                    Some(_guard) => {
                        self.seed_one(drng, "regular", es, state, config);
                    }
                    None => drng.set_force_reseed(true),
                }
            }

            drng.generate_chunk(&mut out[processed..processed + todo])?;
            processed += todo;
        }

        Ok(processed)
    }

    /// Output interface used by all `get_random_bytes` variants.
    pub fn get(
        &self,
        out: &mut [u8],
        es: &EsMgr,
        state: &StateMachine,
        config: &Config,
    ) -> Result<usize, EsdmError> {
        self.initialize(state)?;
        let drng = self.select_instance(config);
        self.drng_get(&drng, out, es, state, config)
    }

    /// Resets every instance and the global state: all existing entropy is
    /// considered gone.
    pub fn reset(&self, es: &EsMgr, state: &StateMachine) {
        {
            let nodes = self.nodes.read();
            if let Some(vec) = nodes.as_ref() {
                for drng in vec.iter().flatten() {
                    drng.reset();
                }
            } else {
                self.init.reset();
            }
        }
        self.atomic.reset();
        es.set_entropy_thresh(ESDM_INIT_ENTROPY_BITS);
        state.reset();
    }

    /// Deallocates every DRBG state. The manager is unavailable afterwards.
    pub fn finalize(&self) {
        let nodes = self.nodes.read();
        if let Some(vec) = nodes.as_ref() {
            for drng in vec.iter().flatten() {
                drng.dealloc();
            }
        }
        self.init.dealloc();
        self.atomic.dealloc();
        self.avail.store(false, Ordering::Relaxed);
    }

    /// Human-readable per-instance summary for the status record.
    pub fn status_summary(&self) -> String {
        let nodes = self.nodes.read();
        let (count, seeded) = match nodes.as_ref() {
            Some(vec) => {
                let present: Vec<_> = vec.iter().flatten().collect();
                (
                    present.len().max(1),
                    present.iter().filter(|d| d.fully_seeded()).count(),
                )
            }
            None => (1, usize::from(self.init.fully_seeded())),
        };
        format!(
            "DRNG instances: {}; fully seeded: {}; last seed: {}s ago",
            count,
            seeded,
            time_after_now(self.init.last_seeded())
        )
    }
}

impl Default for DrngMgr {
    fn default() -> Self {
        Self::new()
    }
}
