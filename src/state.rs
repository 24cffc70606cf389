//! Global seeding state machine.
//!
//! The state advances monotonically from `Uninitialised` through
//! `MinSeeded` and `FullySeeded` to `Operational`; only an explicit reset
//! goes backwards. Every advance is broadcast on the wait queue, and
//! waiters re-check their predicate after wakeup (wakeups may be spurious).

use core::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::defs::{ESDM_DRNG_SECURITY_STRENGTH_BITS, ESDM_MIN_SEED_ENTROPY_BITS};
use crate::error::EsdmError;

/// Seeding progress of the ESDM as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EsdmState {
    /// No accredited entropy injected yet.
    Uninitialised,
    /// At least `ESDM_MIN_SEED_ENTROPY_BITS` credited in one seeding round.
    MinSeeded,
    /// At least the security strength credited in one seeding round.
    FullySeeded,
    /// Fully seeded, selftests passed, manager available.
    Operational,
}

type TransitionHook = Box<dyn Fn(EsdmState) + Send + Sync>;

pub struct StateMachine {
    state: Mutex<EsdmState>,
    cond: Condvar,
    all_nodes_seeded: AtomicBool,
    selftest_passed: AtomicBool,
    /// Invoked once per transition, outside the state lock. Publishes the
    /// status record and posts the change semaphore.
    transition_hook: Mutex<Option<TransitionHook>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EsdmState::Uninitialised),
            cond: Condvar::new(),
            all_nodes_seeded: AtomicBool::new(false),
            selftest_passed: AtomicBool::new(false),
            transition_hook: Mutex::new(None),
        }
    }

    pub fn set_transition_hook(&self, hook: TransitionHook) {
        *self.transition_hook.lock() = Some(hook);
    }

    fn run_transition_hook(&self, new_state: EsdmState) {
        if let Some(hook) = self.transition_hook.lock().as_ref() {
            hook(new_state);
        }
    }

    pub fn state(&self) -> EsdmState {
        *self.state.lock()
    }

    pub fn is_min_seeded(&self) -> bool {
        self.state() >= EsdmState::MinSeeded
    }

    pub fn is_fully_seeded(&self) -> bool {
        self.state() >= EsdmState::FullySeeded
    }

    pub fn is_operational(&self) -> bool {
        self.state() == EsdmState::Operational
    }

    pub fn set_selftest_passed(&self, passed: bool) {
        self.selftest_passed.store(passed, Ordering::Relaxed);
    }

    pub fn selftest_passed(&self) -> bool {
        self.selftest_passed.load(Ordering::Relaxed)
    }

    pub fn set_all_nodes_seeded(&self, seeded: bool) {
        self.all_nodes_seeded.store(seeded, Ordering::Relaxed);
        if seeded {
            self.cond.notify_all();
        }
    }

    pub fn all_nodes_seeded(&self) -> bool {
        self.all_nodes_seeded.load(Ordering::Relaxed)
    }

    /// Monotonic advance to `target`; returns true when the state actually
    /// moved. Broadcasts on every move.
    fn advance_to(&self, target: EsdmState) -> bool {
        {
            let mut state = self.state.lock();
            if *state >= target {
                return false;
            }
            log::debug!("ESDM state advances {:?} -> {:?}", *state, target);
            *state = target;
            self.cond.notify_all();
        }
        self.run_transition_hook(target);
        true
    }

    /// Applies the outcome of one seeding round. `avail` is the DRNG
    /// manager's availability flag; `Operational` additionally requires the
    /// selftests to have passed. Returns true when the state advanced.
    pub fn init_ops(&self, credited_bits: u32, avail: bool) -> bool {
        let target = if credited_bits >= ESDM_DRNG_SECURITY_STRENGTH_BITS {
            if avail && self.selftest_passed() {
                EsdmState::Operational
            } else {
                EsdmState::FullySeeded
            }
        } else if credited_bits >= ESDM_MIN_SEED_ENTROPY_BITS {
            EsdmState::MinSeeded
        } else {
            return false;
        };
        self.advance_to(target)
    }

    /// Explicit demotion back to `Uninitialised` (pool reset).
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            *state = EsdmState::Uninitialised;
            self.all_nodes_seeded.store(false, Ordering::Relaxed);
            self.cond.notify_all();
        }
        self.run_transition_hook(EsdmState::Uninitialised);
    }

    /// Blocks the caller until the ESDM is at least minimally seeded.
    pub fn sleep_while_non_min_seeded(&self) {
        let mut state = self.state.lock();
        while *state < EsdmState::MinSeeded {
            self.cond.wait(&mut state);
        }
    }

    /// Blocks the caller until the ESDM is operational; with `nonblock` it
    /// returns `WouldBlock` instead of waiting.
    pub fn sleep_while_nonoperational(&self, nonblock: bool) -> Result<(), EsdmError> {
        let mut state = self.state.lock();
        if *state == EsdmState::Operational {
            return Ok(());
        }
        if nonblock {
            return Err(EsdmError::WouldBlock);
        }
        while *state != EsdmState::Operational {
            self.cond.wait(&mut state);
        }
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.state(), EsdmState::Uninitialised);
        assert!(!sm.is_min_seeded());
    }

    #[test]
    fn test_cold_start_progression() {
        let sm = StateMachine::new();
        sm.set_selftest_passed(true);

        // Below the minimum nothing moves.
        assert!(!sm.init_ops(64, true));
        assert_eq!(sm.state(), EsdmState::Uninitialised);

        assert!(sm.init_ops(ESDM_MIN_SEED_ENTROPY_BITS, true));
        assert_eq!(sm.state(), EsdmState::MinSeeded);

        assert!(sm.init_ops(ESDM_DRNG_SECURITY_STRENGTH_BITS, true));
        assert_eq!(sm.state(), EsdmState::Operational);
    }

    #[test]
    fn test_no_operational_without_selftest() {
        let sm = StateMachine::new();
        assert!(sm.init_ops(ESDM_DRNG_SECURITY_STRENGTH_BITS, true));
        assert_eq!(sm.state(), EsdmState::FullySeeded);
    }

    #[test]
    fn test_monotonic_no_downgrade() {
        let sm = StateMachine::new();
        sm.set_selftest_passed(true);
        sm.init_ops(ESDM_DRNG_SECURITY_STRENGTH_BITS, true);
        // A later weak seeding round must not demote the state.
        assert!(!sm.init_ops(ESDM_MIN_SEED_ENTROPY_BITS, true));
        assert_eq!(sm.state(), EsdmState::Operational);
    }

    #[test]
    fn test_reset_demotes() {
        let sm = StateMachine::new();
        sm.set_selftest_passed(true);
        sm.init_ops(ESDM_DRNG_SECURITY_STRENGTH_BITS, true);
        sm.set_all_nodes_seeded(true);
        sm.reset();
        assert_eq!(sm.state(), EsdmState::Uninitialised);
        assert!(!sm.all_nodes_seeded());
    }

    #[test]
    fn test_nonblocking_wait_returns_wouldblock() {
        let sm = StateMachine::new();
        assert_eq!(
            sm.sleep_while_nonoperational(true),
            Err(EsdmError::WouldBlock)
        );
    }

    #[test]
    fn test_transition_hook_fires_once_per_advance() {
        use core::sync::atomic::AtomicUsize;

        let sm = StateMachine::new();
        sm.set_selftest_passed(true);
        let hits = Arc::new(AtomicUsize::new(0));
        let hook_hits = hits.clone();
        sm.set_transition_hook(Box::new(move |_| {
            hook_hits.fetch_add(1, Ordering::Relaxed);
        }));

        sm.init_ops(ESDM_MIN_SEED_ENTROPY_BITS, true);
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        // No transition, no post.
        sm.init_ops(ESDM_MIN_SEED_ENTROPY_BITS, true);
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        sm.init_ops(ESDM_DRNG_SECURITY_STRENGTH_BITS, true);
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        sm.reset();
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_blocking_wait_releases_on_advance() {
        let sm = Arc::new(StateMachine::new());
        let waiter = {
            let sm = sm.clone();
            std::thread::spawn(move || {
                sm.sleep_while_non_min_seeded();
                sm.state()
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        sm.init_ops(ESDM_MIN_SEED_ENTROPY_BITS, false);

        let seen = waiter.join().unwrap();
        assert!(seen >= EsdmState::MinSeeded);
    }
}
