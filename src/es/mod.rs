//! Entropy sources and their aggregation.
//!
//! Every noise source implements [`EntropySource`]: it fills one slot of
//! the shared seed buffer with a conditioned payload and declares how many
//! bits of entropy it claims for that payload. The accounting across
//! sources lives in [`mgr`].
//!
//! # Design
//! - **Conservative**: an unavailable source contributes a zero-entropy
//!   payload instead of an error; seeding never fails outright.
//! - **Stateless polls**: adapters keep no state between polls (the
//!   auxiliary pool is the exception and owns its buffer explicitly).
//! - **Zeroisation**: seed buffers are wiped on drop, raw sample buffers
//!   before the poll returns.

pub mod aux_pool;
pub mod cpu;
pub mod jitter;
pub mod krng;
pub mod mgr;
pub mod sched;

use core::fmt;

use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::Config;
use crate::defs::{ESDM_DRNG_SECURITY_STRENGTH_BITS, ESDM_ES_PAYLOAD_BYTES};

/// Number of entropy sources feeding the seed buffer.
pub const ESDM_ES_COUNT: usize = 5;

/// Slot index of each source inside the seed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsId {
    Cpu = 0,
    Jitter = 1,
    Krng = 2,
    Sched = 3,
    Aux = 4,
}

impl EsId {
    pub const ALL: [EsId; ESDM_ES_COUNT] =
        [EsId::Cpu, EsId::Jitter, EsId::Krng, EsId::Sched, EsId::Aux];
}

/// Errors of the push-mode entropy interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsError {
    /// The source has no push-mode interface.
    NotSupported,
    /// Rejected input parameters.
    InvalidArgument,
}

impl fmt::Display for EsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EsError::NotSupported => write!(f, "entropy source does not accept input"),
            EsError::InvalidArgument => write!(f, "invalid entropy input"),
        }
    }
}

impl std::error::Error for EsError {}

/// One per-source slot of the seed buffer: a conditioned payload plus the
/// entropy the accountant assigned to it.
#[derive(Clone, Zeroize)]
pub struct SeedSlot {
    pub data: [u8; ESDM_ES_PAYLOAD_BYTES],
    pub bits: u32,
}

impl SeedSlot {
    pub(crate) fn empty() -> Self {
        Self {
            data: [0u8; ESDM_ES_PAYLOAD_BYTES],
            bits: 0,
        }
    }
}

/// Aggregated output of one polling round across all entropy sources.
/// Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SeedBuf {
    pub slots: [SeedSlot; ESDM_ES_COUNT],
}

impl SeedBuf {
    pub fn new() -> Self {
        Self {
            slots: [
                SeedSlot::empty(),
                SeedSlot::empty(),
                SeedSlot::empty(),
                SeedSlot::empty(),
                SeedSlot::empty(),
            ],
        }
    }

    pub fn slot_mut(&mut self, id: EsId) -> &mut SeedSlot {
        &mut self.slots[id as usize]
    }

    /// Concatenated payloads, handed to `DrngState::seed`. The copy is
    /// wiped on drop like the buffer itself.
    pub fn seed_material(&self) -> zeroize::Zeroizing<Vec<u8>> {
        let mut material =
            zeroize::Zeroizing::new(Vec::with_capacity(ESDM_ES_COUNT * ESDM_ES_PAYLOAD_BYTES));
        for slot in &self.slots {
            material.extend_from_slice(&slot.data);
        }
        material
    }

    /// True once every byte of every slot is zero. Exists for the
    /// zeroisation checks in tests.
    pub fn is_wiped(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.bits == 0 && s.data.iter().all(|&b| b == 0))
    }
}

impl Default for SeedBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// A noise source adapter.
pub trait EntropySource: Send + Sync {
    fn name(&self) -> &'static str;

    /// The operator-configured entropy estimate for one poll, in bits per
    /// 256-bit security strength.
    fn rate_bits(&self, config: &Config) -> u32;

    /// Fills `slot` with a conditioned payload and sets `slot.bits` to the
    /// claimed entropy, at most `min(requested_bits, rate)`. Never fails;
    /// an unavailable source claims zero bits.
    fn poll(&self, requested_bits: u32, slot: &mut SeedSlot, config: &Config);

    /// Whether a contribution of `bits` is the most this source can give.
    fn fully_seeded(&self, bits: u32, config: &Config) -> bool {
        bits >= self.rate_bits(config).min(ESDM_DRNG_SECURITY_STRENGTH_BITS)
    }

    /// Push-mode entropy insertion; only the auxiliary pool supports it.
    fn add_entropy(&self, _data: &[u8], _bits: u32, _config: &Config) -> Result<(), EsError> {
        Err(EsError::NotSupported)
    }
}

/// Conditions raw samples into a slot: SHA-512 over the raw material, with
/// the claimed entropy capped at the digest width and the request.
pub(crate) fn condition_into(slot: &mut SeedSlot, raw: &[u8], claimed_bits: u32) {
    let digest = Sha512::digest(raw);
    slot.data.copy_from_slice(&digest);
    slot.bits = claimed_bits.min(ESDM_DRNG_SECURITY_STRENGTH_BITS);
}
