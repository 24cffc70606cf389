//! Pluggable cryptographic primitives.
//!
//! The ESDM core never implements a hash or a DRBG itself; it drives the
//! descriptors defined here. Implementations are swappable at runtime (the
//! hash descriptor of a DRNG instance sits behind a reader/writer lock).
//!
//! # Contracts
//! - `DrngState::seed` leaves the state no worse than before on failure;
//!   the caller latches `force_reseed` and retries later.
//! - `DrngState::generate` fills the whole output slice; a short fill is an
//!   error for the caller.

pub mod hmac_drbg;
pub mod sha512;

use core::fmt;
use std::sync::Arc;

/// Errors produced by the crypto callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Known-answer or consistency selftest failed.
    SelftestFailed,
    /// Seeding the DRBG state failed.
    SeedFailed,
    /// Random bit generation failed or came up short.
    GenerateFailed,
    /// Output request exceeds the primitive's per-request limit.
    RequestTooLarge,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::SelftestFailed => write!(f, "crypto selftest failed"),
            CryptoError::SeedFailed => write!(f, "DRBG seeding failed"),
            CryptoError::GenerateFailed => write!(f, "DRBG generation failed"),
            CryptoError::RequestTooLarge => write!(f, "generate request too large"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Message digest descriptor.
pub trait HashCb: Send + Sync {
    fn name(&self) -> &'static str;

    /// Digest size in bytes.
    fn digest_size(&self) -> usize;

    /// One-shot digest of `msg` into `out`; returns the number of bytes
    /// written. `out` must hold at least `digest_size()` bytes.
    fn digest(&self, msg: &[u8], out: &mut [u8]) -> Result<usize, CryptoError>;

    /// Known-answer selftest.
    fn selftest(&self) -> Result<(), CryptoError>;
}

/// Deterministic random bit generator descriptor.
pub trait DrngCb: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocates a fresh, unseeded DRBG state.
    fn alloc(&self, security_strength_bytes: usize) -> Result<Box<dyn DrngState>, CryptoError>;

    /// Known-answer/consistency selftest.
    fn selftest(&self) -> Result<(), CryptoError>;
}

/// One allocated DRBG state. Dropping the box deallocates and zeroises.
pub trait DrngState: Send {
    /// (Re)seeds the generator with `data`.
    fn seed(&mut self, data: &[u8]) -> Result<(), CryptoError>;

    /// Fills `out` completely with generated bytes and returns the count.
    fn generate(&mut self, out: &mut [u8]) -> Result<usize, CryptoError>;
}

/// The hash descriptor available from process start.
pub fn default_hash_cb() -> Arc<dyn HashCb> {
    Arc::new(sha512::Sha512Hash)
}

/// The DRBG descriptor used for all DRNG instances unless swapped.
pub fn default_drng_cb() -> Arc<dyn DrngCb> {
    Arc::new(hmac_drbg::HmacDrbgCb)
}
