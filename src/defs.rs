//! Compile-time sizing and policy constants.
//!
//! All entropy figures are expressed in bits relative to the 256-bit DRNG
//! security strength. Runtime-tunable values live in [`crate::config`]; the
//! constants here are the hard limits the tunables are clamped against.

/// Security strength of the DRNG in bits. Every entropy target in the
/// accounting logic is derived from this value.
pub const ESDM_DRNG_SECURITY_STRENGTH_BITS: u32 = 256;

/// Security strength of the DRNG in bytes.
pub const ESDM_DRNG_SECURITY_STRENGTH_BYTES: usize =
    (ESDM_DRNG_SECURITY_STRENGTH_BITS / 8) as usize;

/// Number of generate requests after which a DRNG reseed is due.
pub const ESDM_DRNG_RESEED_THRESH: u32 = 1 << 20;

/// Maximum number of generate operations a DRNG may serve without a full
/// reseed before it is demoted to not-fully-seeded.
pub const ESDM_DRNG_MAX_WITHOUT_RESEED: u32 = 1 << 30;

/// Maximum number of bytes obtained from the DRNG in one generate call.
pub const ESDM_DRNG_MAX_REQSIZE: usize = 1 << 12;

/// Maximum number of seconds between two reseeds of one DRNG. Enforced
/// lazily with the next generate request.
pub const ESDM_DRNG_RESEED_MAX_TIME: u64 = 600;

/// Entropy in bits the pool asks for before the very first seeding round.
pub const ESDM_INIT_ENTROPY_BITS: u32 = 32;

/// Credited entropy in bits required to consider the ESDM minimally seeded.
pub const ESDM_MIN_SEED_ENTROPY_BITS: u32 = 128;

/// Whether entropy-source oversampling is compiled in. Required for
/// SP 800-90C compliance claims; only effective in FIPS mode.
pub const ESDM_OVERSAMPLE_ENTROPY_SOURCES: bool = true;

/// Per-source oversampling margin in bits applied in FIPS mode: each
/// source's credit is reduced by this amount before threshold comparisons.
pub const ESDM_OVERSAMPLE_ES_BITS: u32 = 64;

/// Additional entropy in bits requested while a DRNG is not yet fully
/// seeded, to compensate for imperfect per-source estimates early on.
pub const ESDM_SEED_INIT_ADD_BITS: u32 = 128;

/// Conditioned payload size of one entropy-source slot in the seed buffer.
/// Matches the output size of the SHA-512 conditioner.
pub const ESDM_ES_PAYLOAD_BYTES: usize = 64;

/// Default per-source entropy rates in bits per 256-bit strength. These are
/// deliberately conservative; operators raise them via the configuration.
pub const ESDM_CPU_ENTROPY_RATE: u32 = 8;
pub const ESDM_JENT_ENTROPY_RATE: u32 = 16;
pub const ESDM_KERNEL_RNG_ENTROPY_RATE: u32 = 256;
pub const ESDM_SCHED_ENTROPY_RATE: u32 = 0;

/// Upper bound on the entropy the auxiliary pool can hold, in bits. The
/// pool is a SHA-512 digest, so it can never carry more than its width.
pub const ESDM_AUX_POOL_CAP_BITS: u32 = 512;

/// Maximum RPC message payload. Requests asking for more are rejected;
/// clients are expected to chunk.
pub const ESDM_RPC_MAX_MSG_SIZE: usize = 65500;

/// Version of the status record published over shared memory.
pub const ESDM_SHM_STATUS_VERSION: u32 = 1;

/// Project identifier of the status segment, kept stable so that foreign
/// tooling can recognise the segment across releases.
pub const ESDM_SHM_STATUS: u32 = 1_122_334_455;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reseed_threshold_below_max_wo_reseed() {
        // The demotion limit must leave room for several reseed windows.
        assert!(ESDM_DRNG_MAX_WITHOUT_RESEED > ESDM_DRNG_RESEED_THRESH);
    }

    #[test]
    fn test_min_seed_below_full_seed() {
        assert!(ESDM_MIN_SEED_ENTROPY_BITS < ESDM_DRNG_SECURITY_STRENGTH_BITS);
        assert!(ESDM_INIT_ENTROPY_BITS < ESDM_MIN_SEED_ENTROPY_BITS);
    }
}
