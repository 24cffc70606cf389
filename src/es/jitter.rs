//! CPU execution-timing jitter entropy source.
//!
//! Harvests variance from cache misses, pipeline stalls and interrupts by
//! timing a small memory-touching loop. Each output bit is the parity of
//! eight folded timestamp deltas; the whole sample block is conditioned
//! through SHA-512 before it enters the seed buffer.

use zeroize::Zeroizing;

use super::{condition_into, EntropySource, SeedSlot};
use crate::config::Config;
use crate::defs::ESDM_ES_PAYLOAD_BYTES;

pub struct JitterEs;

#[inline(always)]
fn timestamp() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    #[cfg(target_arch = "aarch64")]
    {
        let cnt: u64;
        unsafe {
            core::arch::asm!("mrs {}, cntvct_el0", out(reg) cnt);
        }
        cnt
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        // Nanosecond clock as the portable fallback timer.
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0)
    }
}

#[inline(always)]
fn jitter_loop(scratch: &mut [u8; 64]) {
    let mut x = 0u64;
    for i in 0..16u64 {
        x = x.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(i);
        scratch[(x % 64) as usize] = scratch[(x % 64) as usize].wrapping_add(x as u8);
        core::hint::black_box(&scratch);
    }
}

fn harvest(dest: &mut [u8]) -> bool {
    let mut scratch = [0u8; 64];

    // A timer that never moves cannot produce jitter.
    let t1 = timestamp();
    jitter_loop(&mut scratch);
    if timestamp() == t1 {
        return false;
    }

    for byte in dest.iter_mut() {
        let mut acc = 0u8;
        for _ in 0..8 {
            let mut folded = 0u64;
            for _ in 0..8 {
                let start = timestamp();
                jitter_loop(&mut scratch);
                folded ^= timestamp().wrapping_sub(start);
            }
            acc = (acc << 1) | (folded.count_ones() % 2) as u8;
        }
        *byte = acc;
    }
    true
}

impl EntropySource for JitterEs {
    fn name(&self) -> &'static str {
        "JitterRNG"
    }

    fn rate_bits(&self, config: &Config) -> u32 {
        config.jent_entropy_rate()
    }

    fn poll(&self, requested_bits: u32, slot: &mut SeedSlot, config: &Config) {
        let rate = self.rate_bits(config);
        if rate == 0 || requested_bits == 0 {
            slot.bits = 0;
            return;
        }

        let mut raw = Zeroizing::new([0u8; ESDM_ES_PAYLOAD_BYTES]);
        if !harvest(raw.as_mut()) {
            slot.bits = 0;
            return;
        }

        condition_into(slot, raw.as_ref(), requested_bits.min(rate));
    }
}
