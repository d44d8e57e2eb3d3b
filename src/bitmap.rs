// SPDX-License-Identifier: MPL-2.0

//! Pure functions over dirty-page bitmaps: sizing, atomic drain, and
//! resampling between page sizes.
//!
//! Marking (`mark_dirty`, in [`crate::dirty`]) sets bits with an atomic OR.
//! Draining reads and clears a byte in one atomic step via [`drain_byte`],
//! so a racing mark that lands after the drain is never lost: it simply
//! shows up on the next drain.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Errno, Error, Result};

/// Computes the bitmap size in bytes needed to track `len` bytes of memory
/// at `page_size` granularity: `ceil(ceil(len / page_size) / 8)`.
pub fn bitmap_size(len: u64, page_size: u64) -> Result<usize> {
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(Error::with_message(
            Errno::InvalidArgument,
            "page size must be a nonzero power of two",
        ));
    }
    let pages = len.div_ceil(page_size);
    Ok(pages.div_ceil(8) as usize)
}

/// Atomically reads and clears one dirty-bitmap byte, storing the value it
/// held into `*dst`.
///
/// The zero pre-check is a fast path only: it never skips a bit that was
/// set before the check observed zero, because any set that races past the
/// check still gets caught by the atomic exchange.
pub fn drain_byte(dst: &mut u8, src: &AtomicU8) {
    if src.load(Ordering::Relaxed) == 0 {
        *dst = 0;
        return;
    }
    *dst = src.swap(0, Ordering::SeqCst);
}

/// Drains every byte of `src` into `out`, one-to-one, with no resampling.
///
/// `out.len()` must equal `src.len()`.
pub fn drain_same(src: &[AtomicU8], out: &mut [u8]) {
    assert_eq!(src.len(), out.len());
    for (s, d) in src.iter().zip(out.iter_mut()) {
        drain_byte(d, s);
    }
}

/// Resamples a drained source bitmap (page size `src_pg`) into a larger
/// client page size `dst_pg` (`dst_pg` is a multiple of `src_pg`) by
/// OR-folding `factor = dst_pg / src_pg` consecutive source bits into each
/// destination bit.
pub fn combine(src: &[AtomicU8], src_pg: u64, out: &mut [u8], dst_pg: u64) {
    assert!(dst_pg >= src_pg && dst_pg % src_pg == 0);
    let factor = (dst_pg / src_pg) as usize;
    out.iter_mut().for_each(|b| *b = 0);

    let dst_bits = out.len() * 8;
    let mut dst_bit = 0usize;
    let mut fold_count = 0usize;
    let mut acc = false;

    'outer: for byte in src {
        let mut drained = 0u8;
        drain_byte(&mut drained, byte);
        for bit in 0..8 {
            let set = (drained >> bit) & 1 != 0;
            acc |= set;
            fold_count += 1;
            if fold_count == factor {
                if dst_bit < dst_bits && acc {
                    out[dst_bit / 8] |= 1 << (dst_bit % 8);
                }
                dst_bit += 1;
                fold_count = 0;
                acc = false;
                if dst_bit >= dst_bits {
                    break 'outer;
                }
            }
        }
    }
}

/// Resamples a drained source bitmap (page size `src_pg`) into a smaller
/// client page size `dst_pg` (`src_pg` is a multiple of `dst_pg`) by
/// repeating each source bit `factor = src_pg / dst_pg` times, LSB-first.
pub fn extend(src: &[AtomicU8], src_pg: u64, out: &mut [u8], dst_pg: u64) {
    assert!(src_pg >= dst_pg && src_pg % dst_pg == 0);
    let factor = (src_pg / dst_pg) as usize;
    out.iter_mut().for_each(|b| *b = 0);

    let dst_bits = out.len() * 8;
    let mut dst_bit = 0usize;

    'outer: for byte in src {
        let mut drained = 0u8;
        drain_byte(&mut drained, byte);
        for bit in 0..8 {
            let set = (drained >> bit) & 1 != 0;
            for _ in 0..factor {
                if dst_bit >= dst_bits {
                    break 'outer;
                }
                if set {
                    out[dst_bit / 8] |= 1 << (dst_bit % 8);
                }
                dst_bit += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atomics(bytes: &[u8]) -> Vec<AtomicU8> {
        bytes.iter().map(|&b| AtomicU8::new(b)).collect()
    }

    #[test]
    fn size_rounds_up() {
        assert_eq!(bitmap_size(0x8000, 0x1000).unwrap(), 4);
        assert_eq!(bitmap_size(0x1000, 0x1000).unwrap(), 1);
        assert_eq!(bitmap_size(1, 0x1000).unwrap(), 1);
        assert!(bitmap_size(0x1000, 0).is_err());
        assert!(bitmap_size(0x1000, 3).is_err());
    }

    #[test]
    fn drain_clears_and_returns_value() {
        let byte = AtomicU8::new(0b0000_1011);
        let mut out = 0u8;
        drain_byte(&mut out, &byte);
        assert_eq!(out, 0b0000_1011);
        assert_eq!(byte.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drain_same_pagesize() {
        // Bits set at offsets 0, 0x1000, 0x3000 within a region logged at
        // page size 0x1000 over 0x8000 bytes: bitmap bit indices 0, 1, 3.
        let src = atomics(&[0b0000_1011]);
        let mut out = [0u8; 1];
        drain_same(&src, &mut out);
        assert_eq!(out, [0b0000_1011]);
        assert_eq!(src[0].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn extend_by_factor_two() {
        // Same bits as above, client page size is half the server's, so
        // each source bit becomes 2 destination bits.
        let src = atomics(&[0b0000_1011]);
        let mut out = [0u8; 2];
        extend(&src, 0x1000, &mut out, 0x800);
        // Source bits 0,1,3 set: each repeats twice, LSB-first, so output
        // bits 0,1 (from bit0), 2,3 (from bit1), 6,7 (from bit3) are set.
        assert_eq!(out, [0b1100_1111, 0b0000_0000]);
    }

    #[test]
    fn combine_by_factor_two() {
        let src = atomics(&[0b0000_1011]);
        let mut out = [0u8; 1];
        combine(&src, 0x1000, &mut out, 0x2000);
        // Pairs (bit0,bit1)=(1,1)->1, (bit2,bit3)=(0,1)->1, remaining pairs
        // are both-zero, so only output bits 0 and 1 are set.
        assert_eq!(out, [0b0000_0011]);
    }

    #[test]
    fn extend_preserves_all_bits_set() {
        let src = atomics(&[0xff]);
        let mut out = [0u8; 4];
        extend(&src, 0x2000, &mut out, 0x800);
        assert_eq!(out, [0xff; 4]);
    }

    #[test]
    fn combine_requires_every_bit_set_to_set_destination() {
        let src = atomics(&[0b0000_0010]);
        let mut out = [0u8; 1];
        combine(&src, 0x1000, &mut out, 0x4000);
        // Bits 0-3 -> dst bit 0 (bit 1 set, rest clear: OR is 1).
        assert_eq!(out, [0b0000_0001]);
    }
}
