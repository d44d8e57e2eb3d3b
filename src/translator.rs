// SPDX-License-Identifier: MPL-2.0

//! Scatter/gather translation: splitting an `(iova, len, pasid)` request
//! across the regions that back it.

use crate::error::{Errno, Error, Result};
use crate::region::{Pasid, Prot, Region};

/// One contiguous piece of a translated request, entirely inside a single
/// region.
///
/// `host_addr` is only meaningful while the originating region remains
/// registered; callers must not retain an `SgEntry` across a
/// `remove_region`/`remove_all_regions` call.
#[derive(Debug, Clone, Copy)]
pub struct SgEntry {
    pub region_index: usize,
    pub dma_addr: u64,
    pub len: u64,
    pub pasid: Pasid,
    pub prot: Prot,
    pub host_addr: Option<*mut std::ffi::c_void>,
}

// `host_addr` is a plain address handed to the caller's own DMA logic,
// which already has to reason about cross-thread access to guest memory.
unsafe impl Send for SgEntry {}

impl SgEntry {
    /// Builds an `SgEntry`, checking that the region's granted protection
    /// is a superset of what the caller requested.
    fn init(
        region_index: usize,
        region: &Region,
        dma_addr: u64,
        len: u64,
        requested_prot: Prot,
    ) -> Result<Self> {
        if !region.prot.contains(requested_prot) {
            return Err(Error::with_message(
                Errno::InvalidArgument,
                "requested protection exceeds region's granted protection",
            ));
        }
        Ok(Self {
            region_index,
            dma_addr,
            len,
            pasid: region.pasid,
            prot: requested_prot,
            host_addr: region.host_addr_for(dma_addr),
        })
    }
}

/// The outcome of a raw, FFI-shaped translate call.
pub enum TranslateOutcome {
    /// `sg[..n]` was filled in.
    Ok(usize),
    /// The caller's buffer is too small; `required` is how many entries
    /// would have been produced.
    TooSmall { required: usize },
}

/// Splits `[addr, addr + len)` for `pasid` across `regions`, writing up to
/// `out.len()` entries into `out` and returning how many entries the
/// request actually needed.
///
/// Mirrors `dma_controller_sg_split`'s contract: regions are scanned
/// left-to-right across the request; a gap not covered by any region of
/// this PASID fails with `NotFound` even if a later byte would have been
/// covered.
pub fn translate_raw(
    regions: &[Region],
    addr: u64,
    pasid: Pasid,
    len: u64,
    prot: Prot,
    out: &mut [SgEntry],
) -> Result<TranslateOutcome> {
    if len == 0 {
        return Ok(TranslateOutcome::Ok(0));
    }

    let mut cursor = addr;
    let mut remaining = len;
    let mut count = 0usize;

    while remaining > 0 {
        let found = regions
            .iter()
            .enumerate()
            .find(|(_, r)| r.pasid == pasid && r.iova.contains(cursor));

        let Some((index, region)) = found else {
            return Err(Error::with_message(
                Errno::NotFound,
                "address not covered by any region",
            ));
        };

        let seg_len = (region.iova.end() - cursor).min(remaining);

        if count < out.len() {
            out[count] = SgEntry::init(index, region, cursor, seg_len, prot)?;
        }
        count += 1;

        cursor += seg_len;
        remaining -= seg_len;
    }

    if count > out.len() {
        Ok(TranslateOutcome::TooSmall { required: count })
    } else {
        Ok(TranslateOutcome::Ok(count))
    }
}

/// Encodes a [`TranslateOutcome`] the way the raw C-shaped entry point
/// does: a non-negative count on success, or `-required - 1` when the
/// caller's buffer was too small.
pub fn encode_count(outcome: TranslateOutcome) -> i64 {
    match outcome {
        TranslateOutcome::Ok(n) => n as i64,
        TranslateOutcome::TooSmall { required } => -(required as i64) - 1,
    }
}

/// Safe convenience wrapper: translates and returns an owned `Vec`,
/// growing to fit rather than reporting "too small".
pub fn translate_vec(
    regions: &[Region],
    addr: u64,
    pasid: Pasid,
    len: u64,
    prot: Prot,
) -> Result<Vec<SgEntry>> {
    // A first pass with no capacity discovers the required count; in
    // practice requests rarely split across more than a handful of
    // regions, so one retry at the discovered size is cheap.
    let mut buf = Vec::new();
    loop {
        match translate_raw(regions, addr, pasid, len, prot, &mut buf)? {
            TranslateOutcome::Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            TranslateOutcome::TooSmall { required } => {
                buf.resize(
                    required,
                    SgEntry {
                        region_index: 0,
                        dma_addr: 0,
                        len: 0,
                        pasid: crate::region::INVALID_PASID,
                        prot: Prot::empty(),
                        host_addr: None,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::IovaWindow;

    fn region(base: u64, len: u64, pasid: Pasid) -> Region {
        Region::placeholder(IovaWindow::new(base, len), pasid, Prot::READ | Prot::WRITE)
    }

    #[test]
    fn single_region_whole_match() {
        let regions = vec![region(0x1000, 0x1000, 0)];
        let mut out = [SgEntry {
            region_index: 0,
            dma_addr: 0,
            len: 0,
            pasid: 0,
            prot: Prot::empty(),
            host_addr: None,
        }; 1];
        let outcome = translate_raw(&regions, 0x1000, 0, 0x1000, Prot::READ, &mut out).unwrap();
        match outcome {
            TranslateOutcome::Ok(n) => assert_eq!(n, 1),
            _ => panic!("expected Ok"),
        }
        assert_eq!(out[0].region_index, 0);
        assert_eq!(out[0].len, 0x1000);
    }

    #[test]
    fn gap_between_regions_is_not_found() {
        let regions = vec![region(0x1000, 0x1000, 0), region(0x3000, 0x1000, 0)];
        let mut out = [SgEntry {
            region_index: 0,
            dma_addr: 0,
            len: 0,
            pasid: 0,
            prot: Prot::empty(),
            host_addr: None,
        }; 2];
        let err = translate_raw(&regions, 0x1800, 0, 0x1800, Prot::READ, &mut out).unwrap_err();
        assert_eq!(err.errno(), Errno::NotFound);
    }

    #[test]
    fn partial_translate_then_gap() {
        let regions = vec![region(0x1000, 0x2000, 0)];
        let mut out = [SgEntry {
            region_index: 0,
            dma_addr: 0,
            len: 0,
            pasid: 0,
            prot: Prot::empty(),
            host_addr: None,
        }; 2];
        let err = translate_raw(&regions, 0x1800, 0, 0x2000, Prot::READ, &mut out).unwrap_err();
        assert_eq!(err.errno(), Errno::NotFound);
    }

    #[test]
    fn too_small_buffer_encodes_negative_count() {
        let regions = vec![region(0x1000, 0x1000, 0), region(0x2000, 0x1000, 0)];
        let mut out: [SgEntry; 1] = [SgEntry {
            region_index: 0,
            dma_addr: 0,
            len: 0,
            pasid: 0,
            prot: Prot::empty(),
            host_addr: None,
        }; 1];
        let outcome = translate_raw(&regions, 0x1000, 0, 0x2000, Prot::READ, &mut out).unwrap();
        assert_eq!(encode_count(outcome), -3);
    }

    #[test]
    fn different_pasid_does_not_match() {
        let regions = vec![region(0x1000, 0x1000, 7)];
        let mut out = [SgEntry {
            region_index: 0,
            dma_addr: 0,
            len: 0,
            pasid: 0,
            prot: Prot::empty(),
            host_addr: None,
        }; 1];
        let err = translate_raw(&regions, 0x1000, 0, 0x1000, Prot::READ, &mut out).unwrap_err();
        assert_eq!(err.errno(), Errno::NotFound);
    }

    #[test]
    fn protection_superset_is_enforced() {
        let regions = vec![Region::placeholder(
            IovaWindow::new(0x1000, 0x1000),
            0,
            Prot::READ,
        )];
        let mut out = [SgEntry {
            region_index: 0,
            dma_addr: 0,
            len: 0,
            pasid: 0,
            prot: Prot::empty(),
            host_addr: None,
        }; 1];
        let err = translate_raw(&regions, 0x1000, 0, 0x1000, Prot::WRITE, &mut out).unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgument);
    }
}
