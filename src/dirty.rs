// SPDX-License-Identifier: MPL-2.0

//! Dirty-page logging: starting/stopping the log, marking pages dirty, and
//! draining (optionally resampled) bitmaps back to a client.

use crate::bitmap;
use crate::error::{Errno, Error, Result};
use crate::region::INVALID_PASID;
use crate::registry::RegionRegistry;
use crate::translator::{translate_raw, SgEntry, TranslateOutcome};

/// Process-wide dirty-logging state: either off, or on at a fixed page
/// size shared by every mapped region's bitmap.
#[derive(Default)]
pub struct DirtyLog {
    pgsize: u64,
}

impl DirtyLog {
    pub fn new() -> Self {
        Self { pgsize: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.pgsize != 0
    }

    pub fn page_size(&self) -> u64 {
        self.pgsize
    }

    /// Enables logging at `pgsize`, allocating a dirty bitmap for every
    /// currently-mapped region.
    ///
    /// A repeat call at the same `pgsize` is a no-op success; a repeat
    /// call at a different `pgsize` is rejected, matching
    /// `dma_controller_dirty_page_logging_start`.
    pub fn start(&mut self, regions: &mut RegionRegistry, pgsize: u64) -> Result<()> {
        if pgsize == 0 {
            return Err(Error::with_message(
                Errno::InvalidArgument,
                "logging page size must be nonzero",
            ));
        }
        if self.is_enabled() {
            return if self.pgsize == pgsize {
                Ok(())
            } else {
                Err(Error::with_message(
                    Errno::InvalidArgument,
                    "dirty logging is already enabled at a different page size",
                ))
            };
        }

        let mut enabled_so_far = Vec::new();
        for (index, region) in regions_mut(regions).iter_mut().enumerate() {
            if !region.is_mapped() {
                continue;
            }
            if let Err(e) = region.enable_dirty_logging(pgsize) {
                for &idx in &enabled_so_far {
                    regions_mut(regions)[idx].disable_dirty_logging();
                }
                return Err(e);
            }
            enabled_so_far.push(index);
        }

        self.pgsize = pgsize;
        Ok(())
    }

    /// Disables logging, freeing every region's bitmap. No-op if already
    /// disabled.
    pub fn stop(&mut self, regions: &mut RegionRegistry) {
        if !self.is_enabled() {
            return;
        }
        for region in regions_mut(regions).iter_mut() {
            region.disable_dirty_logging();
        }
        self.pgsize = 0;
    }

    /// Marks the bytes covered by `sg` dirty in its region's bitmap, if
    /// logging is enabled for that region.
    pub fn mark_dirty(&self, regions: &RegionRegistry, sg: &SgEntry) {
        let Some(region) = regions.get(sg.region_index) else {
            return;
        };
        let Some(bitmap) = region.dirty_bitmap.as_ref() else {
            return;
        };
        let page_size = self.pgsize.max(1);
        let start_page = (sg.dma_addr - region.iova.base) / page_size;
        let end_page = (sg.dma_addr - region.iova.base + sg.len).div_ceil(page_size);
        for page in start_page..end_page {
            let byte = (page / 8) as usize;
            let bit = (page % 8) as u8;
            if let Some(b) = bitmap.get(byte) {
                b.fetch_or(1 << bit, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    /// Drains `[addr, addr + len)`'s dirty bitmap into `out`, resampled to
    /// `client_pgsize` if it differs from the logging page size.
    ///
    /// Only whole-region queries are supported: `[addr, addr + len)` must
    /// match exactly one region's window. This is an intentional,
    /// preserved restriction (see `DESIGN.md`), not an oversight.
    pub fn get_bitmap(
        &self,
        regions: &RegionRegistry,
        addr: u64,
        len: u64,
        client_pgsize: u64,
        out: &mut [u8],
    ) -> Result<()> {
        // Steps 1-2 (SPEC_FULL.md §4.5): translate to exactly one region and
        // require an exact addr/len match, before any of the logging-state
        // checks below. This lets a request with a bogus address surface
        // the translator's own error instead of being masked by an
        // unrelated "logging not enabled" or "bad client page size" check.
        let all = regions.as_slice();
        let mut sg = [SgEntry {
            region_index: 0,
            dma_addr: 0,
            len: 0,
            pasid: INVALID_PASID,
            prot: crate::region::Prot::empty(),
            host_addr: None,
        }];
        let outcome = translate_raw(
            all,
            addr,
            INVALID_PASID,
            len,
            crate::region::Prot::empty(),
            &mut sg,
        )?;
        let TranslateOutcome::Ok(1) = outcome else {
            return Err(Error::with_message(
                Errno::Unsupported,
                "dirty_get requires addr/len to match exactly one region",
            ));
        };

        let entry = sg[0];
        if entry.dma_addr != addr || entry.len != len {
            return Err(Error::with_message(
                Errno::Unsupported,
                "dirty_get requires addr/len to match a whole region exactly",
            ));
        }

        // Step 3.
        if !self.is_enabled() {
            return Err(Error::with_message(
                Errno::InvalidArgument,
                "dirty logging is not enabled",
            ));
        }
        // Step 4.
        if client_pgsize == 0 || !client_pgsize.is_power_of_two() {
            return Err(Error::with_message(
                Errno::InvalidArgument,
                "client page size must be a nonzero power of two",
            ));
        }

        // Step 5.
        let client_bm_size = bitmap::bitmap_size(len, client_pgsize)?;
        if out.len() != client_bm_size {
            return Err(Error::with_message(
                Errno::InvalidArgument,
                "output buffer size does not match the client page size",
            ));
        }

        // Step 6.
        let region = &all[entry.region_index];
        if !region.is_mapped() {
            return Err(Error::with_message(
                Errno::InvalidArgument,
                "dirty_get on an unmapped region is not supported",
            ));
        }

        let Some(bits) = region.dirty_bitmap.as_deref() else {
            return Err(Error::with_message(
                Errno::InvalidArgument,
                "region has no dirty bitmap",
            ));
        };

        match client_pgsize.cmp(&self.pgsize) {
            std::cmp::Ordering::Equal => bitmap::drain_same(bits, out),
            std::cmp::Ordering::Less => bitmap::extend(bits, self.pgsize, out, client_pgsize),
            std::cmp::Ordering::Greater => bitmap::combine(bits, self.pgsize, out, client_pgsize),
        }

        Ok(())
    }
}

fn regions_mut(regions: &mut RegionRegistry) -> &mut [crate::region::Region] {
    // `RegionRegistry` doesn't expose a public `&mut [Region]` accessor
    // since callers shouldn't mutate regions directly; this crate-internal
    // helper is the one place dirty-logging setup needs it.
    regions.as_mut_slice()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LogContext;
    use crate::region::Prot;

    fn registry_with_one_region(len: u64) -> RegionRegistry {
        let ctx = LogContext::new();
        let mut reg = RegionRegistry::new(4);
        reg.add_region(&ctx, 0, INVALID_PASID, len, None, 0, Prot::READ, 0)
            .unwrap();
        reg
    }

    #[test]
    fn start_requires_nonzero_pgsize() {
        let mut regs = registry_with_one_region(0x8000);
        let mut log = DirtyLog::new();
        let err = log.start(&mut regs, 0).unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgument);
    }

    #[test]
    fn restart_same_pgsize_is_noop() {
        let mut regs = registry_with_one_region(0x8000);
        let mut log = DirtyLog::new();
        log.start(&mut regs, 0x1000).unwrap();
        log.start(&mut regs, 0x1000).unwrap();
        assert!(log.is_enabled());
    }

    #[test]
    fn restart_different_pgsize_fails() {
        let mut regs = registry_with_one_region(0x8000);
        let mut log = DirtyLog::new();
        log.start(&mut regs, 0x1000).unwrap();
        let err = log.start(&mut regs, 0x2000).unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgument);
    }

    #[test]
    fn get_bitmap_requires_logging_enabled() {
        let regs = registry_with_one_region(0x8000);
        let log = DirtyLog::new();
        let mut out = [0u8; 1];
        let err = log
            .get_bitmap(&regs, 0, 0x8000, 0x1000, &mut out)
            .unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgument);
    }

    #[test]
    fn get_bitmap_surfaces_translate_error_before_logging_state_checks() {
        // Logging disabled *and* an address covered by no region at all:
        // the translate/exact-match steps run first, so the translator's
        // own `NotFound` surfaces rather than a masking `InvalidArgument`
        // from the logging-enabled or client-pgsize checks.
        let regs = registry_with_one_region(0x8000);
        let log = DirtyLog::new();
        let mut out = [0u8; 1];
        let err = log
            .get_bitmap(&regs, 0x10000, 0x1000, 0, &mut out)
            .unwrap_err();
        assert_eq!(err.errno(), Errno::NotFound);
    }

    #[test]
    fn get_bitmap_rejects_request_spanning_regions() {
        let ctx = LogContext::new();
        let mut regs = RegionRegistry::new(4);
        regs.add_region(&ctx, 0, INVALID_PASID, 0x4000, None, 0, Prot::READ, 0)
            .unwrap();
        regs.add_region(
            &ctx,
            0x4000,
            INVALID_PASID,
            0x4000,
            None,
            0,
            Prot::READ,
            0,
        )
        .unwrap();
        let mut log = DirtyLog::new();
        log.start(&mut regs, 0x1000).unwrap();
        let mut out = [0u8; 1];
        let err = log
            .get_bitmap(&regs, 0, 0x8000, 0x1000, &mut out)
            .unwrap_err();
        assert_eq!(err.errno(), Errno::Unsupported);
    }

    #[test]
    fn get_bitmap_on_unmapped_region_is_invalid() {
        let mut regs = registry_with_one_region(0x8000);
        let mut log = DirtyLog::new();
        log.start(&mut regs, 0x1000).unwrap();
        let mut out = [0u8; 1];
        let err = log
            .get_bitmap(&regs, 0, 0x8000, 0x1000, &mut out)
            .unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgument);
    }
}
