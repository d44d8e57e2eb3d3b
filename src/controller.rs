// SPDX-License-Identifier: MPL-2.0

//! The public façade: [`Controller`] owns the region table and dirty-log
//! state and exposes the operations a hosting device-emulation server
//! calls into.

use std::os::fd::OwnedFd;

use crate::context::Context;
use crate::dirty::DirtyLog;
use crate::error::Result;
use crate::region::{Pasid, Prot};
use crate::registry::{RegionRegistry, UnregisterCallback};
use crate::translator::{encode_count, translate_raw, translate_vec, SgEntry, TranslateOutcome};

/// The DMA-region controller for a single device.
///
/// Owns the region table (see [`RegionRegistry`]) and the dirty-logging
/// state (see [`DirtyLog`]), plus a back-reference to the outer hosting
/// context used for logging and callback reentrancy.
pub struct Controller<C: Context> {
    ctx: C,
    regions: RegionRegistry,
    dirty: DirtyLog,
    /// Accepted at construction and never enforced past that: see
    /// `DESIGN.md`'s "Open Question decisions" for why this historical
    /// total-size budget is kept only for API compatibility.
    #[allow(dead_code)]
    max_size: u64,
}

impl<C: Context> Controller<C> {
    /// Creates a new, empty controller.
    pub fn new(ctx: C, max_regions: usize, max_size: u64) -> Self {
        Self {
            ctx,
            regions: RegionRegistry::new(max_regions),
            dirty: DirtyLog::new(),
            max_size,
        }
    }

    /// The number of currently registered regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Registers (or, on an identical re-add, updates) a region.
    ///
    /// `fd` is consumed on success; on failure it is dropped (closed)
    /// along with any partially-allocated resources.
    pub fn add_region(
        &mut self,
        addr: u64,
        pasid: Pasid,
        size: u64,
        fd: Option<OwnedFd>,
        offset: u64,
        prot: Prot,
    ) -> Result<usize> {
        self.regions.add_region(
            &self.ctx,
            addr,
            pasid,
            size,
            fd,
            offset,
            prot,
            self.dirty.page_size(),
        )
    }

    /// Removes the region matching `(addr, size, pasid)` exactly.
    ///
    /// `pasid` must match the stored region's PASID exactly; there is no
    /// wildcard match against [`crate::region::INVALID_PASID`] (see
    /// `DESIGN.md`).
    pub fn remove_region(
        &mut self,
        addr: u64,
        pasid: Pasid,
        size: u64,
        cb: Option<&UnregisterCallback<'_>>,
    ) -> Result<()> {
        self.regions.remove_region(&self.ctx, addr, pasid, size, cb)
    }

    /// Removes every region.
    pub fn remove_all_regions(&mut self, cb: Option<&UnregisterCallback<'_>>) {
        self.regions.remove_all_regions(&self.ctx, cb)
    }

    /// Raw, FFI-shaped translate: returns the number of entries written to
    /// `out`, or `-required - 1` if `out` was too small, or `Err` on
    /// `NotFound`/permission failure.
    pub fn translate(
        &self,
        addr: u64,
        pasid: Pasid,
        len: u64,
        prot: Prot,
        out: &mut [SgEntry],
    ) -> Result<i64> {
        let outcome = translate_raw(self.regions.as_slice(), addr, pasid, len, prot, out)?;
        Ok(encode_count(outcome))
    }

    /// Safe convenience: translates and returns an owned `Vec<SgEntry>`.
    pub fn translate_vec(&self, addr: u64, pasid: Pasid, len: u64, prot: Prot) -> Result<Vec<SgEntry>> {
        translate_vec(self.regions.as_slice(), addr, pasid, len, prot)
    }

    /// True iff the region an `SgEntry` refers to has a live host mapping.
    pub fn sg_is_mappable(&self, sg: &SgEntry) -> bool {
        self.regions
            .get(sg.region_index)
            .map(|r| r.is_mapped())
            .unwrap_or(false)
    }

    /// Marks the bytes covered by `sg` dirty, if logging is enabled for
    /// its region. Called by device emulation after writing guest memory
    /// through `sg`'s host mapping.
    pub fn mark_dirty(&self, sg: &SgEntry) {
        self.dirty.mark_dirty(&self.regions, sg)
    }

    /// Enables dirty-page logging at `pgsize` across all mapped regions.
    pub fn dirty_start(&mut self, pgsize: u64) -> Result<()> {
        self.dirty.start(&mut self.regions, pgsize)
    }

    /// Disables dirty-page logging.
    pub fn dirty_stop(&mut self) {
        self.dirty.stop(&mut self.regions)
    }

    /// Drains `[addr, addr + len)`'s dirty bitmap into `out`, resampled to
    /// `client_pgsize` if needed. See [`DirtyLog::get_bitmap`] for the
    /// exact validation order.
    pub fn dirty_get(&self, addr: u64, len: u64, client_pgsize: u64, out: &mut [u8]) -> Result<()> {
        self.dirty.get_bitmap(&self.regions, addr, len, client_pgsize, out)
    }
}

impl<C: Context> Drop for Controller<C> {
    fn drop(&mut self) {
        if !self.regions.is_empty() {
            self.ctx.log(
                log::Level::Error,
                &format!(
                    "controller dropped with {} region(s) still registered; \
                     call remove_all_regions before teardown",
                    self.regions.len()
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LogContext;
    use crate::error::Errno;

    #[test]
    fn new_controller_is_empty() {
        let ctrl = Controller::new(LogContext::new(), 4, 0);
        assert_eq!(ctrl.region_count(), 0);
    }

    #[test]
    fn add_translate_remove_roundtrip() {
        let mut ctrl = Controller::new(LogContext::new(), 4, 0);
        ctrl.add_region(0x1000, 0, 0x1000, None, 0, Prot::READ)
            .unwrap();
        let sgs = ctrl
            .translate_vec(0x1000, 0, 0x1000, Prot::READ)
            .unwrap();
        assert_eq!(sgs.len(), 1);
        assert_eq!(sgs[0].region_index, 0);

        ctrl.remove_region(0x1000, 0, 0x1000, None).unwrap();
        assert_eq!(ctrl.region_count(), 0);
        let err = ctrl.translate_vec(0x1000, 0, 0x1000, Prot::READ).unwrap_err();
        assert_eq!(err.errno(), Errno::NotFound);
    }

    #[test]
    fn teardown_with_regions_logs_but_does_not_panic() {
        let mut ctrl = Controller::new(LogContext::new(), 4, 0);
        ctrl.add_region(0x1000, 0, 0x1000, None, 0, Prot::READ)
            .unwrap();
        drop(ctrl);
    }
}
