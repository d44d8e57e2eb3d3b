// SPDX-License-Identifier: MPL-2.0

//! The bounded, overlap-checked table of DMA regions.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::bitmap;
use crate::context::{CallbackGuard, Context};
use crate::error::{Errno, Error, Result};
use crate::region::{fds_are_same_file, IovaWindow, Pasid, Prot, Region};

/// A newly-added or about-to-be-removed region's public shape, handed to
/// removal callbacks.
pub struct RegionInfo<'a> {
    pub iova: IovaWindow,
    pub pasid: Pasid,
    pub prot: Prot,
    pub fd: Option<RawFd>,
    pub offset: u64,
    _priv: std::marker::PhantomData<&'a ()>,
}

/// A callback invoked around region removal, mirroring the
/// `dma_unregister` hook's reentrancy contract: the context's callback
/// flag is set for the callback's duration via [`CallbackGuard`].
pub type UnregisterCallback<'a> = dyn Fn(&RegionInfo<'_>) + 'a;

/// The bounded region table owned by a [`crate::controller::Controller`].
pub struct RegionRegistry {
    regions: Vec<Region>,
    max_regions: usize,
}

impl RegionRegistry {
    pub fn new(max_regions: usize) -> Self {
        Self {
            regions: Vec::with_capacity(max_regions.min(64)),
            max_regions,
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    pub fn as_slice(&self) -> &[Region] {
        &self.regions
    }

    /// Crate-internal: only dirty-logging setup needs direct mutable
    /// access to every region at once.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [Region] {
        &mut self.regions
    }

    /// Registers a region, or updates an identical one.
    ///
    /// See `RegionRegistry`'s module docs and `original_source/lib/dma.c`'s
    /// `dma_controller_add_region` for the exact identity-collapse and
    /// overlap rules this follows.
    pub fn add_region(
        &mut self,
        ctx: &(impl Context + ?Sized),
        addr: u64,
        pasid: Pasid,
        size: u64,
        fd: Option<OwnedFd>,
        offset: u64,
        prot: Prot,
        logging_pgsize: u64,
    ) -> Result<usize> {
        let window = IovaWindow::new(addr, size);

        for (index, existing) in self.regions.iter_mut().enumerate() {
            if existing.pasid != pasid {
                continue;
            }
            if existing.iova.base == addr && existing.iova.len == size {
                if existing.offset() != offset {
                    return Err(Error::with_message(
                        Errno::InvalidArgument,
                        "re-adding a region with a different offset is not allowed",
                    ));
                }
                let same_file = match (existing.fd(), fd.as_ref()) {
                    (Some(existing_fd), Some(new_fd)) => {
                        fds_are_same_file(existing_fd, new_fd.as_raw_fd())
                    }
                    (None, None) => true,
                    _ => false,
                };
                if !same_file {
                    return Err(Error::with_message(
                        Errno::InvalidArgument,
                        "re-adding a region backed by a different file is not allowed",
                    ));
                }
                existing.prot = prot;
                ctx.log(
                    log::Level::Debug,
                    &format!("updated protection on region {index} at {addr:#x}"),
                );
                return Ok(index);
            }
            if window.overlaps(&existing.iova) {
                return Err(Error::with_message(
                    Errno::InvalidArgument,
                    "region overlaps an existing region in the same address space",
                ));
            }
        }

        if self.regions.len() == self.max_regions {
            return Err(Error::with_message(
                Errno::InvalidArgument,
                "region table is full",
            ));
        }

        // Size and allocate the dirty bitmap before touching mmap: a
        // bitmap-allocation failure must never leave a mapping that then
        // has to be torn back down.
        let dirty_bitmap = if logging_pgsize != 0 && fd.is_some() {
            let bm_size = bitmap::bitmap_size(window.len, logging_pgsize).map_err(|e| {
                ctx.log(
                    log::Level::Error,
                    "failed to size dirty bitmap for new region",
                );
                e
            })?;
            Some(
                (0..bm_size)
                    .map(|_| std::sync::atomic::AtomicU8::new(0))
                    .collect::<Vec<_>>()
                    .into_boxed_slice(),
            )
        } else {
            None
        };

        let mut region = match fd {
            Some(fd) => Region::mapped(window, pasid, prot, fd, offset)?,
            None => Region::placeholder(window, pasid, prot),
        };
        region.dirty_bitmap = dirty_bitmap;

        self.regions.push(region);
        Ok(self.regions.len() - 1)
    }

    /// Removes the region matching `(addr, size, pasid)` exactly, invoking
    /// `cb` (if any) under a [`CallbackGuard`] before unmapping it.
    ///
    /// The match is on PASID exactly as given; there is no implicit
    /// wildcard for [`crate::region::INVALID_PASID`] on removal, matching
    /// this rewrite's explicit choice not to guess at that ambiguity (see
    /// `DESIGN.md`).
    pub fn remove_region(
        &mut self,
        ctx: &(impl Context + ?Sized),
        addr: u64,
        pasid: Pasid,
        size: u64,
        cb: Option<&UnregisterCallback<'_>>,
    ) -> Result<()> {
        let index = self
            .regions
            .iter()
            .position(|r| r.iova.base == addr && r.iova.len == size && r.pasid == pasid)
            .ok_or_else(|| Error::with_message(Errno::NotFound, "no matching region"))?;

        self.remove_at(ctx, index, cb);
        Ok(())
    }

    /// Removes every region, invoking `cb` for each one first.
    pub fn remove_all_regions(&mut self, ctx: &(impl Context + ?Sized), cb: Option<&UnregisterCallback<'_>>) {
        while !self.regions.is_empty() {
            self.remove_at(ctx, self.regions.len() - 1, cb);
        }
    }

    fn remove_at(&mut self, ctx: &(impl Context + ?Sized), index: usize, cb: Option<&UnregisterCallback<'_>>) {
        if let Some(cb) = cb {
            let region = &self.regions[index];
            let info = RegionInfo {
                iova: region.iova,
                pasid: region.pasid,
                prot: region.prot,
                fd: region.fd(),
                offset: region.offset(),
                _priv: std::marker::PhantomData,
            };
            let _guard = CallbackGuard::enter(ctx);
            cb(&info);
        }
        // Dropping the region unmaps it (if mapped) and closes its fd;
        // unmap failures are logged inside `Region`'s own `Drop` impl and
        // never propagate here, matching the original library swallowing
        // munmap errors during removal.
        self.regions.remove(index);
    }
}
