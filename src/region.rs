// SPDX-License-Identifier: MPL-2.0

//! A single DMA region: an IOVA window, optionally backed by a host mapping
//! of a client-supplied file descriptor.

use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU8;

use bitflags::bitflags;
use nix::sys::mman::{madvise, mmap, munmap, MapFlags, MmapAdvise, ProtFlags};
use nix::sys::stat::fstat;
use nix::unistd::{sysconf, SysconfVar};

use crate::bitmap;
use crate::error::{Errno, Error, Result};

bitflags! {
    /// Requested or granted access permissions on a region.
    #[derive(Default)]
    pub struct Prot: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// A 32-bit process address space tag.
pub type Pasid = u32;

/// The PASID used for requests that are not tagged to a specific address
/// space.
pub const INVALID_PASID: Pasid = u32::MAX;

/// A half-open `[base, base + len)` IOVA window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovaWindow {
    pub base: u64,
    pub len: u64,
}

impl IovaWindow {
    pub fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// True if `self` and `other` overlap at all.
    pub fn overlaps(&self, other: &IovaWindow) -> bool {
        self.contains(other.base) || other.contains(self.base)
    }
}

/// The host mapping obtained for a mapped region: a page-aligned range of
/// the server's own address space.
struct Mapping {
    base: NonNull<std::ffi::c_void>,
    len: usize,
}

// The mapping is only ever read through raw pointer arithmetic exposed to
// callers as plain addresses; no aliasing guarantee beyond "the region
// outlives the SG entries derived from it" is made or needed here.
unsafe impl Send for Mapping {}
// `base` is a plain address, set once at construction and never mutated
// through `&self`; concurrent readers computing offsets from it need no
// synchronization beyond what they do with the resulting host pointer.
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` were returned by a prior successful mmap of
        // exactly this length and are not in use by anyone else: the owning
        // `Region` is being dropped.
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            log::error!("munmap failed during region teardown: {e}");
        }
    }
}

/// One entry in a [`crate::registry::RegionRegistry`].
pub struct Region {
    pub iova: IovaWindow,
    pub pasid: Pasid,
    pub prot: Prot,
    pub page_size: u64,
    offset: u64,
    fd: Option<OwnedFd>,
    mapping: Option<Mapping>,
    vaddr: Option<NonNull<std::ffi::c_void>>,
    pub dirty_bitmap: Option<Box<[AtomicU8]>>,
}

// Same rationale as `Mapping`: the raw `vaddr` pointer is handed out as a
// plain address for the caller to dereference under its own synchronization.
unsafe impl Send for Region {}
// The only field `Region` mutates through `&self` is `dirty_bitmap`, and
// that mutation goes entirely through `AtomicU8` operations; `vaddr` and
// `mapping`'s pointer are set once and never change afterwards. Sharing a
// `&Region` across threads (translate/mark-dirty readers) is therefore sound.
unsafe impl Sync for Region {}

impl Region {
    /// Builds a placeholder (unmapped) region: no fd, no mapping, no dirty
    /// bitmap.
    pub fn placeholder(iova: IovaWindow, pasid: Pasid, prot: Prot) -> Self {
        Self {
            iova,
            pasid,
            prot,
            page_size: 0,
            offset: 0,
            fd: None,
            mapping: None,
            vaddr: None,
            dirty_bitmap: None,
        }
    }

    /// Maps `fd` at `offset` and builds a mapped region covering `iova`.
    ///
    /// `page_size` is `max(fd's preferred block size, host page size)`, per
    /// the mapping contract; the mmap offset is aligned down to it and the
    /// length aligned up.
    pub fn mapped(
        iova: IovaWindow,
        pasid: Pasid,
        prot: Prot,
        fd: OwnedFd,
        offset: u64,
    ) -> Result<Self> {
        let page_size = discover_page_size(&fd)?;

        let aligned_offset = align_down(offset, page_size);
        let unaligned_remainder = offset - aligned_offset;
        let mmap_len = align_up(iova.len, page_size);

        let prot_flags = to_mman_prot(prot);
        let len = NonZeroUsize::new(mmap_len as usize).ok_or_else(|| {
            Error::with_message(Errno::InvalidArgument, "region length must be nonzero")
        })?;

        // SAFETY: `fd` is a valid, owned file descriptor for the lifetime of
        // this call; the resulting mapping is tracked by `Mapping` and
        // unmapped exactly once, on drop.
        let base = unsafe {
            mmap(
                None,
                len,
                prot_flags,
                MapFlags::MAP_SHARED,
                &fd,
                aligned_offset as i64,
            )
        }
        .map_err(Error::from)?;

        // SAFETY: `base`/`len` describe the mapping just created above.
        if let Err(e) = unsafe { madvise(base, len.get(), MmapAdvise::MADV_DONTDUMP) } {
            log::debug!("madvise(MADV_DONTDUMP) failed, continuing without it: {e}");
        }

        // SAFETY: `unaligned_remainder < page_size <= mmap_len`, so this
        // stays within the mapping just established.
        let vaddr = unsafe { NonNull::new_unchecked(base.as_ptr().add(unaligned_remainder as usize)) };

        Ok(Self {
            iova,
            pasid,
            prot,
            page_size,
            offset,
            fd: Some(fd),
            mapping: Some(Mapping {
                base,
                len: mmap_len as usize,
            }),
            vaddr: Some(vaddr),
            dirty_bitmap: None,
        })
    }

    /// True iff this region has a live host mapping.
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// The host address corresponding to `self.iova.base`, if mapped.
    pub fn vaddr(&self) -> Option<NonNull<std::ffi::c_void>> {
        self.vaddr
    }

    /// The host address corresponding to an IOVA known to lie within this
    /// region, if mapped.
    pub fn host_addr_for(&self, iova_addr: u64) -> Option<NonNull<std::ffi::c_void>> {
        let base = self.vaddr?;
        let delta = iova_addr.checked_sub(self.iova.base)?;
        // SAFETY: `delta < self.iova.len`, which fits within the mapping.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(delta as usize)) })
    }

    /// The raw descriptor backing this region, for file-identity checks.
    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Allocates this region's dirty bitmap for the given logging page
    /// size. No-op (returns `Ok`) if the region is unmapped; the caller is
    /// responsible for only calling this on mapped regions that should be
    /// logged.
    pub fn enable_dirty_logging(&mut self, logging_pgsize: u64) -> Result<()> {
        if !self.is_mapped() {
            return Ok(());
        }
        let size = bitmap::bitmap_size(self.iova.len, logging_pgsize)?;
        let bitmap = (0..size).map(|_| AtomicU8::new(0)).collect::<Vec<_>>();
        self.dirty_bitmap = Some(bitmap.into_boxed_slice());
        Ok(())
    }

    pub fn disable_dirty_logging(&mut self) {
        self.dirty_bitmap = None;
    }
}

/// Returns `true` if `a` and `b` refer to the same underlying file, per the
/// device+inode equality used by `add_region`'s identity-collapse check. A
/// matching raw fd number short-circuits to `true`; any `fstat` failure is
/// treated as "not the same file".
pub fn fds_are_same_file(a: RawFd, b: RawFd) -> bool {
    if a == b {
        return true;
    }
    // SAFETY: both descriptors are held open by the caller (existing or
    // about-to-be-registered regions) for the duration of this check.
    let (sa, sb) = unsafe {
        let a = BorrowedFd::borrow_raw(a);
        let b = BorrowedFd::borrow_raw(b);
        match (fstat(a), fstat(b)) {
            (Ok(sa), Ok(sb)) => (sa, sb),
            _ => return false,
        }
    };
    sa.st_dev == sb.st_dev && sa.st_ino == sb.st_ino
}

fn discover_page_size(fd: &OwnedFd) -> Result<u64> {
    let st = fstat(fd).map_err(Error::from)?;
    let block_size = st.st_blksize.max(0) as u64;
    let host_page_size = sysconf(SysconfVar::PAGE_SIZE)
        .map_err(Error::from)?
        .unwrap_or(4096) as u64;
    Ok(block_size.max(host_page_size).max(1).next_power_of_two())
}

fn align_down(v: u64, align: u64) -> u64 {
    v & !(align - 1)
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

fn to_mman_prot(prot: Prot) -> ProtFlags {
    let mut flags = ProtFlags::empty();
    if prot.contains(Prot::READ) {
        flags |= ProtFlags::PROT_READ;
    }
    if prot.contains(Prot::WRITE) {
        flags |= ProtFlags::PROT_WRITE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_overlap() {
        let a = IovaWindow::new(0x1000, 0x1000);
        let b = IovaWindow::new(0x1800, 0x1000);
        let c = IovaWindow::new(0x3000, 0x1000);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn window_contains_is_half_open() {
        let w = IovaWindow::new(0x1000, 0x1000);
        assert!(w.contains(0x1000));
        assert!(w.contains(0x1fff));
        assert!(!w.contains(0x2000));
    }

    #[test]
    fn alignment_math() {
        assert_eq!(align_down(0x1234, 0x1000), 0x1000);
        assert_eq!(align_up(0x1234, 0x1000), 0x2000);
        assert_eq!(align_down(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
    }

    #[test]
    fn placeholder_has_no_mapping() {
        let r = Region::placeholder(IovaWindow::new(0, 0x1000), INVALID_PASID, Prot::READ);
        assert!(!r.is_mapped());
        assert!(r.vaddr().is_none());
        assert!(r.fd().is_none());
    }
}
