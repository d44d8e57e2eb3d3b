// SPDX-License-Identifier: MPL-2.0

//! DMA-region registry, scatter/gather translation and dirty-page logging
//! for a userspace device-emulation server.
//!
//! A device emulated in a separate process shares guest memory with this
//! process as file descriptors plus IOVA windows; [`Controller`] is the
//! single object that tracks those regions, splits arbitrary IOVA ranges
//! into scatter/gather lists against them, and tracks which guest pages
//! the device has dirtied for live migration.

pub mod bitmap;
pub mod context;
pub mod dirty;
pub mod error;
pub mod region;
pub mod registry;
pub mod translator;

mod controller;

pub use context::{Context, LogContext};
pub use controller::Controller;
pub use error::{Errno, Error, Result};
pub use region::{IovaWindow, Pasid, Prot, INVALID_PASID};
pub use registry::{RegionInfo, UnregisterCallback};
pub use translator::SgEntry;
