// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implement fiemap support, which can tell you the underlying disk extents
//! backing a file.

use std::fs::File;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::ioctl_readwrite;

use crate::sleeputil::SleepError;

ioctl_readwrite!(fs_ioc_fiemap, b'f', 11, C_Fiemap);

/// The C_Fiemap structure's format is mandated by the FS_IOC_FIEMAP ioctl. See
/// the linux man pages for details.
#[allow(non_camel_case_types)]
#[repr(C)]
pub struct C_Fiemap {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

/// The FiemapExtent structure's format is mandated by the FS_IOC_FIEMAP ioctl.
/// See the linux man pages for details.
#[repr(C)]
#[derive(Copy, Clone, Default)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

/// Sync data before creating the extent map.
const FIEMAP_FLAG_SYNC: u32 = 0x1;
/// Data location unknown.
const FIEMAP_EXTENT_UNKNOWN: u32 = 0x2;

/// One contiguous run of blocks backing part of a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset of the run within the file.
    pub logical: u64,
    /// Byte offset of the run on the underlying device.
    pub physical: u64,
    /// Length of the run in bytes.
    pub length: u64,
    pub flags: u32,
}

impl From<FiemapExtent> for Extent {
    fn from(extent: FiemapExtent) -> Self {
        Extent {
            logical: extent.fe_logical,
            physical: extent.fe_physical,
            length: extent.fe_length,
            flags: extent.fe_flags,
        }
    }
}

/// The extents of a file at the time they were queried. The map goes stale as
/// soon as the file is reallocated, so it must not outlive the descriptor it
/// was read from.
#[derive(Debug)]
pub struct ExtentMap {
    mapped_extents: u32,
    extents: Vec<Extent>,
}

impl ExtentMap {
    /// Wrap a mapped extent list. A map without extents cannot locate a resume
    /// image, so it is rejected no matter what else it contains.
    pub fn new(target: &Path, mapped_extents: u32, extents: Vec<Extent>) -> Result<Self> {
        if mapped_extents == 0 || extents.is_empty() {
            return Err(SleepError::NoExtents(target.display().to_string()).into());
        }

        Ok(ExtentMap {
            mapped_extents,
            extents,
        })
    }

    /// Run the fiemap ioctls on an open file and collect its extents.
    pub fn from_file(source_file: &File, target: &Path) -> Result<Self> {
        let file_size = source_file
            .metadata()
            .map_err(|e| {
                SleepError::ResourceUnavailable(format!("Unable to stat {}", target.display()), e)
            })?
            .len();
        if file_size == 0 {
            return Self::new(target, 0, vec![]);
        }

        let extents = get_extents(source_file, 0, file_size, FIEMAP_FLAG_SYNC)
            .with_context(|| format!("Unable to read extent map for '{}'", target.display()))?;
        debug!("{} has {} extents:", target.display(), extents.len());
        for extent in &extents {
            debug!(
                "logical {:x} physical {:x} len {:x} flags {:x}",
                extent.logical, extent.physical, extent.length, extent.flags
            );
        }

        if let Some(first) = extents.first() {
            if (first.flags & FIEMAP_EXTENT_UNKNOWN) != 0 {
                warn!(
                    "First extent of {} has no known location (flags {:x})",
                    target.display(),
                    first.flags
                );
            }
        }

        Self::new(target, extents.len() as u32, extents)
    }

    pub fn mapped_extents(&self) -> u32 {
        self.mapped_extents
    }

    /// Physical byte offset of the first extent, where a resume image starts.
    pub fn first_physical_offset(&self) -> u64 {
        self.extents[0].physical
    }
}

/// Helper function to run the fiemap ioctl without any data to determine
/// how many extent structures are needed. In a regular file, this count
/// could go stale as soon as it is returned. This code assumes no other
/// process is manipulating the file at the same time.
fn get_extent_count(
    source_file: &File,
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
) -> Result<u32> {
    let mut param = C_Fiemap {
        fm_start,
        fm_length,
        fm_flags,
        fm_mapped_extents: 0,
        fm_extent_count: 0,
        fm_reserved: 0,
    };

    // Safe because the param struct has been pre-initialized, uses repr(C),
    // and contains only basic types.
    unsafe { fs_ioc_fiemap(source_file.as_raw_fd(), &mut param) }
        .map_err(SleepError::FiemapError)
        .context("Failed to get fiemap extent count")?;

    Ok(param.fm_mapped_extents)
}

/// Execute the ioctl to get the extents, and convert them back to an array
/// of extent structures.
fn get_extents(
    source_file: &File,
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
) -> Result<Vec<Extent>> {
    let extent_count = get_extent_count(source_file, fm_start, fm_length, fm_flags)?;
    if extent_count == 0 {
        return Ok(vec![]);
    }

    let fiemap_len = mem::size_of::<C_Fiemap>();
    let extents_len = extent_count as usize * mem::size_of::<FiemapExtent>();
    // Back the buffer with u64s so the header and extents are naturally aligned.
    let mut buffer = vec![0u64; (fiemap_len + extents_len + 7) / 8];
    let header = buffer.as_mut_ptr() as *mut C_Fiemap;

    // Safe because the buffer is aligned for C_Fiemap and was allocated larger
    // than it.
    unsafe {
        header.write(C_Fiemap {
            fm_start,
            fm_length,
            fm_flags,
            fm_mapped_extents: 0,
            fm_extent_count: extent_count,
            fm_reserved: 0,
        });
    }

    // Safe because the ioctl operates on a buffer bounded by the length we
    // just supplied in fm_extent_count of the struct fiemap.
    unsafe { fs_ioc_fiemap(source_file.as_raw_fd(), header) }
        .map_err(SleepError::FiemapError)
        .context("Failed to get fiemap")?;

    // Safe because the header was initialized above and the kernel only
    // fills in basic types.
    let fiemap = unsafe { header.read() };
    if fiemap.fm_mapped_extents != extent_count {
        return Err(SleepError::InvalidFiemapError(format!(
            "Got {} fiemap extents, expected {}",
            fiemap.fm_mapped_extents, extent_count
        )))
        .context("Fiemap changed");
    }

    // Safe because the ioctl returned this many fiemap_extents directly after
    // the header, all within the buffer.
    let extents = unsafe {
        let first = (header as *const u8).add(fiemap_len) as *const FiemapExtent;
        (0..extent_count as usize)
            .map(|i| Extent::from(first.add(i).read()))
            .collect()
    };

    Ok(extents)
}
