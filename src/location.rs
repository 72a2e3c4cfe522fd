// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tell the kernel where to write the hibernation image.

use std::fs::OpenOptions;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::fiemap::ExtentMap;
use crate::sleeputil::SleepError;
use crate::swap::{HibernationLocation, LocationKind};

/// The kernel's resume parameters.
pub trait ResumeControls {
    /// Whether the kernel offers a resume offset control at all.
    fn resume_offset_supported(&self) -> Result<bool>;
    fn write_resume(&mut self, value: &str) -> Result<()>;
    fn write_resume_offset(&mut self, value: &str) -> Result<()>;
}

/// Where a swap file lives on its block device.
#[derive(Debug)]
pub struct SwapFileBacking {
    pub extents: ExtentMap,
    /// Device number of the filesystem holding the file.
    pub device_number: u64,
}

/// Looks up the backing of a swap file.
pub trait BackingProbe {
    fn probe(&self, path: &Path) -> Result<SwapFileBacking>;
}

/// Looks up swap file backing with FIEMAP.
pub struct FiemapProbe;

impl BackingProbe for FiemapProbe {
    fn probe(&self, path: &Path) -> Result<SwapFileBacking> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| SleepError::ResourceUnavailable(path.display().to_string(), e))
            .context("Failed to open swap file")?;
        let metadata = file
            .metadata()
            .map_err(|e| SleepError::ResourceUnavailable(path.display().to_string(), e))
            .context("Failed to stat swap file")?;
        let extents = ExtentMap::from_file(&file, path)?;
        Ok(SwapFileBacking {
            extents,
            device_number: metadata.dev(),
        })
    }
}

/// Configure the kernel's resume parameters for `location`. An explicit
/// `offset_override` is written verbatim instead of the computed page offset.
pub fn write_hibernate_location<C, P>(
    controls: &mut C,
    probe: &P,
    location: &HibernationLocation,
    offset_override: Option<&str>,
    page_size: u64,
) -> Result<()>
where
    C: ResumeControls + ?Sized,
    P: BackingProbe + ?Sized,
{
    match &location.kind {
        LocationKind::Partition => {
            let device = location.device.display().to_string();
            debug!("Resuming from partition {}", device);
            return controls.write_resume(&device);
        }
        LocationKind::File => {}
        LocationKind::Other(kind) => {
            return Err(SleepError::InvalidConfiguration(format!(
                "Cannot hibernate to swap of type '{}' at {}",
                kind,
                location.device.display()
            ))
            .into());
        }
    }

    if !controls.resume_offset_supported()? {
        debug!("Kernel too old, can't configure resume offset, ignoring");
        return Ok(());
    }

    let backing = probe.probe(&location.device)?;
    debug!(
        "{} has {} mapped extents",
        location.device.display(),
        backing.extents.mapped_extents()
    );
    let offset = match offset_override {
        Some(offset) => offset.to_string(),
        None => backing
            .extents
            .first_physical_offset()
            .checked_div(page_size)
            .ok_or_else(|| SleepError::InvalidConfiguration("Page size is zero".to_string()))?
            .to_string(),
    };

    controls
        .write_resume_offset(&offset)
        .context("Failed to write resume offset")?;
    let device = format!("{:x}", backing.device_number);
    controls
        .write_resume(&device)
        .context("Failed to write resume device")?;

    info!(
        "Hibernating to file {} (device {}, offset {})",
        location.device.display(),
        device,
        offset
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io;
    use std::path::PathBuf;

    use super::*;
    use crate::fiemap::Extent;

    #[derive(Default)]
    struct FakeControls {
        offset_missing: bool,
        resume: Vec<String>,
        resume_offset: Vec<String>,
        reject_offset: bool,
    }

    impl ResumeControls for FakeControls {
        fn resume_offset_supported(&self) -> Result<bool> {
            Ok(!self.offset_missing)
        }

        fn write_resume(&mut self, value: &str) -> Result<()> {
            self.resume.push(value.to_string());
            Ok(())
        }

        fn write_resume_offset(&mut self, value: &str) -> Result<()> {
            if self.reject_offset {
                return Err(SleepError::ControlWriteError {
                    path: "resume_offset".to_string(),
                    token: value.to_string(),
                    source: io::Error::from_raw_os_error(libc::EINVAL),
                }
                .into());
            }
            self.resume_offset.push(value.to_string());
            Ok(())
        }
    }

    struct FakeProbe {
        physical: u64,
        device_number: u64,
        calls: Cell<usize>,
    }

    impl FakeProbe {
        fn new(physical: u64, device_number: u64) -> Self {
            FakeProbe {
                physical,
                device_number,
                calls: Cell::new(0),
            }
        }
    }

    impl BackingProbe for FakeProbe {
        fn probe(&self, path: &Path) -> Result<SwapFileBacking> {
            self.calls.set(self.calls.get() + 1);
            let extent = Extent {
                logical: 0,
                physical: self.physical,
                length: 0x100000,
                flags: 0,
            };
            Ok(SwapFileBacking {
                extents: ExtentMap::new(path, 1, vec![extent])?,
                device_number: self.device_number,
            })
        }
    }

    fn location(device: &str, kind: LocationKind) -> HibernationLocation {
        HibernationLocation {
            device: PathBuf::from(device),
            kind,
            uuid: None,
            size: 1024,
            used: 0,
        }
    }

    #[test]
    fn test_partition_writes_only_device() {
        let mut controls = FakeControls::default();
        let probe = FakeProbe::new(0, 0);
        write_hibernate_location(
            &mut controls,
            &probe,
            &location("/dev/sda2", LocationKind::Partition),
            Some("123"),
            4096,
        )
        .unwrap();
        assert_eq!(controls.resume, vec!["/dev/sda2"]);
        assert!(controls.resume_offset.is_empty());
        assert_eq!(probe.calls.get(), 0);
    }

    #[test]
    fn test_file_offset_in_pages() {
        let mut controls = FakeControls::default();
        let probe = FakeProbe::new(0x2200000, 0x803);
        write_hibernate_location(
            &mut controls,
            &probe,
            &location("/swapfile", LocationKind::File),
            None,
            4096,
        )
        .unwrap();
        assert_eq!(controls.resume_offset, vec!["8704"]);
        assert_eq!(controls.resume, vec!["803"]);
    }

    #[test]
    fn test_override_used_verbatim() {
        let mut controls = FakeControls::default();
        let probe = FakeProbe::new(0x2200000, 0x803);
        write_hibernate_location(
            &mut controls,
            &probe,
            &location("/swapfile", LocationKind::File),
            Some("12345"),
            4096,
        )
        .unwrap();
        assert_eq!(controls.resume_offset, vec!["12345"]);
        assert_eq!(controls.resume, vec!["803"]);
    }

    #[test]
    fn test_old_kernel_skips_offset() {
        let mut controls = FakeControls {
            offset_missing: true,
            ..Default::default()
        };
        let probe = FakeProbe::new(0x2200000, 0x803);
        write_hibernate_location(
            &mut controls,
            &probe,
            &location("/swapfile", LocationKind::File),
            None,
            4096,
        )
        .unwrap();
        assert!(controls.resume_offset.is_empty());
        assert!(controls.resume.is_empty());
        assert_eq!(probe.calls.get(), 0);
    }

    #[test]
    fn test_offset_failure_stops_before_device() {
        let mut controls = FakeControls {
            reject_offset: true,
            ..Default::default()
        };
        let probe = FakeProbe::new(0x2200000, 0x803);
        let err = write_hibernate_location(
            &mut controls,
            &probe,
            &location("/swapfile", LocationKind::File),
            None,
            4096,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SleepError>(),
            Some(SleepError::ControlWriteError { .. })
        ));
        assert!(controls.resume.is_empty());
    }

    #[test]
    fn test_other_kind_rejected() {
        let mut controls = FakeControls::default();
        let probe = FakeProbe::new(0, 0);
        let err = write_hibernate_location(
            &mut controls,
            &probe,
            &location("/dev/x", LocationKind::Other("zswap".to_string())),
            None,
            4096,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SleepError>(),
            Some(SleepError::InvalidConfiguration(_))
        ));
        assert!(controls.resume.is_empty());
    }

    #[test]
    fn test_missing_swap_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FiemapProbe.probe(&dir.path().join("swapfile")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SleepError>(),
            Some(SleepError::ResourceUnavailable(_, _))
        ));
    }
}
