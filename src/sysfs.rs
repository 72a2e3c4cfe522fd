// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implement access to the kernel's power management control files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use nix::errno::Errno;
use nix::unistd::{access, AccessFlags};

use crate::executor::PowerInterface;
use crate::location::{write_hibernate_location, FiemapProbe, ResumeControls};
use crate::sequencer;
use crate::sleeputil::{get_page_size, SleepError};
use crate::swap::{find_hibernate_location, uuid_for_device, HibernationLocation, LocationKind};
use crate::swap::PROC_SWAPS;

/// Directory of the power controls, relative to the system root.
pub const SYS_POWER_DIR: &str = "sys/power";
const STATE_FILE: &str = "state";
const DISK_FILE: &str = "disk";
const RESUME_FILE: &str = "resume";
const RESUME_OFFSET_FILE: &str = "resume_offset";

/// Something a sleep token can be written to.
pub trait ControlSurface {
    /// Write a single token. After a rejected token the surface is ready for
    /// the next attempt, or the error is `CannotOpenControl` and it is not.
    fn write_token(&mut self, token: &str) -> Result<()>;
}

fn open_control(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| SleepError::CannotOpenControl(path.display().to_string(), e).into())
}

/// An open, unbuffered control file. Every token goes out in a single
/// write(2), which is what sysfs attributes expect.
pub struct ControlFile {
    path: PathBuf,
    file: File,
    reopen_on_reject: bool,
}

impl ControlFile {
    /// Open a control file that tolerates repeated writes on one handle.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(ControlFile {
            path: path.to_path_buf(),
            file: open_control(path)?,
            reopen_on_reject: false,
        })
    }

    /// Open a control file whose handle is unusable after a rejected write,
    /// like the power state. The handle is replaced after each rejection.
    pub fn open_reopening(path: &Path) -> Result<Self> {
        Ok(ControlFile {
            reopen_on_reject: true,
            ..Self::open(path)?
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ControlSurface for ControlFile {
    fn write_token(&mut self, token: &str) -> Result<()> {
        let source = match self.file.write(token.as_bytes()) {
            Ok(n) if n == token.len() => return Ok(()),
            Ok(n) => io::Error::new(
                io::ErrorKind::WriteZero,
                format!("wrote {} of {} bytes", n, token.len()),
            ),
            Err(e) => e,
        };

        let err = SleepError::ControlWriteError {
            path: self.path.display().to_string(),
            token: token.to_string(),
            source,
        };

        if self.reopen_on_reject {
            self.file = open_control(&self.path)?;
        }

        Err(err.into())
    }
}

fn write_control(path: &Path, value: &str) -> Result<()> {
    ControlFile::open(path)?.write_token(value)
}

/// The kernel's power controls below a system root, normally "/".
pub struct SysPower {
    root: PathBuf,
    resume_offset: Option<String>,
}

impl SysPower {
    /// Use the live system, with an optional resume offset override.
    pub fn new(resume_offset: Option<String>) -> Self {
        Self::with_root("/", resume_offset)
    }

    pub fn with_root<P: Into<PathBuf>>(root: P, resume_offset: Option<String>) -> Self {
        SysPower {
            root: root.into(),
            resume_offset,
        }
    }

    fn control_path(&self, name: &str) -> PathBuf {
        self.root.join(SYS_POWER_DIR).join(name)
    }

    /// Find where the hibernation image goes, based on active swap.
    pub fn hibernate_location(&self) -> Result<HibernationLocation> {
        let swaps_path = self.root.join(PROC_SWAPS);
        let swaps = fs::read_to_string(&swaps_path)
            .map_err(|e| SleepError::ResourceUnavailable(swaps_path.display().to_string(), e))?;
        let mut location = find_hibernate_location(&swaps)?;
        if location.kind == LocationKind::Partition {
            location.uuid = uuid_for_device(&self.root, &location.device);
        }

        info!(
            "Hibernation location: {} ({:?}, uuid {}, {} KiB, {} KiB used)",
            location.device.display(),
            location.kind,
            location.uuid.as_deref().unwrap_or("unknown"),
            location.size,
            location.used
        );
        Ok(location)
    }
}

impl ResumeControls for SysPower {
    fn resume_offset_supported(&self) -> Result<bool> {
        let path = self.control_path(RESUME_OFFSET_FILE);
        match access(&path, AccessFlags::W_OK) {
            Ok(()) => Ok(true),
            Err(Errno::ENOENT) => Ok(false),
            Err(e) => Err(SleepError::ResourceUnavailable(
                format!("{} not writeable", path.display()),
                io::Error::from(e),
            )
            .into()),
        }
    }

    fn write_resume(&mut self, value: &str) -> Result<()> {
        write_control(&self.control_path(RESUME_FILE), value)
    }

    fn write_resume_offset(&mut self, value: &str) -> Result<()> {
        write_control(&self.control_path(RESUME_OFFSET_FILE), value)
    }
}

impl PowerInterface for SysPower {
    type StateControl = ControlFile;

    fn open_state_control(&mut self) -> Result<ControlFile> {
        ControlFile::open_reopening(&self.control_path(STATE_FILE))
    }

    fn configure_hibernate_location(&mut self) -> Result<()> {
        let location = self
            .hibernate_location()
            .context("Unable to find hibernation location")?;
        let resume_offset = self.resume_offset.clone();
        write_hibernate_location(
            self,
            &FiemapProbe,
            &location,
            resume_offset.as_deref(),
            get_page_size() as u64,
        )
    }

    fn write_mode(&mut self, modes: &[String]) -> Result<()> {
        if modes.is_empty() {
            return Ok(());
        }

        let mut disk = ControlFile::open(&self.control_path(DISK_FILE))?;
        debug!("Writing disk mode to {}", disk.path().display());
        sequencer::write_mode(&mut disk, modes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup_sys_power(root: &Path, files: &[&str]) {
        let dir = root.join(SYS_POWER_DIR);
        fs::create_dir_all(&dir).unwrap();
        for file in files {
            fs::write(dir.join(file), b"").unwrap();
        }
    }

    fn read_control(root: &Path, name: &str) -> String {
        fs::read_to_string(root.join(SYS_POWER_DIR).join(name)).unwrap()
    }

    fn write_swaps(root: &Path, line: &str) {
        fs::create_dir_all(root.join("proc")).unwrap();
        fs::write(
            root.join(PROC_SWAPS),
            format!("Filename Type Size Used Priority\n{}\n", line),
        )
        .unwrap();
    }

    #[test]
    fn test_control_file_write() {
        let dir = tempdir().unwrap();
        setup_sys_power(dir.path(), &[STATE_FILE]);
        let mut control =
            ControlFile::open(&dir.path().join(SYS_POWER_DIR).join(STATE_FILE)).unwrap();
        control.write_token("mem").unwrap();
        assert_eq!(read_control(dir.path(), STATE_FILE), "mem");
    }

    #[test]
    fn test_control_file_missing() {
        let dir = tempdir().unwrap();
        let err = ControlFile::open(&dir.path().join("state")).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SleepError>(),
            Some(SleepError::CannotOpenControl(_, _))
        ));
    }

    #[test]
    fn test_rejected_write_reopens() {
        // /dev/full rejects every write with ENOSPC.
        let mut control = ControlFile::open_reopening(Path::new("/dev/full")).unwrap();
        for token in ["mem", "freeze"] {
            let err = control.write_token(token).unwrap_err();
            match err.downcast_ref::<SleepError>() {
                Some(SleepError::ControlWriteError { token: t, source, .. }) => {
                    assert_eq!(t, token);
                    assert_eq!(source.raw_os_error(), Some(libc::ENOSPC));
                }
                e => panic!("Unexpected error {:?}", e),
            }
        }
    }

    #[test]
    fn test_rejected_write_uses_new_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let repoint = |target: &Path| {
            let _ = fs::remove_file(&path);
            std::os::unix::fs::symlink(target, &path).unwrap();
        };

        // Once the first handle is rejected, the control is opened again and
        // now resolves to a missing file.
        repoint(Path::new("/dev/full"));
        let mut control = ControlFile::open_reopening(&path).unwrap();
        repoint(&dir.path().join("missing"));
        let err = control.write_token("mem").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SleepError>(),
            Some(SleepError::CannotOpenControl(_, _))
        ));

        // Without reopening, the rejection itself is reported.
        repoint(Path::new("/dev/full"));
        let mut control = ControlFile::open(&path).unwrap();
        repoint(&dir.path().join("missing"));
        let err = control.write_token("mem").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SleepError>(),
            Some(SleepError::ControlWriteError { .. })
        ));
    }

    #[test]
    fn test_resume_offset_supported() {
        let dir = tempdir().unwrap();
        setup_sys_power(dir.path(), &[RESUME_FILE]);
        let power = SysPower::with_root(dir.path(), None);
        assert!(!power.resume_offset_supported().unwrap());

        setup_sys_power(dir.path(), &[RESUME_OFFSET_FILE]);
        assert!(power.resume_offset_supported().unwrap());
    }

    #[test]
    fn test_partition_location_configured() {
        let dir = tempdir().unwrap();
        setup_sys_power(dir.path(), &[RESUME_FILE, RESUME_OFFSET_FILE]);
        write_swaps(dir.path(), "/dev/sda2 partition 8388604 0 -2");

        let mut power = SysPower::with_root(dir.path(), Some("99".to_string()));
        power.configure_hibernate_location().unwrap();
        assert_eq!(read_control(dir.path(), RESUME_FILE), "/dev/sda2");
        assert_eq!(read_control(dir.path(), RESUME_OFFSET_FILE), "");
    }

    #[test]
    fn test_missing_swaps() {
        let dir = tempdir().unwrap();
        setup_sys_power(dir.path(), &[RESUME_FILE]);
        let mut power = SysPower::with_root(dir.path(), None);
        let err = power.configure_hibernate_location().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SleepError>(),
            Some(SleepError::ResourceUnavailable(_, _))
        ));
        assert_eq!(read_control(dir.path(), RESUME_FILE), "");
    }

    #[test]
    fn test_write_mode() {
        let dir = tempdir().unwrap();
        setup_sys_power(dir.path(), &[DISK_FILE]);
        let mut power = SysPower::with_root(dir.path(), None);
        power
            .write_mode(&["platform".to_string(), "shutdown".to_string()])
            .unwrap();
        assert_eq!(read_control(dir.path(), DISK_FILE), "platform");
    }

    #[test]
    fn test_empty_mode_list_leaves_disk_alone() {
        let dir = tempdir().unwrap();
        let mut power = SysPower::with_root(dir.path(), None);
        // No disk control exists, so any attempt to open it would fail.
        power.write_mode(&[]).unwrap();
    }

    #[test]
    fn test_open_state_control() {
        let dir = tempdir().unwrap();
        let mut power = SysPower::with_root(dir.path(), None);
        let err = power.open_state_control().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SleepError>(),
            Some(SleepError::CannotOpenControl(_, _))
        ));

        setup_sys_power(dir.path(), &[STATE_FILE]);
        assert!(power.open_state_control().is_ok());
    }
}
