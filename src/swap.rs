// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Find where a hibernation image can be written, based on active swap.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{debug, warn};

use crate::sleeputil::SleepError;

/// Path of the active swap table, relative to the system root.
pub const PROC_SWAPS: &str = "proc/swaps";
/// Directory of filesystem UUID links, relative to the system root.
const DEV_DISK_BY_UUID: &str = "dev/disk/by-uuid";

/// How the swap space backing a hibernation image is laid out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocationKind {
    /// A whole block device.
    Partition,
    /// A file on a mounted filesystem.
    File,
    /// Anything the kernel reports that is neither of the above.
    Other(String),
}

impl From<&str> for LocationKind {
    fn from(kind: &str) -> Self {
        match kind {
            "partition" => LocationKind::Partition,
            "file" => LocationKind::File,
            other => LocationKind::Other(other.to_string()),
        }
    }
}

/// Where the hibernation image goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HibernationLocation {
    pub device: PathBuf,
    pub kind: LocationKind,
    /// Filesystem UUID of the device, when it could be determined.
    pub uuid: Option<String>,
    /// Size of the swap area in KiB.
    pub size: u64,
    /// Swap in use, in KiB.
    pub used: u64,
}

/// Decode the octal escapes (like `\040` for a space) the kernel uses for
/// names in /proc/swaps.
fn unescape_octal(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Pick the hibernation location from the contents of /proc/swaps. The first
/// usable entry wins.
pub fn find_hibernate_location(swaps: &str) -> Result<HibernationLocation> {
    for (i, line) in swaps.lines().enumerate().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }

        if fields.len() < 4 {
            warn!("Failed to parse {}:{}", PROC_SWAPS, i + 1);
            continue;
        }

        let (size, used) = match (fields[2].parse::<u64>(), fields[3].parse::<u64>()) {
            (Ok(size), Ok(used)) => (size, used),
            _ => {
                warn!("Failed to parse {}:{}", PROC_SWAPS, i + 1);
                continue;
            }
        };

        let name = fields[0];
        let kind = LocationKind::from(fields[1]);
        match kind {
            LocationKind::File => {
                if name.ends_with("\\040(deleted)") {
                    warn!("Ignoring deleted swapfile '{}'", name);
                    continue;
                }
            }
            LocationKind::Partition => {
                if name.starts_with("/dev/zram") {
                    debug!("Ignoring compressed RAM swap device '{}'", name);
                    continue;
                }
            }
            LocationKind::Other(_) => {}
        }

        return Ok(HibernationLocation {
            device: PathBuf::from(unescape_octal(name)),
            kind,
            uuid: None,
            size,
            used,
        });
    }

    Err(SleepError::NoSwapError().into())
}

/// Look up the filesystem UUID of a block device through the udev symlinks
/// below `root`. Returns None if there is no link for the device.
pub fn uuid_for_device(root: &Path, device: &Path) -> Option<String> {
    let device = fs::canonicalize(device).unwrap_or_else(|_| device.to_path_buf());
    let entries = fs::read_dir(root.join(DEV_DISK_BY_UUID)).ok()?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let link = entry.path();
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(_) => continue,
        };

        let target = match link.parent() {
            Some(parent) if target.is_relative() => parent.join(target),
            _ => target,
        };

        let target = fs::canonicalize(&target).unwrap_or(target);
        if target == device {
            return Some(entry.file_name().to_string_lossy().into_owned());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n";

    fn swaps(lines: &[&str]) -> String {
        let mut s = HEADER.to_string();
        for line in lines {
            s.push_str(line);
            s.push('\n');
        }
        s
    }

    #[test]
    fn test_partition() {
        let location =
            find_hibernate_location(&swaps(&["/dev/sda2  partition  8388604  0  -2"])).unwrap();
        assert_eq!(location.device, PathBuf::from("/dev/sda2"));
        assert_eq!(location.kind, LocationKind::Partition);
        assert_eq!(location.size, 8388604);
        assert_eq!(location.used, 0);
    }

    #[test]
    fn test_skips_zram_and_deleted_files() {
        let contents = swaps(&[
            "/dev/zram0  partition  4194300  1024  100",
            "/old\\040swap\\040(deleted)  file  1024  0  -2",
            "/swap\\040file  file  2097148  512  -3",
        ]);
        let location = find_hibernate_location(&contents).unwrap();
        assert_eq!(location.device, PathBuf::from("/swap file"));
        assert_eq!(location.kind, LocationKind::File);
        assert_eq!(location.used, 512);
    }

    #[test]
    fn test_skips_malformed_lines() {
        let contents = swaps(&["/dev/sda2 partition", "/swapfile file 1024 0 -2"]);
        let location = find_hibernate_location(&contents).unwrap();
        assert_eq!(location.device, PathBuf::from("/swapfile"));
    }

    #[test]
    fn test_other_kind_is_reported() {
        let location = find_hibernate_location(&swaps(&["/dev/x  weird  1  0  -2"])).unwrap();
        assert_eq!(location.kind, LocationKind::Other("weird".to_string()));
    }

    #[test]
    fn test_no_swap() {
        let err = find_hibernate_location(HEADER).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SleepError>(),
            Some(SleepError::NoSwapError())
        ));
    }

    #[test]
    fn test_unescape_octal() {
        assert_eq!(unescape_octal("/a\\040b"), "/a b");
        assert_eq!(unescape_octal("/plain"), "/plain");
        assert_eq!(unescape_octal("/trailing\\04"), "/trailing\\04");
    }

    #[test]
    fn test_uuid_for_device() {
        let root = tempfile::tempdir().unwrap();
        let dev = root.path().join("dev");
        let by_uuid = root.path().join(DEV_DISK_BY_UUID);
        fs::create_dir_all(&by_uuid).unwrap();
        fs::write(dev.join("sda2"), b"").unwrap();
        std::os::unix::fs::symlink("../../sda2", by_uuid.join("1234-abcd")).unwrap();

        assert_eq!(
            uuid_for_device(root.path(), &dev.join("sda2")),
            Some("1234-abcd".to_string())
        );
        assert_eq!(uuid_for_device(root.path(), &dev.join("sdb1")), None);
    }
}
