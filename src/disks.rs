//! Block device probing and discovery.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use serde::Serialize;

use crate::error::InstallError;

/// One candidate target device. Owned by a single pipeline run for its whole
/// lifetime; callers must not start two runs against the same device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceTarget {
    pub path: PathBuf,
    pub size: ByteSize,
    pub removable: bool,
    pub model: Option<String>,
}

impl DeviceTarget {
    /// Probe a device node: verify it is a block device and read capacity and
    /// the removable flag from sysfs.
    #[tracing::instrument]
    pub fn probe(path: &Path) -> Result<Self, InstallError> {
        let meta = std::fs::metadata(path).map_err(|e| {
            InstallError::Validation(format!("target device {} not accessible: {e}", path.display()))
        })?;
        if !meta.file_type().is_block_device() {
            return Err(InstallError::Validation(format!(
                "{} is not a block device",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                InstallError::Validation(format!("invalid device path {}", path.display()))
            })?
            .to_owned();

        let sectors = sysfs_u64(&format!("/sys/class/block/{name}/size")).ok_or_else(|| {
            InstallError::Validation(format!("cannot determine capacity of {}", path.display()))
        })?;
        let removable = sysfs_u64(&format!("/sys/block/{name}/removable")) == Some(1);
        let model = std::fs::read_to_string(format!("/sys/block/{name}/device/model"))
            .ok()
            .map(|m| m.trim().to_owned())
            .filter(|m| !m.is_empty());

        Ok(Self {
            path: path.to_owned(),
            size: ByteSize(sectors * 512),
            removable,
            model,
        })
    }
}

fn sysfs_u64(path: &str) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Scan the system for removable whole disks, the usual install targets.
pub fn list_removable() -> color_eyre::Result<Vec<DeviceTarget>> {
    let mut found = Vec::new();
    for dev in lsblk::BlockDevice::list()? {
        if dev.is_part() {
            continue;
        }
        let path = PathBuf::from(format!("/dev/{}", dev.name));
        match DeviceTarget::probe(&path) {
            Ok(target) if target.removable => found.push(target),
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping {}: {e}", path.display()),
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_file_is_not_a_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = DeviceTarget::probe(file.path()).unwrap_err();
        assert_eq!(err.kind(), "validation-error");
        assert!(err.to_string().contains("not a block device"));
    }

    #[test]
    fn missing_node_is_reported() {
        let err = DeviceTarget::probe(Path::new("/dev/does-not-exist-sdz")).unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }
}
