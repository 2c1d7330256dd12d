//! Input types handed to the engine by external callers (CLI, GUI).

use std::path::PathBuf;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::filesystems::FsKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    /// Installation image (ISO, loop-mounted read-only) or an already
    /// extracted directory tree.
    pub source: PathBuf,
    /// Whole block device to install to, e.g. `/dev/sdb`.
    pub target_device: PathBuf,
    #[serde(default)]
    pub filesystem: FsChoice,
    #[serde(default)]
    pub boot_mode: BootMode,
    #[serde(default)]
    pub windows_to_go: bool,
    /// Size of an optional trailing persistence partition.
    #[serde(default)]
    pub persistence: Option<ByteSize>,
    #[serde(default)]
    pub label: Option<String>,
    /// Skip the legacy GRUB installation entirely.
    #[serde(default)]
    pub skip_legacy_bootloader: bool,
    /// Toggle the MBR boot flag for firmware that refuses to boot without it.
    #[serde(default)]
    pub force_boot_flag: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsChoice {
    #[default]
    Auto,
    Fat32,
    Ntfs,
    Exfat,
    F2fs,
    Btrfs,
}

impl FsChoice {
    /// `None` means auto-select from the source content and available tools.
    pub const fn kind(self) -> Option<FsKind> {
        match self {
            Self::Auto => None,
            Self::Fat32 => Some(FsKind::Fat32),
            Self::Ntfs => Some(FsKind::Ntfs),
            Self::Exfat => Some(FsKind::Exfat),
            Self::F2fs => Some(FsKind::F2fs),
            Self::Btrfs => Some(FsKind::Btrfs),
        }
    }
}

impl From<FsKind> for FsChoice {
    fn from(kind: FsKind) -> Self {
        match kind {
            FsKind::Fat32 => Self::Fat32,
            FsKind::Ntfs => Self::Ntfs,
            FsKind::Exfat => Self::Exfat,
            FsKind::F2fs => Self::F2fs,
            FsKind::Btrfs => Self::Btrfs,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Legacy,
    Uefi,
    #[default]
    Both,
}

impl BootMode {
    pub const fn wants_uefi(self) -> bool {
        matches!(self, Self::Uefi | Self::Both)
    }

    pub const fn wants_legacy(self) -> bool {
        matches!(self, Self::Legacy | Self::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_request_fills_defaults() {
        let req: InstallRequest = serde_json::from_str(
            r#"{"source": "/tmp/win11.iso", "target_device": "/dev/sdz"}"#,
        )
        .unwrap();
        assert_eq!(req.filesystem, FsChoice::Auto);
        assert_eq!(req.boot_mode, BootMode::Both);
        assert!(!req.windows_to_go);
        assert!(req.persistence.is_none());
    }

    #[test]
    fn persistence_accepts_human_sizes() {
        let req: InstallRequest = serde_json::from_str(
            r#"{"source": "/a", "target_device": "/dev/sdz", "persistence": "512 MiB",
                "filesystem": "f2fs", "boot_mode": "legacy"}"#,
        )
        .unwrap();
        assert_eq!(req.persistence, Some(ByteSize::mib(512)));
        assert_eq!(req.filesystem.kind(), Some(FsKind::F2fs));
        assert!(!req.boot_mode.wants_uefi());
    }
}
