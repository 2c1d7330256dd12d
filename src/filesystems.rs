//! Filesystem capability registry, dependency probing and selection.
//!
//! The set of supported filesystems is closed and small, so capabilities are
//! pure functions over an enum rather than trait objects.

use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::error::InstallError;

/// Largest file a FAT32 filesystem can hold.
pub const FAT32_MAX_FILE_SIZE: ByteSize = ByteSize(4 * 1024 * 1024 * 1024 - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Fat32,
    Ntfs,
    Exfat,
    F2fs,
    Btrfs,
}

pub const ALL: [FsKind; 5] = [
    FsKind::Fat32,
    FsKind::Ntfs,
    FsKind::Exfat,
    FsKind::F2fs,
    FsKind::Btrfs,
];

/// Preference order when the source contains files FAT32 cannot hold.
const LARGE_FILE_PREFERENCE: [FsKind; 4] =
    [FsKind::Exfat, FsKind::Ntfs, FsKind::F2fs, FsKind::Btrfs];

impl FsKind {
    pub fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "FAT" | "FAT32" => Some(Self::Fat32),
            "NTFS" => Some(Self::Ntfs),
            "EXFAT" => Some(Self::Exfat),
            "F2FS" => Some(Self::F2fs),
            "BTRFS" => Some(Self::Btrfs),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Fat32 => "FAT32",
            Self::Ntfs => "NTFS",
            Self::Exfat => "exFAT",
            Self::F2fs => "F2FS",
            Self::Btrfs => "BTRFS",
        }
    }

    /// `None` means unbounded (for any file that fits on the partition).
    pub const fn max_single_file_size(self) -> Option<ByteSize> {
        match self {
            Self::Fat32 => Some(FAT32_MAX_FILE_SIZE),
            _ => None,
        }
    }

    pub const fn supports_large_files(self) -> bool {
        self.max_single_file_size().is_none()
    }

    /// The filesystem type string understood by `parted mkpart`.
    pub const fn partition_type_hint(self) -> &'static str {
        match self {
            Self::Fat32 | Self::Exfat => "fat32",
            Self::Ntfs => "ntfs",
            // parted has no f2fs type; the partition id is what matters
            Self::F2fs => "ext4",
            Self::Btrfs => "btrfs",
        }
    }

    /// Whether firmware needs a separate FAT bridge partition to boot a drive
    /// formatted with this filesystem. Only FAT is readable natively.
    pub const fn requires_uefi_bridge(self) -> bool {
        !matches!(self, Self::Fat32)
    }

    pub const fn required_tool(self) -> &'static str {
        match self {
            Self::Fat32 => "mkdosfs",
            Self::Ntfs => "mkntfs",
            Self::Exfat => "mkfs.exfat",
            Self::F2fs => "mkfs.f2fs",
            Self::Btrfs => "mkfs.btrfs",
        }
    }

    /// Formatting arguments, minimal by intent: force, label, and the
    /// filesystem-specific size option where one matters.
    pub fn format_args(self, label: &str) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Fat32 => &["-F", "32", "-n", label],
            Self::Ntfs => &["-f", "-L", label],
            Self::Exfat => &["--volume-label", label, "--cluster-size=128K"],
            Self::F2fs => &["-f", "-l", label],
            Self::Btrfs => &["-f", "-L", label],
        };
        args.iter().map(ToString::to_string).collect()
    }
}

impl std::fmt::Display for FsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves external tools on an executable search path.
///
/// Built from `$PATH` in production; tests pass an explicit directory list so
/// availability is deterministic without touching the process environment.
#[derive(Debug, Clone)]
pub struct Prober {
    path: Vec<PathBuf>,
}

impl Prober {
    pub fn from_env() -> Self {
        let path = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self { path }
    }

    pub fn with_path(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            path: dirs.into_iter().collect(),
        }
    }

    /// Resolve a tool name to an executable regular file, if any.
    pub fn resolve(&self, tool: &str) -> Option<PathBuf> {
        self.path.iter().map(|dir| dir.join(tool)).find(|candidate| {
            std::fs::metadata(candidate)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
    }

    /// The set of filesystem variants whose formatting tool is present.
    /// Deliberately re-probed per call; tool availability is cheap to check
    /// and stale caches are worse.
    pub fn available(&self) -> BTreeSet<FsKind> {
        ALL.iter()
            .copied()
            .filter(|kind| self.resolve(kind.required_tool()).is_some())
            .collect()
    }
}

/// Pick the best variant for the source content and the host's tooling.
///
/// Small sources go to FAT32 for maximum firmware and OS compatibility.
/// Sources with ≥4 GiB files walk the large-file preference order. When no
/// large-file-capable tool exists, FAT32 is still returned: the copy will
/// fail on the oversized files *by name* rather than this call aborting the
/// whole run up front — partial success is worth more than none.
pub fn select_optimal(
    has_files_over_4gib: bool,
    available: &BTreeSet<FsKind>,
) -> Result<FsKind, InstallError> {
    if !has_files_over_4gib && available.contains(&FsKind::Fat32) {
        return Ok(FsKind::Fat32);
    }

    if let Some(kind) = LARGE_FILE_PREFERENCE
        .iter()
        .find(|kind| available.contains(kind))
    {
        return Ok(*kind);
    }

    if available.contains(&FsKind::Fat32) {
        if has_files_over_4gib {
            tracing::warn!(
                "source has files over {FAT32_MAX_FILE_SIZE}, but only FAT32 is available; \
                 oversized files will fail to copy"
            );
        }
        return Ok(FsKind::Fat32);
    }

    Err(InstallError::NoUsableFilesystem)
}
