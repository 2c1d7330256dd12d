//! Partition layout planning. Pure computation — nothing here touches the
//! device.

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::consts::{MIN_DATA_SIZE, UEFI_BRIDGE_SIZE};
use crate::error::InstallError;
use crate::filesystems::FsKind;
use crate::request::BootMode;

/// Alignment and partition-table overhead reserved out of the capacity math
/// (1 MiB leading gap plus the GPT backup header).
const TABLE_SLACK: ByteSize = ByteSize::mib(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableScheme {
    Mbr,
    Gpt,
}

impl TableScheme {
    pub const fn parted_label(self) -> &'static str {
        match self {
            Self::Mbr => "msdos",
            Self::Gpt => "gpt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    Bytes(u64),
    /// All space not claimed by fixed-size partitions.
    Remaining,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionFlags {
    pub boot: bool,
    pub esp: bool,
    pub msft_reserved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    /// Firmware-readable partition carrying the UEFI boot stub (or, for
    /// Windows-To-Go, the ESP proper). Always first when present.
    UefiBridge,
    Data,
    Persistence,
}

#[derive(Debug, Clone)]
pub struct PartitionSpec {
    pub role: PartitionRole,
    pub size: PartitionSize,
    /// Filesystem type string for the partition-table tool.
    pub type_hint: &'static str,
    pub flags: PartitionFlags,
    /// GPT partition name; ignored for MBR.
    pub name: &'static str,
}

#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub scheme: TableScheme,
    pub partitions: Vec<PartitionSpec>,
    /// Non-fatal notes, e.g. a clipped persistence request.
    pub warnings: Vec<String>,
}

impl PartitionPlan {
    pub fn index_of(&self, role: PartitionRole) -> Option<usize> {
        self.partitions.iter().position(|p| p.role == role)
    }

    /// 1-based partition number for a role, as the kernel names device nodes.
    pub fn partition_number(&self, role: PartitionRole) -> Option<usize> {
        self.index_of(role).map(|i| i + 1)
    }
}

/// Compute the partition layout for one installation.
///
/// Rules: the bridge partition is prepended when the boot mode includes UEFI
/// and the chosen filesystem is not firmware-readable, or always for
/// Windows-To-Go (where it doubles as the ESP). The data partition takes all
/// remaining space. A persistence partition, when requested, is appended and
/// clipped to what the device can spare, with a warning rather than an error.
pub fn compute(
    variant: FsKind,
    boot_mode: BootMode,
    windows_to_go: bool,
    persistence: Option<ByteSize>,
    capacity: ByteSize,
) -> Result<PartitionPlan, InstallError> {
    if windows_to_go && persistence.is_some() {
        return Err(InstallError::Validation(
            "persistence cannot be combined with Windows-To-Go".into(),
        ));
    }

    let scheme = if windows_to_go || boot_mode == BootMode::Uefi {
        TableScheme::Gpt
    } else {
        TableScheme::Mbr
    };

    let bridge = windows_to_go || (boot_mode.wants_uefi() && variant.requires_uefi_bridge());
    let mut warnings = Vec::new();
    let mut partitions = Vec::new();

    let mut fixed = TABLE_SLACK.as_u64();
    if bridge {
        fixed += UEFI_BRIDGE_SIZE.as_u64();
        partitions.push(PartitionSpec {
            role: PartitionRole::UefiBridge,
            size: PartitionSize::Bytes(UEFI_BRIDGE_SIZE.as_u64()),
            // fat16: FAT32 has a minimum size well above the bridge constant
            type_hint: "fat16",
            flags: PartitionFlags {
                boot: true,
                esp: true,
                msft_reserved: false,
            },
            name: "ESP",
        });
    }

    if capacity.as_u64() < fixed + MIN_DATA_SIZE.as_u64() {
        return Err(InstallError::Validation(format!(
            "device too small: {capacity} cannot hold {} of fixed partitions plus at least \
             {MIN_DATA_SIZE} of data",
            ByteSize(fixed)
        )));
    }

    partitions.push(PartitionSpec {
        role: PartitionRole::Data,
        size: PartitionSize::Remaining,
        type_hint: variant.partition_type_hint(),
        flags: PartitionFlags::default(),
        name: if windows_to_go { "Windows" } else { "Data" },
    });

    if let Some(requested) = persistence {
        let available = capacity.as_u64() - fixed - MIN_DATA_SIZE.as_u64();
        let granted = requested.as_u64().min(available);
        if granted < requested.as_u64() {
            warnings.push(format!(
                "persistence request of {requested} clipped to {} to fit the device",
                ByteSize(granted)
            ));
        }
        partitions.push(PartitionSpec {
            role: PartitionRole::Persistence,
            size: PartitionSize::Bytes(granted),
            type_hint: "ext4",
            flags: PartitionFlags::default(),
            name: "persistence",
        });
    }

    Ok(PartitionPlan {
        scheme,
        partitions,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_total(plan: &PartitionPlan) -> u64 {
        plan.partitions
            .iter()
            .filter_map(|p| match p.size {
                PartitionSize::Bytes(n) => Some(n),
                PartitionSize::Remaining => None,
            })
            .sum()
    }

    #[test]
    fn bridge_iff_required_and_always_first() {
        for kind in crate::filesystems::ALL {
            let plan = compute(kind, BootMode::Both, false, None, ByteSize::gib(16)).unwrap();
            let bridges = plan
                .partitions
                .iter()
                .filter(|p| p.role == PartitionRole::UefiBridge)
                .count();
            if kind.requires_uefi_bridge() {
                assert_eq!(bridges, 1, "{kind} should plan a bridge");
                assert_eq!(plan.index_of(PartitionRole::UefiBridge), Some(0));
            } else {
                assert_eq!(bridges, 0, "{kind} should not plan a bridge");
            }
        }
    }

    #[test]
    fn legacy_only_boot_needs_no_bridge() {
        let plan = compute(FsKind::Ntfs, BootMode::Legacy, false, None, ByteSize::gib(16)).unwrap();
        assert!(plan.index_of(PartitionRole::UefiBridge).is_none());
        assert_eq!(plan.scheme, TableScheme::Mbr);
    }

    #[test]
    fn wintogo_on_8gib_is_bridge_plus_remaining() {
        let plan = compute(FsKind::Ntfs, BootMode::Both, true, None, ByteSize::gib(8)).unwrap();
        assert_eq!(plan.scheme, TableScheme::Gpt);
        assert_eq!(plan.partitions.len(), 2);
        assert_eq!(plan.partitions[0].role, PartitionRole::UefiBridge);
        assert_eq!(
            plan.partitions[0].size,
            PartitionSize::Bytes(UEFI_BRIDGE_SIZE.as_u64())
        );
        assert_eq!(plan.partitions[1].role, PartitionRole::Data);
        assert_eq!(plan.partitions[1].size, PartitionSize::Remaining);
        assert!(plan.partitions[0].flags.esp && plan.partitions[0].flags.boot);
    }

    #[test]
    fn fixed_sizes_never_exceed_capacity() {
        for capacity in [ByteSize::gib(2), ByteSize::gib(8), ByteSize::gib(64)] {
            let plan = compute(
                FsKind::F2fs,
                BootMode::Both,
                false,
                Some(ByteSize::gib(4)),
                capacity,
            )
            .unwrap();
            assert!(fixed_total(&plan) <= capacity.as_u64());
            let remaining = plan
                .partitions
                .iter()
                .filter(|p| p.size == PartitionSize::Remaining)
                .count();
            assert_eq!(remaining, 1);
        }
    }

    #[test]
    fn oversized_persistence_is_clipped_with_warning() {
        let plan = compute(
            FsKind::Btrfs,
            BootMode::Both,
            false,
            Some(ByteSize::gib(100)),
            ByteSize::gib(8),
        )
        .unwrap();
        assert_eq!(plan.warnings.len(), 1);
        let spec = &plan.partitions[plan.index_of(PartitionRole::Persistence).unwrap()];
        let PartitionSize::Bytes(granted) = spec.size else {
            panic!("persistence must be fixed-size");
        };
        assert!(granted < ByteSize::gib(100).as_u64());
        assert!(fixed_total(&plan) + MIN_DATA_SIZE.as_u64() <= ByteSize::gib(8).as_u64());
    }

    #[test]
    fn tiny_device_is_rejected() {
        let err = compute(
            FsKind::Fat32,
            BootMode::Both,
            false,
            None,
            ByteSize::mib(512),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn wintogo_with_persistence_is_rejected() {
        let err = compute(
            FsKind::Ntfs,
            BootMode::Both,
            true,
            Some(ByteSize::gib(1)),
            ByteSize::gib(32),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }
}
