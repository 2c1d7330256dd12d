//! Device operations backend: the only module that issues destructive
//! commands against a block device.
//!
//! Operations run strictly sequentially. Cancellation is checked immediately
//! before each destructive command — an in-flight command is never aborted,
//! but nothing further is issued after the flag is seen. Any non-zero tool
//! exit is a hard stop; a half-written partition table is left untouched for
//! inspection rather than retried blind.

use std::path::{Path, PathBuf};

use crate::consts::{ESP_LABEL, PARTITION_NODE_TIMEOUT, PERSISTENCE_LABEL};
use crate::error::{CommandError, InstallError};
use crate::filesystems::FsKind;
use crate::plan::{PartitionPlan, PartitionSize, PartitionSpec, TableScheme};
use crate::progress::PipelineRun;
use crate::util::cmd::run_command;
use crate::util::fs::partition_path;

const MIB: u64 = 1024 * 1024;

fn partition_err(device: &Path) -> impl FnOnce(CommandError) -> InstallError + '_ {
    move |source| InstallError::Partition {
        device: device.to_owned(),
        source,
    }
}

/// Clear old partition tables and filesystem signatures.
#[tracing::instrument(skip(run))]
pub fn wipe_signatures(run: &PipelineRun, device: &Path) -> Result<(), InstallError> {
    run.ensure_not_cancelled()?;
    tracing::info!("Wiping existing signatures on {}", device.display());
    let dev = device.to_string_lossy().into_owned();
    run_command("wipefs", ["--all", "--force", dev.as_str()])
        .map(drop)
        .map_err(partition_err(device))
}

#[tracing::instrument(skip(run))]
pub fn create_partition_table(
    run: &PipelineRun,
    device: &Path,
    scheme: TableScheme,
) -> Result<(), InstallError> {
    run.ensure_not_cancelled()?;
    tracing::info!("Creating {} partition table", scheme.parted_label());
    let dev = device.to_string_lossy().into_owned();
    run_command(
        "parted",
        ["--script", dev.as_str(), "mklabel", scheme.parted_label()],
    )
    .map(drop)
    .map_err(partition_err(device))
}

/// Partition boundaries as parted offset strings. Fixed partitions before the
/// `Remaining` one grow from a 1 MiB leading gap; the `Remaining` partition
/// stretches to the end, shortened by any trailing fixed partitions, which
/// are addressed with negative offsets from the device end.
fn partition_bounds(plan: &PartitionPlan) -> Vec<(String, String)> {
    let remaining_at = plan
        .partitions
        .iter()
        .position(|p| p.size == PartitionSize::Remaining);

    let trailing_mib: u64 = plan
        .partitions
        .iter()
        .skip(remaining_at.map_or(plan.partitions.len(), |i| i + 1))
        .filter_map(|p| match p.size {
            PartitionSize::Bytes(n) => Some(n.div_ceil(MIB)),
            PartitionSize::Remaining => None,
        })
        .sum();

    let mut bounds = Vec::with_capacity(plan.partitions.len());
    let mut cursor = 1u64; // MiB
    let mut tail = trailing_mib;
    let mut past_remaining = false;
    for spec in &plan.partitions {
        match spec.size {
            PartitionSize::Remaining => {
                let end = if tail == 0 {
                    "100%".to_owned()
                } else {
                    format!("-{}MiB", tail + 1)
                };
                bounds.push((format!("{cursor}MiB"), end));
                past_remaining = true;
            }
            PartitionSize::Bytes(n) => {
                let mib = n.div_ceil(MIB);
                if past_remaining {
                    bounds.push((format!("-{}MiB", tail + 1), format!("-{}MiB", tail + 1 - mib)));
                    tail -= mib;
                } else {
                    bounds.push((format!("{cursor}MiB"), format!("{}MiB", cursor + mib)));
                    cursor += mib;
                }
            }
        }
    }
    bounds
}

fn mkpart_args(scheme: TableScheme, spec: &PartitionSpec, start: &str, end: &str) -> Vec<String> {
    let mut args = vec!["mkpart".to_owned()];
    match scheme {
        TableScheme::Mbr => args.push("primary".to_owned()),
        TableScheme::Gpt => args.push(spec.name.to_owned()),
    }
    args.push(spec.type_hint.to_owned());
    args.push(start.to_owned());
    args.push(end.to_owned());
    args
}

fn flag_args(number: usize, spec: &PartitionSpec) -> Vec<[String; 4]> {
    let mut flags = Vec::new();
    let mut add = |flag: &str| {
        flags.push([
            "set".to_owned(),
            number.to_string(),
            flag.to_owned(),
            "on".to_owned(),
        ]);
    };
    if spec.flags.boot {
        add("boot");
    }
    if spec.flags.esp {
        add("esp");
    }
    if spec.flags.msft_reserved {
        add("msftres");
    }
    flags
}

/// Create all partitions of the plan in order and return their device nodes.
#[tracing::instrument(skip(run, plan))]
pub fn create_partitions(
    run: &PipelineRun,
    device: &Path,
    plan: &PartitionPlan,
) -> Result<Vec<PathBuf>, InstallError> {
    let device_str = device.to_string_lossy().into_owned();
    let bounds = partition_bounds(plan);

    for (index, (spec, (start, end))) in plan.partitions.iter().zip(&bounds).enumerate() {
        run.ensure_not_cancelled()?;
        let number = index + 1;
        tracing::info!(
            "Creating partition {number} ({}, {start}..{end})",
            spec.name
        );

        let mut args = vec!["--script".to_owned(), device_str.clone()];
        args.extend(mkpart_args(plan.scheme, spec, start, end));
        run_command("parted", &args).map_err(partition_err(device))?;

        for flag in flag_args(number, spec) {
            let mut args = vec!["--script".to_owned(), device_str.clone()];
            args.extend(flag);
            run_command("parted", &args).map_err(partition_err(device))?;
        }
    }

    // best effort: the kernel usually re-reads the table on its own
    if let Err(e) = run_command("partprobe", [device_str.as_str()]) {
        tracing::warn!("partprobe failed: {e}");
    }

    wait_for_nodes(device, plan.partitions.len())
}

/// Wait for the kernel to surface the partition device nodes.
fn wait_for_nodes(device: &Path, count: usize) -> Result<Vec<PathBuf>, InstallError> {
    let nodes: Vec<PathBuf> = (1..=count).map(|i| partition_path(device, i)).collect();
    let deadline = std::time::Instant::now() + PARTITION_NODE_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if nodes.iter().all(|n| n.exists()) {
            return Ok(nodes);
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    Err(InstallError::Partition {
        device: device.to_owned(),
        source: CommandError {
            tool: "partprobe".into(),
            code: None,
            stderr_tail: format!(
                "partition device nodes did not appear within {PARTITION_NODE_TIMEOUT:?}"
            ),
        },
    })
}

fn format_err(partition: &Path) -> impl FnOnce(CommandError) -> InstallError + '_ {
    move |source| InstallError::Format {
        partition: partition.to_owned(),
        source,
    }
}

/// Format one partition with the chosen filesystem.
#[tracing::instrument(skip(run))]
pub fn format_partition(
    run: &PipelineRun,
    partition: &Path,
    variant: FsKind,
    label: &str,
) -> Result<(), InstallError> {
    run.ensure_not_cancelled()?;
    tracing::info!("Creating {variant} filesystem on {}", partition.display());
    let mut args = variant.format_args(label);
    args.push(partition.to_string_lossy().into_owned());
    run_command(variant.required_tool(), &args)
        .map(drop)
        .map_err(format_err(partition))
}

/// The bridge partition is too small for FAT32; FAT16 is what firmware
/// expects there anyway.
#[tracing::instrument(skip(run))]
pub fn format_bridge(run: &PipelineRun, partition: &Path) -> Result<(), InstallError> {
    run.ensure_not_cancelled()?;
    tracing::info!("Creating FAT16 filesystem on {}", partition.display());
    let node = partition.to_string_lossy().into_owned();
    run_command("mkdosfs", ["-F", "16", "-n", ESP_LABEL, node.as_str()])
        .map(drop)
        .map_err(format_err(partition))
}

/// Persistence partitions are plain ext4.
#[tracing::instrument(skip(run))]
pub fn format_persistence(run: &PipelineRun, partition: &Path) -> Result<(), InstallError> {
    run.ensure_not_cancelled()?;
    tracing::info!("Creating ext4 filesystem on {}", partition.display());
    let node = partition.to_string_lossy().into_owned();
    run_command("mkfs.ext4", ["-F", "-L", PERSISTENCE_LABEL, node.as_str()])
        .map(drop)
        .map_err(format_err(partition))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::compute;
    use crate::request::BootMode;
    use bytesize::ByteSize;

    #[test]
    fn wintogo_bounds_are_bridge_then_everything() {
        let plan = compute(FsKind::Ntfs, BootMode::Both, true, None, ByteSize::gib(8)).unwrap();
        let bounds = partition_bounds(&plan);
        assert_eq!(bounds.len(), 2);
        assert_eq!(bounds[0], ("1MiB".to_owned(), "33MiB".to_owned()));
        assert_eq!(bounds[1], ("33MiB".to_owned(), "100%".to_owned()));
    }

    #[test]
    fn persistence_tail_uses_negative_offsets() {
        let plan = compute(
            FsKind::F2fs,
            BootMode::Both,
            false,
            Some(ByteSize::mib(512)),
            ByteSize::gib(16),
        )
        .unwrap();
        let bounds = partition_bounds(&plan);
        // bridge, data, persistence
        assert_eq!(bounds.len(), 3);
        assert_eq!(bounds[1].1, "-513MiB");
        assert_eq!(bounds[2], ("-513MiB".to_owned(), "-1MiB".to_owned()));
    }

    #[test]
    fn mkpart_uses_primary_on_mbr_and_names_on_gpt() {
        let plan = compute(FsKind::Fat32, BootMode::Both, false, None, ByteSize::gib(8)).unwrap();
        let spec = &plan.partitions[0];
        let mbr = mkpart_args(TableScheme::Mbr, spec, "1MiB", "100%");
        assert_eq!(mbr, ["mkpart", "primary", "fat32", "1MiB", "100%"]);
        let gpt = mkpart_args(TableScheme::Gpt, spec, "1MiB", "100%");
        assert_eq!(gpt, ["mkpart", "Data", "fat32", "1MiB", "100%"]);
    }

    #[test]
    fn flags_map_to_parted_set_commands() {
        use crate::plan::{PartitionFlags, PartitionRole};
        let spec = PartitionSpec {
            role: PartitionRole::UefiBridge,
            size: PartitionSize::Bytes(MIB),
            type_hint: "fat16",
            flags: PartitionFlags {
                boot: true,
                esp: true,
                msft_reserved: true,
            },
            name: "ESP",
        };
        let flags = flag_args(1, &spec);
        assert_eq!(flags.len(), 3);
        assert_eq!(flags[0], ["set", "1", "boot", "on"]);
        assert_eq!(flags[1], ["set", "1", "esp", "on"]);
        assert_eq!(flags[2], ["set", "1", "msftres", "on"]);
    }

    #[test]
    fn destructive_ops_refuse_after_cancellation() {
        let run = PipelineRun::new();
        run.request_cancel();
        let err = wipe_signatures(&run, Path::new("/dev/null")).unwrap_err();
        assert!(err.is_cancelled());
    }
}
