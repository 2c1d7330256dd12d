use bytesize::ByteSize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LABEL: &str = "Windows USB";

/// Size of the firmware-readable bridge partition that carries the UEFI boot
/// stub for filesystems the firmware cannot read itself.
pub const UEFI_BRIDGE_SIZE: ByteSize = ByteSize::mib(32);

/// Floor for the main data partition; plans leaving less than this are rejected.
pub const MIN_DATA_SIZE: ByteSize = ByteSize::gib(1);

pub const ESP_LABEL: &str = "UEFI_BOOT";
pub const PERSISTENCE_LABEL: &str = "persistence";

/// GRUB needs a little room of its own on the target filesystem.
pub const GRUB_EXTRA_SPACE: ByteSize = ByteSize::mib(10);

/// Files larger than this are streamed in chunks so progress can be reported
/// mid-file; smaller files are copied in one call.
pub const WHOLE_FILE_COPY_LIMIT: ByteSize = ByteSize::mib(5);
pub const COPY_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const COPY_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Consecutive per-file I/O failures before the copy engine decides the
/// device is gone and aborts the run.
pub const MAX_CONSECUTIVE_COPY_FAILURES: u32 = 8;

/// How long to wait for partition device nodes after partprobe.
pub const PARTITION_NODE_TIMEOUT: Duration = Duration::from_secs(5);

const BRIDGE_IMAGE_PATH: &str = "/usr/share/driveforge/uefi-ntfs.img";

pub fn bridge_image_path() -> PathBuf {
    PathBuf::from(
        std::env::var("DRIVEFORGE_BRIDGE_IMAGE").unwrap_or_else(|_| BRIDGE_IMAGE_PATH.into()),
    )
}
