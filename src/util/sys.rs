/// Check if the current running system is UEFI or not.
///
/// Simply checks for the existence of the `/sys/firmware/efi` directory.
pub fn check_uefi() -> bool {
    std::fs::metadata("/sys/firmware/efi").is_ok()
}

/// Destructive device operations generally need root.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

// Fail compilation on non-Linux platforms; sysfs, parted and the mount
// plumbing are all Linux-specific.
#[cfg(not(target_os = "linux"))]
compile_error!("driveforge only supports Linux hosts");
