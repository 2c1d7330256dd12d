//! Firmware quirk helpers and installation-media introspection.

use std::path::Path;

use crate::error::CommandError;
use crate::util::cmd::run_command;

/// Some BIOSes refuse to boot a disk unless a partition has the boot flag
/// toggled on, even though nothing reads it. Applied on request only.
#[tracing::instrument]
pub fn force_boot_flag(device: &Path, partition_number: usize) -> Result<(), CommandError> {
    tracing::info!("Toggling the boot flag for picky firmware");
    let dev = device.to_string_lossy().into_owned();
    let number = partition_number.to_string();
    run_command(
        "parted",
        ["--script", dev.as_str(), "set", number.as_str(), "boot", "on"],
    )
    .map(drop)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsVersion {
    pub version: String,
    pub build: Option<String>,
}

/// Best-effort Windows version detection from a mounted installation tree.
/// Windows 11 media ships `sources/appraiserres.dll`; older media carry a
/// `sources/cversion.ini` with a `MinClient` line.
pub fn detect_windows_version(source_root: &Path) -> Option<WindowsVersion> {
    let sources = source_root.join("sources");

    for indicator in ["appraiserres.dll", "compatresources.dll"] {
        if sources.join(indicator).exists() {
            return Some(WindowsVersion {
                version: "11".into(),
                build: None,
            });
        }
    }

    let cversion = std::fs::read_to_string(sources.join("cversion.ini")).ok()?;
    let version = if cversion.contains("MinClient=7") {
        "7"
    } else if cversion.contains("MinClient=8") {
        "8"
    } else if cversion.contains("MinClient=10") {
        "10"
    } else {
        return None;
    };
    let build = cversion
        .lines()
        .find_map(|line| line.trim().strip_prefix("BuildNumber="))
        .map(|b| b.trim().to_owned());

    Some(WindowsVersion {
        version: version.into(),
        build,
    })
}
