//! BIOS and UEFI boot code installation.
//!
//! Failures here never invalidate the data already copied — re-copying a
//! multi-gigabyte image is far more expensive than retrying only this stage,
//! so the pipeline reports "data copied, not bootable" instead of rolling
//! back.

use std::path::{Path, PathBuf};

use sys_mount::{Mount, Unmount, UnmountFlags};

use crate::error::InstallError;
use crate::filesystems::Prober;
use crate::progress::PipelineRun;
use crate::util::cmd::run_command;

/// Resolved GRUB installation command. Distributions disagree on both the
/// binary name and the boot directory prefix.
#[derive(Debug, Clone)]
pub struct GrubInstall {
    pub command: PathBuf,
    pub prefix: &'static str,
}

pub fn find_grub(prober: &Prober) -> Option<GrubInstall> {
    if let Some(command) = prober.resolve("grub-install") {
        return Some(GrubInstall {
            command,
            prefix: "grub",
        });
    }
    prober.resolve("grub2-install").map(|command| GrubInstall {
        command,
        prefix: "grub2",
    })
}

/// Install GRUB into the MBR gap and drop a config that chainloads the
/// Windows bootmgr from the data partition.
#[tracing::instrument(skip(run))]
pub fn install_bios(
    run: &PipelineRun,
    grub: &GrubInstall,
    device: &Path,
    target_mount: &Path,
) -> Result<(), InstallError> {
    run.ensure_not_cancelled()?;
    tracing::info!("Installing GRUB for legacy PC boot");

    let boot_dir = format!("--boot-directory={}", target_mount.display());
    let dev = device.to_string_lossy().into_owned();
    run_command(
        &grub.command.to_string_lossy(),
        ["--target=i386-pc", boot_dir.as_str(), "--force", dev.as_str()],
    )
    .map(drop)
    .map_err(|e| InstallError::Bootloader(e.to_string()))?;

    let grub_dir = target_mount.join(grub.prefix);
    std::fs::create_dir_all(&grub_dir).map_err(|e| {
        InstallError::Bootloader(format!("cannot create {}: {e}", grub_dir.display()))
    })?;
    std::fs::write(grub_dir.join("grub.cfg"), "ntldr /bootmgr\nboot\n").map_err(|e| {
        InstallError::Bootloader(format!("cannot write GRUB chainload config: {e}"))
    })
}

/// Raw-write the firmware-readable boot stub onto the bridge partition. The
/// stub image (UEFI:NTFS-style) is a complete FAT filesystem that chains to
/// the loader on the main data partition.
#[tracing::instrument(skip(run))]
pub fn install_uefi_bridge(
    run: &PipelineRun,
    bridge_partition: &Path,
    image: &Path,
) -> Result<(), InstallError> {
    run.ensure_not_cancelled()?;
    if !image.is_file() {
        return Err(InstallError::Bootloader(format!(
            "UEFI boot stub image not found at {}; the drive will boot in legacy mode only",
            image.display()
        )));
    }
    tracing::info!(
        "Writing UEFI boot stub {} to {}",
        image.display(),
        bridge_partition.display()
    );
    run_command(
        "dd",
        [
            format!("if={}", image.display()),
            format!("of={}", bridge_partition.display()),
            "bs=1M".to_owned(),
            "conv=fsync".to_owned(),
        ],
    )
    .map(drop)
    .map_err(|e| InstallError::Bootloader(e.to_string()))
}

/// Populate the ESP of a Windows-To-Go drive with the boot files Windows
/// staged on its own partition.
#[tracing::instrument(skip(run))]
pub fn populate_wintogo_esp(
    run: &PipelineRun,
    esp_partition: &Path,
    windows_root: &Path,
    scratch: &Path,
) -> Result<(), InstallError> {
    run.ensure_not_cancelled()?;

    let mountpoint = scratch.join("esp");
    std::fs::create_dir_all(&mountpoint).map_err(|e| InstallError::Mount {
        path: mountpoint.clone(),
        source: e,
    })?;
    let mount = Mount::builder()
        .mount(esp_partition, &mountpoint)
        .map_err(|source| InstallError::Mount {
            path: esp_partition.to_owned(),
            source,
        })?;
    scopeguard::defer! {
        if let Err(e) = mount.unmount(UnmountFlags::DETACH) {
            tracing::warn!("Cannot unmount ESP: {e}");
        }
    };

    tracing::info!("Installing bootloader files to the ESP");
    let boot_dir = mountpoint.join("EFI/Boot");
    std::fs::create_dir_all(&boot_dir)
        .map_err(|e| InstallError::Bootloader(format!("cannot create EFI/Boot: {e}")))?;

    let efi_source = windows_root.join("Windows/Boot/EFI");
    let bootmgfw = efi_source.join("bootmgfw.efi");
    if !bootmgfw.is_file() {
        return Err(InstallError::Bootloader(format!(
            "no EFI bootloader in the copied Windows tree ({})",
            bootmgfw.display()
        )));
    }
    std::fs::copy(&bootmgfw, boot_dir.join("bootx64.efi"))
        .map_err(|e| InstallError::Bootloader(format!("cannot stage bootx64.efi: {e}")))?;

    // secondary files are nice-to-have
    let bootmgr = efi_source.join("bootmgr.efi");
    if bootmgr.is_file() {
        if let Err(e) = std::fs::copy(&bootmgr, boot_dir.join("bootmgr.efi")) {
            tracing::warn!("Cannot stage bootmgr.efi: {e}");
        }
    }
    let bcd = windows_root.join("Boot/BCD");
    if bcd.is_file() {
        let bcd_dir = mountpoint.join("EFI/Microsoft/Boot");
        if let Err(e) = std::fs::create_dir_all(&bcd_dir)
            .and_then(|()| std::fs::copy(&bcd, bcd_dir.join("BCD")).map(drop))
        {
            tracing::warn!("Cannot stage BCD store: {e}");
        }
    }

    Ok(())
}

/// A FAT32 data partition is firmware-readable as-is; just confirm the media
/// actually ships an EFI loader.
pub fn has_direct_uefi_loader(target_mount: &Path) -> bool {
    ["efi/boot/bootx64.efi", "EFI/Boot/bootx64.efi", "EFI/BOOT/BOOTX64.EFI"]
        .iter()
        .any(|p| target_mount.join(p).is_file())
}
