//! The pipeline state machine.
//!
//! One installation runs on one dedicated worker thread, strictly forward
//! through `Validating → Partitioning → Formatting → Copying →
//! InstallingBootloader → CleaningUp` and then into exactly one terminal
//! state. Errors and observed cancellations jump straight to `CleaningUp`,
//! which runs on every exit path: mounted filesystems are unmounted and the
//! staging directory is removed no matter how the run ended.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytesize::ByteSize;
use itertools::Itertools;
use sys_mount::{Mount, MountFlags, Unmount, UnmountFlags};

use crate::backend::bootloader::{self, GrubInstall};
use crate::backend::copy::{self, CopyResult};
use crate::backend::partitioning;
use crate::cfg::DriveforgeConfig;
use crate::consts::GRUB_EXTRA_SPACE;
use crate::disks::DeviceTarget;
use crate::error::{InstallError, PipelineResult, StageError};
use crate::filesystems::{select_optimal, FsKind, Prober, FAT32_MAX_FILE_SIZE};
use crate::plan::{self, PartitionPlan, PartitionRole};
use crate::progress::{PipelineRun, Stage};
use crate::request::InstallRequest;
use crate::stage;
use crate::workaround;

pub struct Installer {
    request: InstallRequest,
    config: DriveforgeConfig,
    prober: Prober,
    run: Arc<PipelineRun>,
    cleanup_hook: Option<Box<dyn FnOnce() + Send>>,
}

/// Everything the destructive stages need, resolved up front while nothing
/// has been touched yet.
struct Resolved {
    device: DeviceTarget,
    source_root: PathBuf,
    variant: FsKind,
    plan: PartitionPlan,
    label: String,
    source_bytes: u64,
    grub: Option<GrubInstall>,
}

struct Outcome {
    degraded_copy: bool,
    bootable: bool,
    bootloader_error: Option<InstallError>,
}

/// Scoped resources of one run. `teardown` is idempotent and runs on every
/// exit path, success, failure and cancellation alike.
#[derive(Default)]
struct Workspace {
    temp: Option<tempfile::TempDir>,
    source_mount: Option<(Mount, PathBuf)>,
    target_mount: Option<(Mount, PathBuf)>,
}

impl Workspace {
    fn scratch(&mut self) -> std::io::Result<PathBuf> {
        if self.temp.is_none() {
            self.temp = Some(tempfile::Builder::new().prefix("driveforge.").tempdir()?);
        }
        Ok(self
            .temp
            .as_ref()
            .expect("scratch dir just created")
            .path()
            .to_path_buf())
    }

    fn target_root(&self) -> Option<PathBuf> {
        self.target_mount.as_ref().map(|(_, path)| path.clone())
    }

    fn teardown(&mut self) {
        // target first, then source, then the staging directory around them
        let mounts = self.target_mount.take().into_iter().chain(self.source_mount.take());
        for (mount, path) in mounts {
            tracing::info!("Unmounting {}", path.display());
            if let Err(e) = mount.unmount(UnmountFlags::DETACH) {
                tracing::warn!("Cannot unmount {}: {e}", path.display());
            }
        }
        if let Some(temp) = self.temp.take() {
            if let Err(e) = temp.close() {
                tracing::warn!("Cannot remove staging directory: {e}");
            }
        }
    }
}

impl Installer {
    pub fn new(request: InstallRequest) -> Self {
        Self {
            request,
            config: DriveforgeConfig::default(),
            prober: Prober::from_env(),
            run: PipelineRun::new(),
            cleanup_hook: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: DriveforgeConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_prober(mut self, prober: Prober) -> Self {
        self.prober = prober;
        self
    }

    /// Invoked exactly once, after cleanup, however the run ends.
    #[must_use]
    pub fn on_cleanup(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup_hook = Some(Box::new(hook));
        self
    }

    /// Shared handle for observers: progress subscription and cancellation.
    pub fn handle(&self) -> Arc<PipelineRun> {
        Arc::clone(&self.run)
    }

    /// Run the pipeline on a dedicated worker thread; the long blocking
    /// device I/O must not sit on whoever drives the progress display.
    pub fn spawn(self) -> std::thread::JoinHandle<PipelineResult> {
        std::thread::Builder::new()
            .name("driveforge-worker".into())
            .spawn(move || self.install())
            .expect("cannot spawn worker thread")
    }

    /// Run the whole pipeline on the current thread.
    #[tracing::instrument(skip(self))]
    pub fn install(mut self) -> PipelineResult {
        let run = Arc::clone(&self.run);
        if !crate::util::sys::is_root() {
            tracing::warn!("Not running as root, destructive operations will likely fail");
        }

        let mut ws = Workspace::default();
        let outcome = self.execute(&mut ws);

        run.set_stage(Stage::CleaningUp);
        ws.teardown();
        if let Some(hook) = self.cleanup_hook.take() {
            hook();
        }

        let (final_state, error, degraded_copy, bootable) = match outcome {
            Ok(outcome) => {
                let error = outcome.bootloader_error.map(|error| StageError {
                    stage: Stage::InstallingBootloader,
                    error,
                });
                (Stage::Succeeded, error, outcome.degraded_copy, outcome.bootable)
            }
            Err(stage_error) if stage_error.error.is_cancelled() => {
                tracing::warn!("Installation cancelled during {}", stage_error.stage);
                (Stage::Cancelled, None, false, false)
            }
            Err(stage_error) => {
                tracing::error!("{stage_error}");
                (Stage::Failed, Some(stage_error), false, false)
            }
        };
        run.set_stage(final_state);

        PipelineResult {
            final_state,
            error,
            degraded_copy,
            bootable,
        }
    }

    fn execute(&self, ws: &mut Workspace) -> Result<Outcome, StageError> {
        let run = Arc::clone(&self.run);

        let resolved = stage!(run, Stage::Validating => { self.validate(ws) });

        let nodes = stage!(run, Stage::Partitioning => {
            partitioning::wipe_signatures(&run, &resolved.device.path)?;
            partitioning::create_partition_table(&run, &resolved.device.path, resolved.plan.scheme)?;
            partitioning::create_partitions(&run, &resolved.device.path, &resolved.plan)
        });

        stage!(run, Stage::Formatting => {
            for (spec, node) in resolved.plan.partitions.iter().zip(&nodes) {
                match spec.role {
                    PartitionRole::UefiBridge => partitioning::format_bridge(&run, node)?,
                    PartitionRole::Data => {
                        partitioning::format_partition(&run, node, resolved.variant, &resolved.label)?;
                    }
                    PartitionRole::Persistence => partitioning::format_persistence(&run, node)?,
                }
            }
            Ok(())
        });

        let data_index = resolved
            .plan
            .index_of(PartitionRole::Data)
            .expect("every plan has a data partition");
        let data_node = nodes
            .get(data_index)
            .expect("node list matches the plan")
            .clone();

        let copy_result: CopyResult = stage!(run, Stage::Copying => {
            let mountpoint = ws
                .scratch()
                .map_err(|e| InstallError::Copy(format!("cannot create staging directory: {e}")))?
                .join("target");
            std::fs::create_dir_all(&mountpoint).map_err(|source| InstallError::Mount {
                path: mountpoint.clone(),
                source,
            })?;
            let mount = Mount::builder()
                .mount(&data_node, &mountpoint)
                .map_err(|source| InstallError::Mount {
                    path: data_node.clone(),
                    source,
                })?;
            ws.target_mount = Some((mount, mountpoint.clone()));

            free_space_check(&mountpoint, resolved.source_bytes)?;

            let max_file = resolved.variant.max_single_file_size().map(|s| s.as_u64());
            let result = copy::copy_tree(&resolved.source_root, &mountpoint, max_file, &run)?;
            if result.cancelled {
                Err(InstallError::Cancelled)
            } else {
                Ok(result)
            }
        });

        let outcome = self.install_bootloaders(ws, &run, &resolved, &nodes, &copy_result)?;
        Ok(outcome)
    }

    fn install_bootloaders(
        &self,
        ws: &mut Workspace,
        run: &PipelineRun,
        resolved: &Resolved,
        nodes: &[PathBuf],
        copy_result: &CopyResult,
    ) -> Result<Outcome, StageError> {
        let annotate = |error| StageError {
            stage: Stage::InstallingBootloader,
            error,
        };
        run.enter_stage(Stage::InstallingBootloader).map_err(annotate)?;
        let _span = tracing::info_span!("stage", stage = %Stage::InstallingBootloader).entered();

        let target_root = ws.target_root().expect("target mounted during copy stage");
        let mut bootloader_error: Option<InstallError> = None;

        if self.request.boot_mode.wants_legacy() && !self.request.skip_legacy_bootloader {
            let grub = resolved.grub.as_ref().expect("grub resolved during validation");
            match bootloader::install_bios(run, grub, &resolved.device.path, &target_root) {
                Ok(()) => {}
                Err(error) if error.is_cancelled() => return Err(annotate(error)),
                Err(error) => {
                    tracing::error!("{error}");
                    bootloader_error.get_or_insert(error);
                }
            }
        }

        if self.request.boot_mode.wants_uefi() || self.request.windows_to_go {
            let bridge_node = resolved
                .plan
                .index_of(PartitionRole::UefiBridge)
                .and_then(|i| nodes.get(i));
            let uefi_result = match bridge_node {
                Some(node) if self.request.windows_to_go => match ws.scratch() {
                    Ok(scratch) => {
                        bootloader::populate_wintogo_esp(run, node, &target_root, &scratch)
                    }
                    Err(e) => Err(InstallError::Bootloader(format!(
                        "cannot create scratch directory: {e}"
                    ))),
                },
                Some(node) => bootloader::install_uefi_bridge(run, node, &self.bridge_image()),
                None => {
                    if !bootloader::has_direct_uefi_loader(&target_root) {
                        tracing::warn!(
                            "No EFI loader found on the copied media; UEFI boot may not work"
                        );
                    }
                    Ok(())
                }
            };
            match uefi_result {
                Ok(()) => {}
                Err(error) if error.is_cancelled() => return Err(annotate(error)),
                Err(error) => {
                    tracing::error!("{error}");
                    bootloader_error.get_or_insert(error);
                }
            }
        }

        if self.request.force_boot_flag {
            let number = resolved
                .plan
                .partition_number(PartitionRole::Data)
                .unwrap_or(1);
            if let Err(e) = workaround::force_boot_flag(&resolved.device.path, number) {
                tracing::warn!("Boot flag workaround failed: {e}");
            }
        }

        Ok(Outcome {
            degraded_copy: copy_result.files_failed > 0,
            bootable: bootloader_error.is_none(),
            bootloader_error,
        })
    }

    /// All validation happens before the first destructive command: missing
    /// inputs and missing tools must never cost the user a wiped drive.
    fn validate(&self, ws: &mut Workspace) -> Result<Resolved, InstallError> {
        let req = &self.request;

        let source_meta = std::fs::metadata(&req.source).map_err(|e| {
            InstallError::Validation(format!(
                "source {} not accessible: {e}",
                req.source.display()
            ))
        })?;

        let explicit = req.filesystem.kind();
        if let Some(kind) = explicit {
            if !self.config.install.allowed_filesystems.contains(&kind) {
                return Err(InstallError::Validation(format!(
                    "filesystem {kind} is not allowed here (allowed: {})",
                    self.config.install.allowed_filesystems.iter().join(", ")
                )));
            }
            let tool = kind.required_tool();
            if self.prober.resolve(tool).is_none() {
                return Err(InstallError::DependencyMissing {
                    tool: tool.into(),
                    purpose: format!("formatting {kind}"),
                });
            }
        }

        let grub = if req.boot_mode.wants_legacy() && !req.skip_legacy_bootloader {
            Some(
                bootloader::find_grub(&self.prober).ok_or_else(|| {
                    InstallError::DependencyMissing {
                        tool: "grub-install".into(),
                        purpose: "legacy BIOS bootloader".into(),
                    }
                })?,
            )
        } else {
            None
        };

        if req.persistence.is_some() && self.prober.resolve("mkfs.ext4").is_none() {
            return Err(InstallError::DependencyMissing {
                tool: "mkfs.ext4".into(),
                purpose: "formatting the persistence partition".into(),
            });
        }

        let device = DeviceTarget::probe(&req.target_device)?;
        if !device.removable {
            tracing::warn!(
                "{} does not look removable; double-check the target device",
                device.path.display()
            );
        }

        let source_root = if source_meta.is_dir() {
            req.source.clone()
        } else {
            let dir = ws
                .scratch()
                .map_err(|e| {
                    InstallError::Validation(format!("cannot create staging directory: {e}"))
                })?
                .join("source");
            std::fs::create_dir_all(&dir).map_err(|source| InstallError::Mount {
                path: dir.clone(),
                source,
            })?;
            let mount = mount_source(&req.source, &dir)?;
            ws.source_mount = Some((mount, dir.clone()));
            dir
        };

        let (entries, source_bytes) = copy::enumerate(&source_root)
            .map_err(|e| InstallError::Validation(format!("cannot read source tree: {e}")))?;
        let largest = entries.iter().map(|e| e.size).max().unwrap_or(0);
        let has_large_files = largest > FAT32_MAX_FILE_SIZE.as_u64();

        let variant = match explicit {
            Some(kind) => kind,
            None => {
                let mut available = self.prober.available();
                available.retain(|k| self.config.install.allowed_filesystems.contains(k));
                let kind = select_optimal(has_large_files, &available)?;
                tracing::info!("Auto-selected {kind} based on source content");
                kind
            }
        };
        if has_large_files && !variant.supports_large_files() {
            tracing::warn!(
                "Source contains files over {FAT32_MAX_FILE_SIZE} that {variant} cannot hold; \
                 those files will fail to copy"
            );
        }

        if req.windows_to_go {
            match workaround::detect_windows_version(&source_root) {
                Some(v) => {
                    tracing::info!("Detected Windows {} media (build {:?})", v.version, v.build);
                }
                None => tracing::warn!(
                    "Windows-To-Go requested but the source does not look like Windows media"
                ),
            }
        }

        let plan = plan::compute(
            variant,
            req.boot_mode,
            req.windows_to_go,
            req.persistence,
            device.size,
        )?;
        for warning in &plan.warnings {
            tracing::warn!("{warning}");
        }

        let label = req
            .label
            .clone()
            .unwrap_or_else(|| self.config.install.default_label.clone());

        Ok(Resolved {
            device,
            source_root,
            variant,
            plan,
            label,
            source_bytes,
            grub,
        })
    }

    fn bridge_image(&self) -> PathBuf {
        self.config
            .bootloader
            .bridge_image
            .clone()
            .unwrap_or_else(crate::consts::bridge_image_path)
    }
}

/// Mount an installation image read-only. Hybrid Windows ISOs are UDF with
/// an ISO9660 fallback; a file source goes through a loop device.
fn mount_source(source: &Path, dir: &Path) -> Result<Mount, InstallError> {
    Mount::builder()
        .flags(MountFlags::RDONLY)
        .fstype("udf")
        .mount(source, dir)
        .or_else(|_| {
            Mount::builder()
                .flags(MountFlags::RDONLY)
                .fstype("iso9660")
                .mount(source, dir)
        })
        .map_err(|e| InstallError::Mount {
            path: source.to_owned(),
            source: e,
        })
}

fn free_space_check(target: &Path, needed_bytes: u64) -> Result<(), InstallError> {
    let stat = nix::sys::statvfs::statvfs(target)
        .map_err(|e| InstallError::Copy(format!("cannot stat target filesystem: {e}")))?;
    let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    let needed = needed_bytes + GRUB_EXTRA_SPACE.as_u64();
    if needed > free {
        return Err(InstallError::Copy(format!(
            "not enough free space on the target: need {}, have {}",
            ByteSize(needed),
            ByteSize(free)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{BootMode, FsChoice};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(source: &Path) -> InstallRequest {
        InstallRequest {
            source: source.to_owned(),
            target_device: "/dev/driveforge-test-does-not-exist".into(),
            filesystem: FsChoice::Auto,
            boot_mode: BootMode::Both,
            windows_to_go: false,
            persistence: None,
            label: None,
            skip_legacy_bootloader: true,
            force_boot_flag: false,
        }
    }

    fn hook_counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let counter = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&counter);
        (counter, move || {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn missing_device_fails_at_validation_and_cleans_up_once() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), "x").unwrap();
        let (count, hook) = hook_counter();

        let installer = Installer::new(request(source.path()))
            .with_prober(Prober::with_path(Vec::new()))
            .on_cleanup(hook);
        let run = installer.handle();
        let result = installer.install();

        assert_eq!(result.final_state, Stage::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.stage, Stage::Validating);
        assert_eq!(error.error.kind(), "validation-error");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(run.stage(), Stage::Failed);
    }

    #[test]
    fn absent_tool_for_explicit_choice_is_dependency_missing() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), "x").unwrap();
        let (count, hook) = hook_counter();

        let mut req = request(source.path());
        req.filesystem = FsChoice::F2fs;
        let installer = Installer::new(req)
            .with_prober(Prober::with_path(Vec::new()))
            .on_cleanup(hook);
        let result = installer.install();

        assert_eq!(result.final_state, Stage::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.stage, Stage::Validating);
        assert_eq!(error.error.kind(), "dependency-missing");
        assert!(error.error.to_string().contains("mkfs.f2fs"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_grub_is_caught_before_anything_destructive() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), "x").unwrap();

        let mut req = request(source.path());
        req.skip_legacy_bootloader = false;
        let result = Installer::new(req)
            .with_prober(Prober::with_path(Vec::new()))
            .install();

        let error = result.error.unwrap();
        assert_eq!(error.error.kind(), "dependency-missing");
        assert!(error.error.to_string().contains("grub-install"));
    }

    #[test]
    fn cancellation_yields_cancelled_not_failed() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), "x").unwrap();
        let (count, hook) = hook_counter();

        let installer = Installer::new(request(source.path()))
            .with_prober(Prober::with_path(Vec::new()))
            .on_cleanup(hook);
        installer.handle().request_cancel();
        let result = installer.install();

        assert_eq!(result.final_state, Stage::Cancelled);
        assert!(result.error.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observers_see_cleanup_before_the_terminal_state() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), "x").unwrap();

        let installer =
            Installer::new(request(source.path())).with_prober(Prober::with_path(Vec::new()));
        let run = installer.handle();
        let rx = run.subscribe();
        let result = installer.install();
        drop(run);

        assert_eq!(result.final_state, Stage::Failed);
        let stages: Vec<Stage> = rx.iter().map(|snap| snap.stage).collect();
        let cleanup = stages.iter().position(|s| *s == Stage::CleaningUp);
        let failed = stages.iter().position(|s| *s == Stage::Failed);
        assert!(cleanup.is_some() && failed.is_some());
        assert!(cleanup < failed);
    }

    #[test]
    fn worker_thread_delivers_the_result() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), "x").unwrap();

        let result = Installer::new(request(source.path()))
            .with_prober(Prober::with_path(Vec::new()))
            .spawn()
            .join()
            .unwrap();
        assert_eq!(result.final_state, Stage::Failed);
    }
}
