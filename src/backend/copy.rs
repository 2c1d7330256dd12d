//! The cancellable copy-with-progress engine.
//!
//! The tree is enumerated up front (so totals are known before the first
//! byte moves) in stable lexicographic order — the same source always
//! produces the same per-file progress sequence. Per-file failures are
//! recorded and skipped; the run only aborts when failures suggest the
//! device itself is gone.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::consts::{
    COPY_CHUNK_SIZE, COPY_PROGRESS_INTERVAL, MAX_CONSECUTIVE_COPY_FAILURES, WHOLE_FILE_COPY_LIMIT,
};
use crate::error::{FileCopyError, FileCopyErrorKind, InstallError};
use crate::progress::{PipelineRun, ProgressSnapshot, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the source root.
    pub rel: PathBuf,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Default)]
pub struct CopyResult {
    pub bytes_copied: u64,
    pub files_copied: u64,
    pub files_failed: u64,
    pub first_error: Option<FileCopyError>,
    /// The run was cancelled between files; everything copied so far is intact.
    pub cancelled: bool,
}

/// Walk the source tree in deterministic order. Directories come before
/// their contents; symlinks are followed (installation media for FAT/NTFS
/// targets cannot represent them anyway).
pub fn enumerate(source: &Path) -> std::io::Result<(Vec<FileEntry>, u64)> {
    let mut entries = Vec::new();
    let mut total = 0u64;

    for entry in jwalk::WalkDir::new(source).sort(true) {
        let entry = entry.map_err(std::io::Error::other)?;
        let path = entry.path();
        let rel = path
            .strip_prefix(source)
            .map_err(std::io::Error::other)?
            .to_path_buf();
        if rel.as_os_str().is_empty() {
            // the root itself
            continue;
        }
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                // dangling symlink or the like; nothing copyable behind it
                tracing::warn!("Skipping {}: {e}", rel.display());
                continue;
            }
        };
        if meta.is_dir() {
            entries.push(FileEntry {
                rel,
                size: 0,
                is_dir: true,
            });
        } else {
            total += meta.len();
            entries.push(FileEntry {
                rel,
                size: meta.len(),
                is_dir: false,
            });
        }
    }

    Ok((entries, total))
}

struct Reporter<'a> {
    run: &'a PipelineRun,
    bytes_total: u64,
    bytes_done: u64,
    last_publish: Instant,
}

impl Reporter<'_> {
    fn publish(&mut self, in_flight: u64, current_file: Option<&Path>) {
        let done = self.bytes_done + in_flight;
        let percent = if self.bytes_total == 0 {
            100
        } else {
            (done.saturating_mul(100) / self.bytes_total).min(100) as u8
        };
        self.last_publish = Instant::now();
        self.run.publish(ProgressSnapshot {
            stage: Stage::Copying,
            percent,
            current_file: current_file.map(Path::to_path_buf),
            bytes_done: done,
            bytes_total: self.bytes_total,
        });
    }
}

/// Copy the whole tree from `source` to `dest`.
///
/// `max_single_file` is the target filesystem's per-file ceiling; files over
/// it fail with [`FileCopyErrorKind::FileTooLargeForFilesystem`] instead of
/// being silently truncated or skipped, and the copy continues.
///
/// # Errors
/// Fatal errors only: enumeration failure, directory creation failure, or
/// too many consecutive per-file failures.
#[tracing::instrument(skip(run))]
pub fn copy_tree(
    source: &Path,
    dest: &Path,
    max_single_file: Option<u64>,
    run: &PipelineRun,
) -> Result<CopyResult, InstallError> {
    let (entries, bytes_total) = enumerate(source)
        .map_err(|e| InstallError::Copy(format!("cannot enumerate source tree: {e}")))?;
    tracing::info!(
        "Copying {} entries ({} bytes) from {}",
        entries.len(),
        bytes_total,
        source.display()
    );

    let mut reporter = Reporter {
        run,
        bytes_total,
        bytes_done: 0,
        last_publish: Instant::now(),
    };
    reporter.publish(0, None);

    let mut result = CopyResult::default();
    let mut consecutive_io_failures = 0u32;

    for entry in &entries {
        // between files only; a file in flight always completes
        if run.cancel_requested() {
            tracing::warn!("Cancellation observed, stopping the copy");
            result.cancelled = true;
            break;
        }

        let target = dest.join(&entry.rel);
        if entry.is_dir {
            std::fs::create_dir_all(&target).map_err(|e| {
                InstallError::Copy(format!("cannot create {}: {e}", target.display()))
            })?;
            continue;
        }

        match copy_file(
            &source.join(&entry.rel),
            &target,
            &entry.rel,
            entry.size,
            max_single_file,
            &mut reporter,
        ) {
            Ok(()) => {
                result.files_copied += 1;
                result.bytes_copied += entry.size;
                reporter.bytes_done += entry.size;
                consecutive_io_failures = 0;
                reporter.publish(0, Some(&entry.rel));
            }
            Err(kind) => {
                tracing::warn!("Failed to copy {}: {kind}", entry.rel.display());
                result.files_failed += 1;
                let is_io = matches!(kind, FileCopyErrorKind::Io(_));
                if result.first_error.is_none() {
                    result.first_error = Some(FileCopyError {
                        path: entry.rel.clone(),
                        kind,
                    });
                }
                if is_io {
                    consecutive_io_failures += 1;
                    if consecutive_io_failures >= MAX_CONSECUTIVE_COPY_FAILURES {
                        return Err(InstallError::Copy(format!(
                            "aborting after {consecutive_io_failures} consecutive file failures \
                             (last: {})",
                            entry.rel.display()
                        )));
                    }
                } else {
                    consecutive_io_failures = 0;
                }
            }
        }
    }

    if !result.cancelled {
        reporter.publish(0, None);
    }
    tracing::info!(
        "Copy finished: {} files, {} bytes, {} failed",
        result.files_copied,
        result.bytes_copied,
        result.files_failed
    );
    Ok(result)
}

fn copy_file(
    source: &Path,
    dest: &Path,
    rel: &Path,
    size: u64,
    max_single_file: Option<u64>,
    reporter: &mut Reporter<'_>,
) -> Result<(), FileCopyErrorKind> {
    if max_single_file.is_some_and(|max| size > max) {
        return Err(FileCopyErrorKind::FileTooLargeForFilesystem);
    }

    let metadata = std::fs::metadata(source)?;
    if size <= WHOLE_FILE_COPY_LIMIT.as_u64() {
        std::fs::copy(source, dest)?;
    } else {
        copy_streaming(source, dest, rel, reporter)?;
    }

    if let Err(e) = crate::util::fs::copy_file_times(&metadata, dest) {
        tracing::debug!("Cannot preserve timestamps on {}: {e}", dest.display());
    }
    Ok(())
}

/// Chunked copy for large files so observers see movement inside a single
/// file. Pendrives can be slow enough that one file takes minutes.
fn copy_streaming(
    source: &Path,
    dest: &Path,
    rel: &Path,
    reporter: &mut Reporter<'_>,
) -> Result<(), std::io::Error> {
    let mut reader = std::fs::File::open(source)?;
    let mut writer = std::fs::File::create(dest)?;
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(buf.get(..n).unwrap_or_default())?;
        written += n as u64;
        if reporter.last_publish.elapsed() >= COPY_PROGRESS_INTERVAL {
            reporter.publish(written, Some(rel));
        }
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tree(files: &[(&str, usize)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, size) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, vec![0x5a; *size]).unwrap();
        }
        dir
    }

    #[test]
    fn enumeration_is_deterministic_and_sorted() {
        let src = build_tree(&[
            ("zeta.bin", 10),
            ("alpha/b.bin", 5),
            ("alpha/a.bin", 5),
            ("mid.bin", 1),
        ]);
        let (first, total) = enumerate(src.path()).unwrap();
        let (second, _) = enumerate(src.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(total, 21);

        let order: Vec<_> = first.iter().map(|e| e.rel.clone()).collect();
        assert_eq!(
            order,
            [
                PathBuf::from("alpha"),
                "alpha/a.bin".into(),
                "alpha/b.bin".into(),
                "mid.bin".into(),
                "zeta.bin".into(),
            ]
        );
    }

    #[test]
    fn copies_everything_and_reports_totals() {
        let src = build_tree(&[("a.bin", 100), ("sub/b.bin", 200)]);
        let dst = tempfile::tempdir().unwrap();
        let run = PipelineRun::new();

        let result = copy_tree(src.path(), dst.path(), None, &run).unwrap();
        assert_eq!(result.files_copied, 2);
        assert_eq!(result.bytes_copied, 300);
        assert_eq!(result.files_failed, 0);
        assert!(!result.cancelled);
        assert_eq!(
            std::fs::read(dst.path().join("sub/b.bin")).unwrap().len(),
            200
        );
        let final_snap = run.snapshot();
        assert_eq!(final_snap.percent, 100);
        assert_eq!(final_snap.bytes_done, 300);
    }

    #[test]
    fn oversized_file_fails_by_name_but_copy_continues() {
        let src = build_tree(&[("big.bin", 4096), ("small1.bin", 10), ("small2.bin", 10)]);
        let dst = tempfile::tempdir().unwrap();
        let run = PipelineRun::new();

        let result = copy_tree(src.path(), dst.path(), Some(1024), &run).unwrap();
        assert_eq!(result.files_copied, 2);
        assert_eq!(result.files_failed, 1);
        let err = result.first_error.unwrap();
        assert_eq!(err.path, PathBuf::from("big.bin"));
        assert!(matches!(
            err.kind,
            FileCopyErrorKind::FileTooLargeForFilesystem
        ));
        assert!(!dst.path().join("big.bin").exists());
        assert!(dst.path().join("small1.bin").exists());
    }

    #[test]
    fn cancellation_stops_between_files() {
        let src = build_tree(&[("a.bin", 10), ("b.bin", 10)]);
        let dst = tempfile::tempdir().unwrap();
        let run = PipelineRun::new();
        run.request_cancel();

        let result = copy_tree(src.path(), dst.path(), None, &run).unwrap();
        assert!(result.cancelled);
        assert_eq!(result.files_copied, 0);
    }

    #[test]
    fn progress_events_are_monotonic() {
        let src = build_tree(&[("a.bin", 50), ("b.bin", 50), ("c.bin", 50)]);
        let dst = tempfile::tempdir().unwrap();
        let run = PipelineRun::new();
        let rx = run.subscribe();

        copy_tree(src.path(), dst.path(), None, &run).unwrap();
        drop(run);

        let mut last = 0u64;
        for snap in rx.iter() {
            assert!(snap.bytes_done >= last, "bytes_done went backwards");
            last = snap.bytes_done;
        }
        assert_eq!(last, 150);
    }
}
