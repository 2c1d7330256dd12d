use std::path::{Path, PathBuf};

/// Device node for the `index`-th partition (1-based) of a whole disk.
/// Kernel naming: `/dev/sdb` -> `/dev/sdb1`, `/dev/nvme0n1` -> `/dev/nvme0n1p1`.
pub fn partition_path(device: &Path, index: usize) -> PathBuf {
    let device = device.as_os_str().to_string_lossy();
    let needs_p = device
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_digit());
    if needs_p {
        PathBuf::from(format!("{device}p{index}"))
    } else {
        PathBuf::from(format!("{device}{index}"))
    }
}

fn to_timeval(time: std::time::SystemTime) -> Option<nix::sys::time::TimeVal> {
    let t = time.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(nix::sys::time::TimeVal::new(
        t.as_secs().try_into().ok()?,
        (t.as_micros() % 1_000_000).try_into().ok()?,
    ))
}

/// Carry the source file's timestamps over to the copy. Best effort — FAT
/// timestamps are coarse and some of this is lossy by nature.
pub fn copy_file_times(metadata: &std::fs::Metadata, dest: &Path) -> std::io::Result<()> {
    let (Ok(atime), Ok(mtime)) = (metadata.accessed(), metadata.modified()) else {
        return Ok(());
    };
    let (Some(atime), Some(mtime)) = (to_timeval(atime), to_timeval(mtime)) else {
        return Ok(());
    };
    nix::sys::stat::utimes(dest, &atime, &mtime).map_err(std::io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_paths_follow_kernel_naming() {
        assert_eq!(
            partition_path(Path::new("/dev/sdb"), 1),
            PathBuf::from("/dev/sdb1")
        );
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 2),
            PathBuf::from("/dev/nvme0n1p2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 3),
            PathBuf::from("/dev/mmcblk0p3")
        );
    }

    #[test]
    fn timestamps_survive_the_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, "x").unwrap();
        std::fs::write(&dst, "x").unwrap();

        let meta = std::fs::metadata(&src).unwrap();
        copy_file_times(&meta, &dst).unwrap();
        let copied = std::fs::metadata(&dst).unwrap();
        let a = meta.modified().unwrap();
        let b = copied.modified().unwrap();
        let delta = a
            .duration_since(b)
            .unwrap_or_else(|e| e.duration())
            .as_secs();
        assert!(delta <= 1);
    }
}
