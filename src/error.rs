//! Error taxonomy for the installation pipeline.

use std::path::PathBuf;

use crate::progress::Stage;

/// A failed external tool invocation, with a bounded tail of its diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("`{tool}` failed (exit code {code:?}): {stderr_tail}")]
pub struct CommandError {
    pub tool: String,
    pub code: Option<i32>,
    pub stderr_tail: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("required tool `{tool}` not found ({purpose})")]
    DependencyMissing { tool: String, purpose: String },

    #[error("no usable filesystem: no supported formatting tool is available")]
    NoUsableFilesystem,

    #[error("partitioning {} failed", .device.display())]
    Partition {
        device: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("formatting {} failed", .partition.display())]
    Format {
        partition: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("mounting {} failed: {source}", .path.display())]
    Mount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("copy failed: {0}")]
    Copy(String),

    #[error("bootloader installation failed: {0}")]
    Bootloader(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl InstallError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation-error",
            Self::DependencyMissing { .. } => "dependency-missing",
            Self::NoUsableFilesystem => "no-usable-filesystem",
            Self::Partition { .. } => "partition-error",
            Self::Format { .. } => "format-error",
            Self::Mount { .. } => "mount-error",
            Self::Copy(_) => "copy-error",
            Self::Bootloader(_) => "bootloader-error",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Why a single file could not be copied. Never fatal to the run by itself.
#[derive(Debug, thiserror::Error)]
pub enum FileCopyErrorKind {
    #[error("file exceeds the maximum size the target filesystem can hold")]
    FileTooLargeForFilesystem,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("{}: {kind}", .path.display())]
pub struct FileCopyError {
    pub path: PathBuf,
    pub kind: FileCopyErrorKind,
}

/// An [`InstallError`] annotated with the stage it interrupted.
#[derive(Debug, thiserror::Error)]
#[error("{error} (during {stage})")]
pub struct StageError {
    pub stage: Stage,
    pub error: InstallError,
}

impl serde::Serialize for StageError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("StageError", 3)?;
        s.serialize_field("stage", &self.stage)?;
        s.serialize_field("kind", self.error.kind())?;
        s.serialize_field("message", &self.error.to_string())?;
        s.end()
    }
}

/// Terminal outcome of one pipeline run.
#[derive(Debug, serde::Serialize)]
pub struct PipelineResult {
    pub final_state: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    /// Some files were skipped (e.g. too large for the target filesystem).
    pub degraded_copy: bool,
    /// False when the data copy succeeded but a bootloader step did not.
    pub bootable: bool,
}

impl PipelineResult {
    pub const fn exit_code(&self) -> i32 {
        match self.final_state {
            Stage::Succeeded => 0,
            Stage::Cancelled => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_serializes_kind_and_stage() {
        let err = StageError {
            stage: Stage::Validating,
            error: InstallError::DependencyMissing {
                tool: "mkfs.f2fs".into(),
                purpose: "formatting F2FS".into(),
            },
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["stage"], "validating");
        assert_eq!(json["kind"], "dependency-missing");
        assert!(json["message"].as_str().unwrap().contains("mkfs.f2fs"));
    }

    #[test]
    fn exit_codes() {
        let ok = PipelineResult {
            final_state: Stage::Succeeded,
            error: None,
            degraded_copy: false,
            bootable: true,
        };
        assert_eq!(ok.exit_code(), 0);
        let cancelled = PipelineResult {
            final_state: Stage::Cancelled,
            error: None,
            degraded_copy: false,
            bootable: false,
        };
        assert_eq!(cancelled.exit_code(), 2);
    }
}
