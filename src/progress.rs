//! Run-scoped shared state: pipeline stage, cancellation flag and the
//! progress stream handed to observers.
//!
//! The worker thread owns all mutation of [`Stage`]; the copy engine owns the
//! byte/file fields of the snapshot; exactly one external caller may set the
//! cancel flag, which is never cleared. Observers only ever receive
//! [`ProgressSnapshot`] values by copy — they cannot reach back into the run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::InstallError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    #[default]
    Validating,
    Partitioning,
    Formatting,
    Copying,
    InstallingBootloader,
    CleaningUp,
    Succeeded,
    Failed,
    Cancelled,
}

impl Stage {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Validating => "validating",
            Self::Partitioning => "partitioning",
            Self::Formatting => "formatting",
            Self::Copying => "copying",
            Self::InstallingBootloader => "installing-bootloader",
            Self::CleaningUp => "cleaning-up",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<PathBuf>,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Default)]
pub struct PipelineRun {
    stage: Mutex<Stage>,
    cancel: AtomicBool,
    // Replaced wholesale on every publish; never field-mutated in place.
    progress: Mutex<ProgressSnapshot>,
    subscribers: Mutex<Vec<mpsc::Sender<ProgressSnapshot>>>,
}

impl PipelineRun {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock()
    }

    /// Request cancellation. Honored at the next stage boundary or file
    /// boundary; the in-flight command or file always completes first.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_not_cancelled(&self) -> Result<(), InstallError> {
        if self.cancel_requested() {
            Err(InstallError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Move to the next stage, first honoring a pending cancellation.
    pub(crate) fn enter_stage(&self, next: Stage) -> Result<(), InstallError> {
        self.ensure_not_cancelled()?;
        self.set_stage(next);
        Ok(())
    }

    /// Unconditional stage transition; used for `CleaningUp` and the terminal
    /// states, which must be reached even after cancellation.
    pub(crate) fn set_stage(&self, next: Stage) {
        {
            let mut stage = self.stage.lock();
            debug_assert!(!stage.is_terminal(), "terminal stages are final");
            *stage = next;
        }
        let mut snapshot = self.snapshot();
        snapshot.stage = next;
        self.publish(snapshot);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.lock().clone()
    }

    /// Subscribe to the progress stream. Every published snapshot is sent to
    /// every live subscriber; receivers that went away are pruned.
    pub fn subscribe(&self) -> mpsc::Receiver<ProgressSnapshot> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish a snapshot. Never blocks: the stored copy is swapped under a
    /// short-lived lock and the channel sends are unbuffered-unbounded.
    pub(crate) fn publish(&self, snapshot: ProgressSnapshot) {
        *self.progress.lock() = snapshot.clone();
        self.subscribers
            .lock()
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}
