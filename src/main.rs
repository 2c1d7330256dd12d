#![warn(rust_2018_idioms)]
mod backend;
pub mod cfg;
mod consts;
mod disks;
mod error;
mod filesystems;
mod plan;
mod progress;
mod request;
mod util;
mod workaround;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing_subscriber::prelude::*;

use crate::backend::install::Installer;
use crate::progress::{ProgressSnapshot, Stage};
use crate::request::InstallRequest;

static SIGINT_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: nix::libc::c_int) {
    SIGINT_SEEN.store(true, Ordering::Release);
}

#[allow(clippy::missing_errors_doc)]
fn main() -> Result<()> {
    let _guard = setup_logs_and_install_panic_hook();

    if std::env::args().any(|arg| arg == "--list-devices") {
        return list_devices();
    }

    // Driven non-interactively: the install request arrives as JSON on stdin,
    // progress goes to stderr, the terminal result as JSON on stdout.
    tracing::info!("Reading install request from stdin");
    let request: InstallRequest = serde_json::from_reader(std::io::stdin())?;

    let installer = Installer::new(request).with_config(cfg::get_cfg()?);
    let run = installer.handle();
    let events = run.subscribe();

    install_sigint_handler()?;
    let worker = installer.spawn();

    let mut cancel_sent = false;
    let mut renderer = Renderer::default();
    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(snapshot) => {
                let terminal = snapshot.stage.is_terminal();
                renderer.render(&snapshot);
                if terminal {
                    break;
                }
            }
            // the run handle keeps the channel alive, so poll the worker too
            Err(RecvTimeoutError::Timeout) if worker.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !cancel_sent && SIGINT_SEEN.load(Ordering::Acquire) {
            tracing::warn!(
                "Cancellation requested; the operation in flight has to finish first"
            );
            run.request_cancel();
            cancel_sent = true;
        }
    }

    let result = worker
        .join()
        .map_err(|_| eyre!("installation worker panicked"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    std::process::exit(result.exit_code());
}

fn list_devices() -> Result<()> {
    let devices = disks::list_removable()?;
    if devices.is_empty() {
        eprintln!("No removable devices found");
        return Ok(());
    }
    for dev in devices {
        eprintln!(
            "{}\t{}\t{}",
            dev.path.display(),
            dev.size,
            dev.model.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[derive(Default)]
struct Renderer {
    last_stage: Option<Stage>,
}

impl Renderer {
    fn render(&mut self, snapshot: &ProgressSnapshot) {
        if self.last_stage != Some(snapshot.stage) {
            if self.last_stage == Some(Stage::Copying) {
                eprintln!();
            }
            self.last_stage = Some(snapshot.stage);
            eprintln!("==> {}", snapshot.stage);
        }
        if snapshot.stage == Stage::Copying {
            let file = snapshot
                .current_file
                .as_ref()
                .map(|f| f.display().to_string())
                .unwrap_or_default();
            eprint!(
                "\r{:>3}% ({} / {}) {file}\x1b[K",
                snapshot.percent,
                bytesize::ByteSize(snapshot.bytes_done),
                bytesize::ByteSize(snapshot.bytes_total),
            );
            let _ = std::io::stderr().flush();
        }
    }
}

fn install_sigint_handler() -> Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // SAFETY: the handler only performs an atomic store, which is
    // async-signal-safe.
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(handle_sigint)) }?;
    Ok(())
}

/// Returns a logging guard.
///
/// # Panics
/// - cannot install `color_eyre`
/// - cannot create the driveforge log tempdir
fn setup_logs_and_install_panic_hook() -> impl std::any::Any {
    color_eyre::install().expect("install color_eyre");
    let temp_dir = tempfile::Builder::new()
        .prefix("driveforge-logs")
        .tempdir()
        .expect("create driveforge logs tempdir")
        .keep();
    let file_appender = tracing_appender::rolling::never(&temp_dir, "driveforge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let sub_builder = tracing_subscriber::fmt()
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .finish()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .parse(std::env::var("DRIVEFORGE_LOG").unwrap_or_default())
                .expect("parse DRIVEFORGE_LOG"),
        )
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact(),
        )
        // journald is best-effort; not every host runs systemd
        .with(
            tracing_journald::layer()
                .ok()
                .map(|l| l.with_syslog_identifier("driveforge".to_owned())),
        );
    tracing::subscriber::set_global_default(sub_builder).expect("unable to set global subscriber");
    tracing::info!(
        "driveforge {version}",
        version = env!("CARGO_PKG_VERSION")
    );
    tracing::info!(
        "Logging to {tmp}/driveforge.log",
        tmp = temp_dir.to_string_lossy()
    );
    guard
}
