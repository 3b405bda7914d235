use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::flash::parse::FlashEvent;
use crate::app::flash::runner::{spawn_flash_runner, FlashRunnerHandle, RunnerMessage};
use crate::app::flash::{FlashStateMachine, FlashingState};
use crate::app::progress::{ProgressBus, ProgressChannel};

#[derive(Debug, Clone)]
enum ToolMode {
    Flash(PathBuf),
    Unbrick,
}

/// Orchestrates the firmware provisioning workflow: spawns the flashing
/// tool, folds its events into the state machine, reports progress, and
/// handles cancel/retry.
pub struct FlashStore {
    inner: Arc<Inner>,
}

struct Inner {
    progress: Arc<ProgressBus>,
    config: watch::Receiver<AppConfig>,
    machine: Mutex<FlashStateMachine>,
    state_tx: broadcast::Sender<FlashingState>,
    runner: Mutex<Option<FlashRunnerHandle>>,
    cancel_requested: AtomicBool,
}

impl FlashStore {
    pub fn new(config: watch::Receiver<AppConfig>, progress: Arc<ProgressBus>) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                progress,
                config,
                machine: Mutex::new(FlashStateMachine::new()),
                state_tx,
                runner: Mutex::new(None),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlashingState> {
        self.inner.state_tx.subscribe()
    }

    pub fn flash_state(&self) -> FlashingState {
        self.inner.lock_machine().state()
    }

    /// Flash a firmware image. Resolves once the tool finishes; rejects on
    /// failure, cancellation, or an attempt that skipped steps.
    pub async fn start_flash(&self, image_path: &Path) -> Result<(), AppError> {
        if !image_path.exists() {
            return Err(AppError::validation(
                format!("Firmware image not found: {}", image_path.display()),
                "",
            ));
        }
        self.run_tool(ToolMode::Flash(image_path.to_path_buf())).await
    }

    /// Recover a bricked device. Same tool, different entry point; no step
    /// accounting is available in this mode.
    pub async fn unbrick(&self) -> Result<(), AppError> {
        self.run_tool(ToolMode::Unbrick).await
    }

    /// Cancel the attempt in progress. Terminal: the device must be
    /// replugged and the flash restarted from the top.
    pub fn cancel_flash(&self) {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        let handle = self.inner.lock_runner().take();
        if let Some(handle) = handle {
            handle.stop();
        }
        let update = self.inner.lock_machine().cancel();
        let _ = self.inner.state_tx.send(update.state);
        info!("flash attempt cancelled");
    }

    /// Run the platform-specific driver bootstrap, streaming its output into
    /// driver-install progress updates.
    pub async fn install_driver(&self) -> Result<(), AppError> {
        let progress = Arc::clone(&self.inner.progress);
        progress.start(
            ProgressChannel::FlashDriver,
            "Driver Install",
            "Installing device driver",
        );

        let blocking_progress = Arc::clone(&progress);
        let result = tokio::task::spawn_blocking(move || run_driver_bootstrap(&blocking_progress))
            .await
            .map_err(|err| AppError::system(format!("Driver install task failed: {err}"), ""))?;

        match &result {
            Ok(()) => progress.complete(
                ProgressChannel::FlashDriver,
                "Driver installation completed successfully",
            ),
            Err(err) => progress.error(
                ProgressChannel::FlashDriver,
                "Driver installation failed",
                &err.to_string(),
            ),
        }
        result
    }

    async fn run_tool(&self, mode: ToolMode) -> Result<(), AppError> {
        let inner = &self.inner;
        {
            let machine = inner.lock_machine();
            if machine.is_flashing() {
                return Err(AppError::validation("A flash is already in progress", ""));
            }
        }

        let progress = &inner.progress;
        progress.start_operation(
            ProgressChannel::FlashOperation,
            "Flash Device",
            "Initializing flash process",
            &[(ProgressChannel::FlashRunner, 100)],
        );
        progress.start(
            ProgressChannel::FlashRunner,
            "Flashing Device",
            "Initializing flash",
        );

        inner.cancel_requested.store(false, Ordering::SeqCst);
        let begin = inner.lock_machine().begin();
        let _ = inner.state_tx.send(begin.state);

        let settings = inner.config.borrow().flash.clone();
        let mut args = settings.extra_args.clone();
        match &mode {
            ToolMode::Flash(image) => {
                args.push("flash".to_string());
                args.push(image.display().to_string());
            }
            ToolMode::Unbrick => args.push("unbrick".to_string()),
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = match spawn_flash_runner(&settings.tool_path, &args, event_tx) {
            Ok(handle) => handle,
            Err(err) => {
                let update = inner.lock_machine().fail(&err.to_string(), None);
                let _ = inner.state_tx.send(update.state);
                progress.error(
                    ProgressChannel::FlashOperation,
                    "Error flashing device",
                    &err.to_string(),
                );
                return Err(err);
            }
        };
        *inner.lock_runner() = Some(handle);

        let mut exit_code = None;
        while let Some(message) = event_rx.recv().await {
            match message {
                RunnerMessage::Event(event) => self.absorb_event(&event),
                RunnerMessage::Exited { code } => {
                    exit_code = code;
                    break;
                }
            }
        }

        // Reap the handle; the tool has already exited on this path.
        let handle = inner.lock_runner().take();
        if let Some(handle) = handle {
            handle.stop();
        }

        if inner.cancel_requested.load(Ordering::SeqCst) {
            let update = inner.lock_machine().cancel();
            let _ = inner.state_tx.send(update.state);
            progress.error(
                ProgressChannel::FlashOperation,
                "Flash cancelled",
                "The flash was cancelled; replug the device before retrying",
            );
            return Err(AppError::cancelled("Flash cancelled", ""));
        }

        let finished = match mode {
            ToolMode::Flash(_) => inner.lock_machine().steps_completed(),
            ToolMode::Unbrick => true,
        };

        if exit_code == Some(0) && finished {
            let update = inner.lock_machine().finish();
            let _ = inner.state_tx.send(update.state);
            progress.complete(ProgressChannel::FlashRunner, "Device flashed successfully");
            progress.complete(
                ProgressChannel::FlashOperation,
                "Device flashed successfully",
            );
            Ok(())
        } else {
            let message = if exit_code != Some(0) {
                format!("Flashing tool exited with status {exit_code:?}")
            } else {
                "Flash did not complete all of the required steps".to_string()
            };
            let update = inner.lock_machine().fail(&message, None);
            let _ = inner.state_tx.send(update.state);
            progress.error(
                ProgressChannel::FlashOperation,
                "Error flashing device",
                &message,
            );
            Err(AppError::device(message, ""))
        }
    }

    fn absorb_event(&self, event: &FlashEvent) {
        let inner = &self.inner;
        let (update, overall) = {
            let mut machine = inner.lock_machine();
            let update = machine.apply_event(event);
            (update, machine.overall_percent())
        };

        if update.changed {
            let _ = inner.state_tx.send(update.state.clone());
        }

        let title = update
            .state
            .step_title
            .clone()
            .unwrap_or_else(|| "Flashing...".to_string());
        inner.progress.update(
            ProgressChannel::FlashRunner,
            &format!("{title} - {:.2}% complete", update.state.progress.percent),
            overall.map(|percent| percent.round() as u8),
        );
    }
}

impl Inner {
    fn lock_machine(&self) -> std::sync::MutexGuard<'_, FlashStateMachine> {
        self.machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_runner(&self) -> std::sync::MutexGuard<'_, Option<FlashRunnerHandle>> {
        self.runner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Driver bootstrap for the flashing transport. Streams stdout lines into
/// progress updates; stderr is logged.
fn run_driver_bootstrap(progress: &ProgressBus) -> Result<(), AppError> {
    let (program, args): (&str, Vec<&str>) = if cfg!(windows) {
        (
            "powershell.exe",
            vec![
                "-ExecutionPolicy",
                "Bypass",
                "-Command",
                "irm https://driver.terbium.app/get | iex",
            ],
        )
    } else {
        (
            "bash",
            vec!["-c", "curl -sSL https://driver.terbium.app/get | bash"],
        )
    };

    let mut child = Command::new(program)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::system(format!("Failed to spawn driver install: {err}"), ""))?;

    if let Some(stdout) = child.stdout.take() {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            let line = line.trim().to_string();
            if !line.is_empty() {
                progress.update(ProgressChannel::FlashDriver, &line, None);
            }
        }
    }
    if let Some(stderr) = child.stderr.take() {
        let reader = std::io::BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            if !line.trim().is_empty() {
                warn!(stderr = %line, "driver installation stderr");
            }
        }
    }

    let status = child
        .wait()
        .map_err(|err| AppError::system(format!("Failed to wait for driver install: {err}"), ""))?;
    if status.success() {
        Ok(())
    } else {
        Err(AppError::system(
            format!("Driver install exited with status {:?}", status.code()),
            "",
        ))
    }
}
