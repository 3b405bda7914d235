use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::locator::resolve_adb_program;
use crate::app::adb::parse::{
    brightness_percent_to_raw, brightness_raw_to_percent, parse_brightness_raw, parse_devices,
    parse_mac_bt, parse_short_version, parse_supervisor_status,
};
use crate::app::adb::queue::{CommandExecutor, CommandQueue, DEFAULT_QUEUE_KEY};
use crate::app::adb::runner::{run_command_with_timeout, split_command_line};
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::models::{AdbDevice, ClientManifest};
use crate::app::progress::{ProgressBus, ProgressChannel};
use crate::app::staging::{ClientReleaseSource, StagedClient};

// Fixed Superbird filesystem locations.
pub const DEVICE_WEBAPP_PATH: &str = "/usr/share/qt-superbird-app/webapp";
pub const DEVICE_MANIFEST_PATH: &str = "/usr/share/qt-superbird-app/webapp/manifest.json";
pub const DEVICE_VERSION_PATH: &str = "/etc/superbird/version";
pub const DEVICE_USID_PATH: &str = "/sys/class/efuse/usid";
pub const DEVICE_MAC_BT_PATH: &str = "/sys/class/efuse/mac_bt";
pub const DEVICE_BRIGHTNESS_PATH: &str =
    "/sys/devices/platform/backlight/backlight/aml-bl/brightness";

const CLIENT_DOWNLOAD_ATTEMPTS: u32 = 3;
const CLIENT_DOWNLOAD_BACKOFF: Duration = Duration::from_millis(500);

/// Executes one adb invocation per call. The synchronous runner (with its
/// per-command timeout) runs on the blocking pool so queue workers never
/// block the runtime.
pub struct AdbCommandExecutor {
    program: String,
    timeout: Duration,
}

impl AdbCommandExecutor {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CommandExecutor for AdbCommandExecutor {
    async fn execute(&self, command: &str) -> Result<String, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let args = split_command_line(command);
        let program = self.program.clone();
        let timeout = self.timeout;
        let task_trace_id = trace_id.clone();

        let output = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(&program, &args, timeout, &task_trace_id)
        })
        .await
        .map_err(|err| {
            AppError::system(format!("Command task failed: {err}"), trace_id.as_str())
        })??;

        if output.exit_code != Some(0) {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(AppError::device(
                format!("adb exited with {:?}: {detail}", output.exit_code),
                trace_id.as_str(),
            ));
        }
        Ok(output.stdout)
    }
}

/// Serialized access to the adb CLI plus the higher-level device operations
/// built on top of it.
pub struct AdbService {
    queue: CommandQueue,
    config: watch::Receiver<AppConfig>,
    progress: Arc<ProgressBus>,
    staged: Arc<StagedClient>,
    releases: Arc<dyn ClientReleaseSource>,
}

impl AdbService {
    pub fn new(
        config: watch::Receiver<AppConfig>,
        progress: Arc<ProgressBus>,
        staged: Arc<StagedClient>,
        releases: Arc<dyn ClientReleaseSource>,
    ) -> Self {
        let settings = config.borrow().adb.clone();
        let executor = Arc::new(AdbCommandExecutor::new(
            resolve_adb_program(&settings.command_path),
            Duration::from_secs(u64::from(settings.command_timeout_s)),
        ));
        Self::with_executor(executor, config, progress, staged, releases)
    }

    pub fn with_executor(
        executor: Arc<dyn CommandExecutor>,
        config: watch::Receiver<AppConfig>,
        progress: Arc<ProgressBus>,
        staged: Arc<StagedClient>,
        releases: Arc<dyn ClientReleaseSource>,
    ) -> Self {
        Self {
            queue: CommandQueue::new(executor),
            config,
            progress,
            staged,
            releases,
        }
    }

    pub fn staged(&self) -> &Arc<StagedClient> {
        &self.staged
    }

    fn is_blacklisted(&self, device_id: &str) -> bool {
        self.config
            .borrow()
            .adb
            .blacklist
            .iter()
            .any(|entry| entry == device_id)
    }

    /// Queue a raw adb command. Commands for the same device run strictly in
    /// submission order; blacklisted devices are rejected before entering
    /// the queue.
    pub async fn send_command(
        &self,
        command: &str,
        device_id: Option<&str>,
    ) -> Result<String, AppError> {
        if let Some(device_id) = device_id {
            if self.is_blacklisted(device_id) {
                return Err(AppError::blacklisted(device_id, ""));
            }
        }
        self.queue
            .submit(command, device_id.unwrap_or(DEFAULT_QUEUE_KEY))
            .await
    }

    /// List attached devices, minus blacklisted ones. Listing failures are
    /// logged and produce an empty roster instead of an error.
    pub async fn get_devices(&self) -> Vec<AdbDevice> {
        match self.send_command("devices -l", None).await {
            Ok(output) => {
                let blacklist = self.config.borrow().adb.blacklist.clone();
                parse_devices(&output)
                    .into_iter()
                    .filter(|device| !blacklist.contains(&device.adb_id))
                    .collect()
            }
            Err(err) => {
                warn!(error = %err, "failed to list adb devices");
                Vec::new()
            }
        }
    }

    pub async fn open_port(&self, device_id: &str, port: u16) -> Result<(), AppError> {
        self.send_command(&format!("reverse tcp:{port} tcp:{port}"), Some(device_id))
            .await?;
        Ok(())
    }

    pub async fn restart_chromium(&self, device_id: &str) -> Result<(), AppError> {
        self.send_command("shell supervisorctl restart chromium", Some(device_id))
            .await?;
        Ok(())
    }

    pub async fn get_device_manifest(&self, device_id: &str) -> Result<ClientManifest, AppError> {
        let response = self
            .send_command(&format!("shell cat {DEVICE_MANIFEST_PATH}"), Some(device_id))
            .await?;
        serde_json::from_str(&response).map_err(|err| {
            AppError::device(format!("Device manifest is not valid JSON: {err}"), "")
        })
    }

    /// Webapp version currently on the device, or "0.0.0" when the device is
    /// unreachable or carries no readable manifest.
    pub async fn get_device_manifest_version(&self, device_id: &str) -> String {
        match self.get_device_manifest(device_id).await {
            Ok(manifest) => manifest.version,
            Err(err) => {
                warn!(device_id, error = %err, "failed to read device manifest version");
                "0.0.0".to_string()
            }
        }
    }

    /// OS build version from `/etc/superbird/version`, or "0.0.0".
    pub async fn get_device_version(&self, device_id: &str) -> String {
        match self
            .send_command(&format!("shell cat {DEVICE_VERSION_PATH}"), Some(device_id))
            .await
        {
            Ok(output) => parse_short_version(&output).unwrap_or_else(|| "0.0.0".to_string()),
            Err(err) => {
                warn!(device_id, error = %err, "failed to read device version");
                "0.0.0".to_string()
            }
        }
    }

    pub async fn get_device_usid(&self, device_id: &str) -> Option<String> {
        match self
            .send_command(&format!("shell cat {DEVICE_USID_PATH}"), Some(device_id))
            .await
        {
            Ok(output) => {
                let trimmed = output.trim().to_string();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            Err(err) => {
                warn!(device_id, error = %err, "failed to read device USID");
                None
            }
        }
    }

    pub async fn get_device_mac_bt(&self, device_id: &str) -> Option<String> {
        match self
            .send_command(&format!("shell cat {DEVICE_MAC_BT_PATH}"), Some(device_id))
            .await
        {
            Ok(output) => {
                let collapsed = parse_mac_bt(&output);
                (!collapsed.is_empty()).then_some(collapsed)
            }
            Err(err) => {
                warn!(device_id, error = %err, "failed to read device bluetooth MAC");
                None
            }
        }
    }

    pub async fn get_supervisor_status(
        &self,
        device_id: &str,
    ) -> Result<HashMap<String, String>, AppError> {
        let output = self
            .send_command("shell supervisorctl status", Some(device_id))
            .await?;
        Ok(parse_supervisor_status(&output))
    }

    pub async fn toggle_supervisor_service(
        &self,
        device_id: &str,
        service: &str,
        enabled: bool,
    ) -> Result<(), AppError> {
        let action = if enabled { "start" } else { "stop" };
        self.send_command(
            &format!("shell supervisorctl {action} {service}"),
            Some(device_id),
        )
        .await?;
        Ok(())
    }

    pub async fn set_brightness(&self, device_id: &str, percent: u8) -> Result<(), AppError> {
        let raw = brightness_percent_to_raw(percent);
        self.send_command(
            &format!("shell echo {raw} > {DEVICE_BRIGHTNESS_PATH}"),
            Some(device_id),
        )
        .await?;
        Ok(())
    }

    pub async fn get_brightness(&self, device_id: &str) -> Result<u8, AppError> {
        let output = self
            .send_command(&format!("shell cat {DEVICE_BRIGHTNESS_PATH}"), Some(device_id))
            .await?;
        let raw = parse_brightness_raw(&output).ok_or_else(|| {
            AppError::device("Brightness read returned no numeric value", "")
        })?;
        Ok(brightness_raw_to_percent(raw))
    }

    pub async fn restart_device(&self, device_id: &str) -> Result<(), AppError> {
        self.send_command("shell reboot", Some(device_id)).await?;
        Ok(())
    }

    pub async fn shutdown_device(&self, device_id: &str) -> Result<(), AppError> {
        self.send_command("shell poweroff", Some(device_id)).await?;
        Ok(())
    }

    async fn push_webapp(&self, device_id: &str) -> Result<(), AppError> {
        let progress = &self.progress;
        progress.update(ProgressChannel::ConfigureDevice, "Remounting filesystem", Some(60));
        self.send_command("shell mount -o remount,rw /", Some(device_id))
            .await?;

        progress.update(ProgressChannel::ConfigureDevice, "Moving existing webapp", Some(65));
        self.send_command(
            &format!("shell mv {DEVICE_WEBAPP_PATH} /tmp/webapp-orig"),
            Some(device_id),
        )
        .await?;

        progress.update(ProgressChannel::ConfigureDevice, "Removing old webapp", Some(70));
        self.send_command("shell rm -r /tmp/webapp-orig", Some(device_id))
            .await?;

        progress.update(ProgressChannel::ConfigureDevice, "Pushing new webapp", Some(80));
        let source = self.staged.root().display().to_string();
        self.send_command(
            &format!("push \"{source}/\" {DEVICE_WEBAPP_PATH}"),
            Some(device_id),
        )
        .await?;
        Ok(())
    }

    /// Make sure a staged client bundle exists, downloading one with a
    /// bounded retry budget when it does not.
    async fn ensure_staged_client(&self) -> Result<(), AppError> {
        if self.staged.is_staged() {
            return Ok(());
        }

        let mut last_error: Option<AppError> = None;
        for attempt in 1..=CLIENT_DOWNLOAD_ATTEMPTS {
            self.progress.update(
                ProgressChannel::ConfigureDevice,
                &format!("Downloading client (attempt {attempt}/{CLIENT_DOWNLOAD_ATTEMPTS})"),
                None,
            );
            match self.releases.download_latest(self.staged.root()).await {
                Ok(()) if self.staged.is_staged() => return Ok(()),
                Ok(()) => {
                    last_error = Some(AppError::dependency(
                        "Downloaded client bundle is missing its manifest",
                        "",
                    ));
                }
                Err(err) => {
                    warn!(attempt, error = %err, "client download attempt failed");
                    last_error = Some(err);
                }
            }
            if attempt < CLIENT_DOWNLOAD_ATTEMPTS {
                tokio::time::sleep(CLIENT_DOWNLOAD_BACKOFF * attempt).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::dependency(
                "Client not found and could not be downloaded automatically",
                "",
            )
        }))
    }

    /// The provisioning pipeline: reverse port, staged-bundle check, version
    /// compare, manifest swap + push + guaranteed restore, renderer restart.
    pub async fn configure_device(
        &self,
        device_id: &str,
        port: u16,
        force_push: bool,
    ) -> Result<(), AppError> {
        self.progress.start(
            ProgressChannel::ConfigureDevice,
            "Configure Device",
            "Opening port",
        );

        let result = self.configure_device_inner(device_id, port, force_push).await;
        match &result {
            Ok(()) => {
                self.progress
                    .complete(ProgressChannel::ConfigureDevice, "Configuration complete");
            }
            Err(err) => {
                self.progress.error(
                    ProgressChannel::ConfigureDevice,
                    "Configuration failed",
                    &err.to_string(),
                );
            }
        }
        result
    }

    async fn configure_device_inner(
        &self,
        device_id: &str,
        port: u16,
        force_push: bool,
    ) -> Result<(), AppError> {
        let progress = &self.progress;

        self.open_port(device_id, port).await?;

        progress.update(ProgressChannel::ConfigureDevice, "Locating staged client", Some(10));
        self.ensure_staged_client().await?;

        progress.update(ProgressChannel::ConfigureDevice, "Getting device version", Some(20));
        let device_version = self.get_device_manifest_version(device_id).await;

        progress.update(ProgressChannel::ConfigureDevice, "Reading staged manifest", Some(30));
        let staged_manifest = self.staged.load_manifest()?;

        progress.update(ProgressChannel::ConfigureDevice, "Checking for updates", Some(40));
        if device_version != staged_manifest.version || force_push {
            info!(
                device_id,
                device_version,
                staged_version = %staged_manifest.version,
                force_push,
                "pushing staged client to device"
            );
            // Only one push may touch the staged bundle at a time; the swap
            // guard restores the manifest on every exit path.
            let _staging = self.staged.acquire_push_lock().await;
            let swap = self.staged.begin_swap()?;
            swap.set_device_context(device_id, port)?;

            progress.update(ProgressChannel::ConfigureDevice, "Pushing webapp", Some(50));
            let push_result = self.push_webapp(device_id).await;
            let restore_result = swap.restore();
            push_result?;
            restore_result?;
        }

        progress.update(ProgressChannel::ConfigureDevice, "Restarting Chromium", Some(90));
        self.restart_chromium(device_id).await?;
        Ok(())
    }
}
