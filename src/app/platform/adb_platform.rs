use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::adb::service::AdbService;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::models::{
    AdbDevice, Capability, Client, ClientManifest, ClientUpdate, ConnectionContext,
    ConnectionMethod, PlatformId, PlatformStatus,
};
use crate::app::platform::message::{PlatformAction, PlatformRequest, PlatformResponse};
use crate::app::platform::{PlatformConnectionOptions, PlatformEvent, PlatformInterface};
use crate::app::progress::{ProgressBus, ProgressChannel};

const ADB_CAPABILITIES: &[Capability] = &[Capability::Detect, Capability::Configure];

/// Platform over physically attached devices. There is no persistent
/// transport; the roster is refreshed by polling `adb devices` and diffing
/// against what is already known. Devices that vanish stay in the roster as
/// known-but-offline.
pub struct AdbPlatform {
    inner: Arc<Inner>,
}

struct Inner {
    service: Arc<AdbService>,
    progress: Arc<ProgressBus>,
    config: watch::Receiver<AppConfig>,
    active: AtomicBool,
    port: AtomicU16,
    started_at: Mutex<Option<Instant>>,
    roster: Mutex<Vec<Client>>,
    events: broadcast::Sender<PlatformEvent>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl AdbPlatform {
    pub fn new(
        service: Arc<AdbService>,
        progress: Arc<ProgressBus>,
        config: watch::Receiver<AppConfig>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                service,
                progress,
                config,
                active: AtomicBool::new(false),
                port: AtomicU16::new(8891),
                started_at: Mutex::new(None),
                roster: Mutex::new(Vec::new()),
                events,
                poll_task: Mutex::new(None),
                watch_task: Mutex::new(None),
            }),
        }
    }

    /// One refresh sweep, outside of the poll interval. Exposed for request
    /// handling and tests.
    pub async fn refresh_devices(&self) {
        self.inner.refresh_devices().await;
    }
}

impl Inner {
    fn lock_roster(&self) -> std::sync::MutexGuard<'_, Vec<Client>> {
        self.roster
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }

    async fn refresh_devices(&self) {
        self.progress.start(
            ProgressChannel::RefreshDevices,
            "Refreshing Devices",
            "Initializing refresh",
        );
        self.progress
            .update(ProgressChannel::RefreshDevices, "Getting devices", Some(10));
        let devices = self.service.get_devices().await;
        self.progress.update(
            ProgressChannel::RefreshDevices,
            &format!("Found {} devices", devices.len()),
            Some(30),
        );

        for device in &devices {
            self.refresh_client(device, false).await;
        }

        self.progress.update(
            ProgressChannel::RefreshDevices,
            "Marking missing devices offline",
            Some(60),
        );

        let snapshot = {
            let mut roster = self.lock_roster();
            let mut disconnected = Vec::new();
            for client in roster.iter_mut() {
                let still_present = devices
                    .iter()
                    .any(|device| Some(&device.adb_id) == client.adb_id.as_ref());
                if !still_present && client.connected {
                    client.connected = false;
                    client.timestamp = Utc::now();
                    disconnected.push(client.clone());
                }
            }
            for client in disconnected {
                self.emit(PlatformEvent::ClientDisconnected(client));
            }
            roster.clone()
        };

        self.emit(PlatformEvent::ClientList(snapshot));
        self.progress
            .complete(ProgressChannel::RefreshDevices, "Refresh complete");
    }

    async fn refresh_client(&self, device: &AdbDevice, force: bool) -> Option<Client> {
        let existing = self
            .lock_roster()
            .iter()
            .find(|client| client.adb_id.as_deref() == Some(device.adb_id.as_str()))
            .cloned();

        if let Some(client) = existing {
            let mut update = ClientUpdate::seen_now(!device.offline);
            if client.manifest.is_none() || force {
                self.progress.update(
                    ProgressChannel::RefreshDevices,
                    &format!("Getting manifest for {}", device.adb_id),
                    None,
                );
                update.manifest = self.build_device_manifest(device).await;
            }
            let was_connected = client.connected;
            let updated = self.apply_update(&client.id, update)?;
            if !was_connected && updated.connected {
                self.emit(PlatformEvent::ClientConnected(updated.clone()));
            } else {
                self.emit(PlatformEvent::ClientUpdated(updated.clone()));
            }
            Some(updated)
        } else {
            let mut client = Client::new(&device.adb_id);
            client.adb_id = Some(device.adb_id.clone());
            client.connected = !device.offline;
            // Best effort: an unreachable manifest never blocks registration.
            client.manifest = self.build_device_manifest(device).await;
            self.lock_roster().push(client.clone());
            self.emit(PlatformEvent::ClientConnected(client.clone()));
            Some(client)
        }
    }

    /// Device introspection rolled into a manifest. Any failure downgrades to
    /// `None` with a warning; the refresh sweep carries on.
    async fn build_device_manifest(&self, device: &AdbDevice) -> Option<ClientManifest> {
        let manifest = match self.service.get_device_manifest(&device.adb_id).await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(
                    adb_id = %device.adb_id,
                    error = %err,
                    "failed to get manifest for device"
                );
                return None;
            }
        };

        let app_version = self.service.get_device_version(&device.adb_id).await;
        let usid = self.service.get_device_usid(&device.adb_id).await;
        let mac_bt = self.service.get_device_mac_bt(&device.adb_id).await;
        let services = self
            .service
            .get_supervisor_status(&device.adb_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|(name, status)| (name, status == "RUNNING"))
            .collect();

        Some(ClientManifest {
            context: ConnectionContext {
                method: Some(ConnectionMethod::Adb),
                adb_id: Some(device.adb_id.clone()),
                app_version: Some(app_version),
                usid,
                mac_bt,
                services,
                ip: None,
                port: None,
            },
            ..manifest
        })
    }

    fn apply_update(&self, client_id: &str, update: ClientUpdate) -> Option<Client> {
        let mut roster = self.lock_roster();
        let client = roster.iter_mut().find(|client| {
            client.id == client_id || client.adb_id.as_deref() == Some(client_id)
        })?;
        client.apply(update);
        Some(client.clone())
    }

    fn restart_interval(self_arc: &Arc<Self>) {
        let mut poll_task = self_arc
            .poll_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Clear the old interval first so a settings flip never leaves two
        // pollers running.
        if let Some(task) = poll_task.take() {
            task.abort();
        }

        let settings = self_arc.config.borrow().adb.clone();
        debug!(auto_detect = settings.auto_detect, "adb auto detect interval");
        if !settings.auto_detect || !self_arc.active.load(Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(self_arc);
        let interval = Duration::from_secs(u64::from(settings.refresh_interval_s));
        *poll_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !inner.active.load(Ordering::SeqCst) {
                    return;
                }
                inner.refresh_devices().await;
            }
        }));
    }

    fn stop_tasks(&self) {
        for slot in [&self.poll_task, &self.watch_task] {
            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl PlatformInterface for AdbPlatform {
    fn id(&self) -> PlatformId {
        PlatformId::Adb
    }

    fn name(&self) -> &'static str {
        "ADB"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ADB_CAPABILITIES
    }

    async fn start(&self, options: PlatformConnectionOptions) -> Result<(), AppError> {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(port) = options.port {
            self.inner.port.store(port, Ordering::SeqCst);
        }
        *self
            .inner
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());

        self.inner.refresh_devices().await;

        // React to settings changes for as long as the platform runs: every
        // flip of auto-detect tears the interval down and rebuilds it.
        Inner::restart_interval(&self.inner);
        let inner = Arc::clone(&self.inner);
        let mut config = self.inner.config.clone();
        let watch_task = tokio::spawn(async move {
            while config.changed().await.is_ok() {
                if !inner.active.load(Ordering::SeqCst) {
                    return;
                }
                Inner::restart_interval(&inner);
            }
        });
        *self
            .inner
            .watch_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(watch_task);

        info!("adb platform started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop_tasks();
        self.inner.lock_roster().clear();
        info!("adb platform stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn get_clients(&self) -> Vec<Client> {
        self.inner.lock_roster().clone()
    }

    fn get_client_by_id(&self, client_id: &str) -> Option<Client> {
        self.inner
            .lock_roster()
            .iter()
            .find(|client| {
                client.id == client_id || client.adb_id.as_deref() == Some(client_id)
            })
            .cloned()
    }

    async fn update_client(&self, client_id: &str, update: ClientUpdate) -> Option<Client> {
        let updated = self.inner.apply_update(client_id, update)?;
        self.inner.emit(PlatformEvent::ClientUpdated(updated.clone()));
        Some(updated)
    }

    async fn send_data(
        &self,
        client_id: &str,
        _data: serde_json::Value,
    ) -> Result<bool, AppError> {
        warn!(client_id, "adb platform cannot deliver data to clients");
        Ok(false)
    }

    async fn broadcast_data(&self, _data: serde_json::Value) -> Result<(), AppError> {
        Ok(())
    }

    fn get_status(&self) -> PlatformStatus {
        let started_at = *self
            .inner
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let uptime_ms = started_at
            .filter(|_| self.is_running())
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);
        PlatformStatus {
            is_active: self.is_running(),
            clients: self.get_clients(),
            uptime_ms,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.inner.events.subscribe()
    }

    async fn handle_request(
        &self,
        request: PlatformRequest,
    ) -> Result<Option<PlatformResponse>, AppError> {
        if request.platform != PlatformId::Adb {
            return Ok(None);
        }
        let inner = &self.inner;
        let progress = &inner.progress;
        let port = inner.port.load(Ordering::SeqCst);

        match request.action {
            PlatformAction::GetManifest { adb_id } => {
                let manifest = inner.service.get_device_manifest(&adb_id).await?;
                Ok(Some(PlatformResponse::Manifest(manifest)))
            }
            PlatformAction::SetManifest { manifest } => {
                inner.service.staged().merge_manifest(&manifest)?;
                Ok(Some(PlatformResponse::Ack))
            }
            PlatformAction::SetSupervisor {
                adb_id,
                service,
                enabled,
            } => {
                progress.start(
                    ProgressChannel::AdbSupervisor,
                    "Supervisor Service",
                    &format!("Toggling {service}"),
                );
                let result = inner
                    .service
                    .toggle_supervisor_service(&adb_id, &service, enabled)
                    .await;
                match &result {
                    Ok(()) => progress.complete(
                        ProgressChannel::AdbSupervisor,
                        &format!("{service} toggled"),
                    ),
                    Err(err) => progress.error(
                        ProgressChannel::AdbSupervisor,
                        "Failed to toggle service",
                        &err.to_string(),
                    ),
                }
                result?;
                if let Some(device) = inner
                    .service
                    .get_devices()
                    .await
                    .into_iter()
                    .find(|device| device.adb_id == adb_id)
                {
                    inner.refresh_client(&device, true).await;
                }
                Ok(Some(PlatformResponse::Ack))
            }
            PlatformAction::PushStaged { adb_id } => {
                progress.start_operation(
                    ProgressChannel::PlatformChannel,
                    "Push Staged Client",
                    "Initializing push",
                    &[(ProgressChannel::ConfigureDevice, 100)],
                );
                match inner.service.configure_device(&adb_id, port, true).await {
                    Ok(()) => {
                        progress.complete(ProgressChannel::PlatformChannel, "Push complete");
                        Ok(Some(PlatformResponse::Ack))
                    }
                    Err(err) => {
                        progress.error(
                            ProgressChannel::PlatformChannel,
                            "Error pushing staged client",
                            &err.to_string(),
                        );
                        Err(err)
                    }
                }
            }
            PlatformAction::Refresh => {
                progress.start_operation(
                    ProgressChannel::PlatformChannel,
                    "Refreshing Devices",
                    "Initializing refresh",
                    &[(ProgressChannel::RefreshDevices, 100)],
                );
                inner.refresh_devices().await;
                progress.complete(ProgressChannel::PlatformChannel, "Refresh complete");
                Ok(Some(PlatformResponse::Clients(self.get_clients())))
            }
            PlatformAction::Run { adb_id, command } => {
                progress.start_operation(
                    ProgressChannel::PlatformChannel,
                    "Running ADB command",
                    &format!("Running {command}"),
                    &[(ProgressChannel::Adb, 100)],
                );
                progress.start(ProgressChannel::Adb, "ADB", &command);
                let response = inner.service.send_command(&command, adb_id.as_deref()).await;
                match response {
                    Ok(output) => {
                        progress.complete(ProgressChannel::Adb, "Command finished");
                        let preview: String = output.chars().take(15).collect();
                        progress.complete(
                            ProgressChannel::PlatformChannel,
                            &format!("Got response {preview}..."),
                        );
                        Ok(Some(PlatformResponse::Output(output)))
                    }
                    Err(err) => {
                        progress.error(
                            ProgressChannel::Adb,
                            "Command failed",
                            &err.to_string(),
                        );
                        Err(err)
                    }
                }
            }
            PlatformAction::Configure { adb_id } => {
                progress.start_operation(
                    ProgressChannel::PlatformChannel,
                    "Configuring Device",
                    &format!("Configuring {adb_id}"),
                    &[(ProgressChannel::ConfigureDevice, 100)],
                );
                inner.service.configure_device(&adb_id, port, false).await?;
                progress.complete(ProgressChannel::PlatformChannel, "Completed operation");
                Ok(Some(PlatformResponse::Ack))
            }
            PlatformAction::SetBrightness { adb_id, percent } => {
                inner.service.set_brightness(&adb_id, percent).await?;
                Ok(Some(PlatformResponse::Ack))
            }
            PlatformAction::GetBrightness { adb_id } => {
                let percent = inner.service.get_brightness(&adb_id).await?;
                Ok(Some(PlatformResponse::Brightness(percent)))
            }
            PlatformAction::RestartDevice { adb_id } => {
                inner.service.restart_device(&adb_id).await?;
                Ok(Some(PlatformResponse::Ack))
            }
            PlatformAction::ShutdownDevice { adb_id } => {
                inner.service.shutdown_device(&adb_id).await?;
                Ok(Some(PlatformResponse::Ack))
            }
            PlatformAction::Disconnect { .. }
            | PlatformAction::Ping { .. }
            | PlatformAction::Restart => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::queue::CommandExecutor;
    use crate::app::config::ConfigStore;
    use crate::app::staging::{NoClientReleases, StagedClient};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Executor whose `devices -l` output advances through a scripted
    /// sequence of snapshots. All other commands fail as unreachable, which
    /// exercises the best-effort manifest path.
    struct SequencedExecutor {
        snapshots: StdMutex<VecDeque<String>>,
        last: StdMutex<String>,
    }

    impl SequencedExecutor {
        fn new(snapshots: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                snapshots: StdMutex::new(snapshots.into_iter().collect()),
                last: StdMutex::new(String::new()),
            })
        }
    }

    #[async_trait]
    impl CommandExecutor for SequencedExecutor {
        async fn execute(&self, command: &str) -> Result<String, AppError> {
            if command.contains("devices -l") {
                let mut snapshots = self.snapshots.lock().unwrap();
                let mut last = self.last.lock().unwrap();
                if let Some(next) = snapshots.pop_front() {
                    *last = next;
                }
                return Ok(last.clone());
            }
            Err(AppError::device("device unreachable", "test"))
        }
    }

    fn platform_with_snapshots(snapshots: Vec<String>) -> (AdbPlatform, ConfigStore) {
        let config = ConfigStore::new(AppConfig::default());
        let staged = Arc::new(StagedClient::new(std::env::temp_dir().join("deskbridge-test")));
        let service = Arc::new(AdbService::with_executor(
            SequencedExecutor::new(snapshots),
            config.watch(),
            Arc::new(ProgressBus::new()),
            staged,
            Arc::new(NoClientReleases),
        ));
        let platform = AdbPlatform::new(
            service,
            Arc::new(ProgressBus::new()),
            config.watch(),
        );
        (platform, config)
    }

    fn lifecycle_events(
        receiver: &mut broadcast::Receiver<PlatformEvent>,
    ) -> Vec<(String, String)> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            match event {
                PlatformEvent::ClientConnected(client) => {
                    events.push(("connected".to_string(), client.id));
                }
                PlatformEvent::ClientDisconnected(client) => {
                    events.push(("disconnected".to_string(), client.id));
                }
                _ => {}
            }
        }
        events
    }

    #[tokio::test]
    async fn roster_diff_emits_the_expected_lifecycle() {
        let header = "List of devices attached\n";
        let (platform, _config) = platform_with_snapshots(vec![
            format!("{header}A\tdevice\nB\tdevice\n"),
            format!("{header}A\tdevice\n"),
            format!("{header}A\tdevice\nC\tdevice\n"),
        ]);
        let mut receiver = platform.subscribe();

        platform.refresh_devices().await;
        assert_eq!(
            lifecycle_events(&mut receiver),
            vec![
                ("connected".to_string(), "A".to_string()),
                ("connected".to_string(), "B".to_string()),
            ]
        );

        platform.refresh_devices().await;
        assert_eq!(
            lifecycle_events(&mut receiver),
            vec![("disconnected".to_string(), "B".to_string())]
        );
        // B stays in the roster, known but offline.
        let b = platform.get_client_by_id("B").expect("B retained");
        assert!(!b.connected);

        platform.refresh_devices().await;
        assert_eq!(
            lifecycle_events(&mut receiver),
            vec![("connected".to_string(), "C".to_string())]
        );
        assert_eq!(platform.get_clients().len(), 3);
    }

    #[tokio::test]
    async fn offline_devices_register_disconnected() {
        let (platform, _config) = platform_with_snapshots(vec![
            "List of devices attached\nA\toffline\n".to_string(),
        ]);
        platform.refresh_devices().await;
        let a = platform.get_client_by_id("A").expect("registered");
        assert!(!a.connected);
        // Registered despite the manifest being unreachable.
        assert!(a.manifest.is_none());
    }

    #[tokio::test]
    async fn unknown_platform_requests_yield_none() {
        let (platform, _config) =
            platform_with_snapshots(vec!["List of devices attached\n".to_string()]);
        let response = platform
            .handle_request(PlatformRequest {
                platform: PlatformId::Websocket,
                action: PlatformAction::Refresh,
            })
            .await
            .expect("request");
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears_the_roster() {
        let (platform, _config) = platform_with_snapshots(vec![
            "List of devices attached\nA\tdevice\n".to_string(),
        ]);
        platform
            .start(PlatformConnectionOptions::default())
            .await
            .expect("start");
        platform
            .start(PlatformConnectionOptions::default())
            .await
            .expect("second start");
        assert!(platform.is_running());
        assert_eq!(platform.get_clients().len(), 1);

        platform.stop().await.expect("stop");
        assert!(!platform.is_running());
        assert!(platform.get_clients().is_empty());
    }
}
