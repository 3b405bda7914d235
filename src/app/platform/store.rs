use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::models::{Client, PlatformId};
use crate::app::platform::message::{PlatformRequest, PlatformResponse};
use crate::app::platform::{PlatformConnectionOptions, PlatformEvent, PlatformInterface};

/// Registry and orchestration point for platforms: starts/stops them,
/// aggregates their rosters, fans their event streams into one tagged
/// stream, and routes platform-scoped requests.
pub struct PlatformStore {
    platforms: Mutex<Vec<Arc<dyn PlatformInterface>>>,
    events: broadcast::Sender<(PlatformId, PlatformEvent)>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for PlatformStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            platforms: Mutex::new(Vec::new()),
            events,
            forwarders: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, platform: Arc<dyn PlatformInterface>) {
        {
            let mut platforms = self.lock_platforms();
            if platforms.iter().any(|existing| existing.id() == platform.id()) {
                warn!(platform = %platform.id(), "platform already registered, ignoring");
                return;
            }
            platforms.push(Arc::clone(&platform));
        }

        // Fan this platform's events into the unified stream.
        let mut receiver = platform.subscribe();
        let id = platform.id();
        let sender = self.events.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let _ = sender.send((id, event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(platform = %id, skipped, "platform event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        self.lock_forwarders().push(forwarder);
        info!(platform = %id, "platform registered");
    }

    pub fn get(&self, id: PlatformId) -> Option<Arc<dyn PlatformInterface>> {
        self.lock_platforms()
            .iter()
            .find(|platform| platform.id() == id)
            .cloned()
    }

    pub async fn start(
        &self,
        id: PlatformId,
        options: PlatformConnectionOptions,
    ) -> Result<(), AppError> {
        let platform = self
            .get(id)
            .ok_or_else(|| AppError::validation(format!("Unknown platform {id}"), ""))?;
        platform.start(options).await
    }

    pub async fn stop(&self, id: PlatformId) -> Result<(), AppError> {
        let platform = self
            .get(id)
            .ok_or_else(|| AppError::validation(format!("Unknown platform {id}"), ""))?;
        platform.stop().await
    }

    pub async fn start_all(&self, options: PlatformConnectionOptions) -> Result<(), AppError> {
        let platforms = self.lock_platforms().clone();
        for platform in platforms {
            platform.start(options.clone()).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let platforms = self.lock_platforms().clone();
        for platform in platforms {
            if let Err(err) = platform.stop().await {
                warn!(platform = %platform.id(), error = %err, "failed to stop platform");
            }
        }
    }

    /// Unified client list across every registered platform.
    pub fn get_clients(&self) -> Vec<(PlatformId, Client)> {
        self.lock_platforms()
            .iter()
            .flat_map(|platform| {
                let id = platform.id();
                platform
                    .get_clients()
                    .into_iter()
                    .map(move |client| (id, client))
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(PlatformId, PlatformEvent)> {
        self.events.subscribe()
    }

    /// Route a request to the platform it names. An unknown platform id is
    /// not an error; the request simply resolves to nothing.
    pub async fn handle_request(
        &self,
        request: PlatformRequest,
    ) -> Result<Option<PlatformResponse>, AppError> {
        match self.get(request.platform) {
            Some(platform) => platform.handle_request(request).await,
            None => Ok(None),
        }
    }

    pub fn shutdown(&self) {
        for forwarder in self.lock_forwarders().drain(..) {
            forwarder.abort();
        }
    }

    fn lock_platforms(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn PlatformInterface>>> {
        self.platforms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_forwarders(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.forwarders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::{Capability, ClientUpdate, PlatformStatus};
    use crate::app::platform::message::PlatformAction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct StubPlatform {
        id: PlatformId,
        running: AtomicBool,
        events: broadcast::Sender<PlatformEvent>,
        roster: Vec<Client>,
    }

    impl StubPlatform {
        fn new(id: PlatformId, roster: Vec<Client>) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                id,
                running: AtomicBool::new(false),
                events,
                roster,
            })
        }
    }

    #[async_trait]
    impl PlatformInterface for StubPlatform {
        fn id(&self) -> PlatformId {
            self.id
        }
        fn name(&self) -> &'static str {
            "Stub"
        }
        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Detect]
        }
        async fn start(&self, _options: PlatformConnectionOptions) -> Result<(), AppError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<(), AppError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn get_clients(&self) -> Vec<Client> {
            self.roster.clone()
        }
        async fn update_client(
            &self,
            _client_id: &str,
            _update: ClientUpdate,
        ) -> Option<Client> {
            None
        }
        async fn send_data(
            &self,
            _client_id: &str,
            _data: serde_json::Value,
        ) -> Result<bool, AppError> {
            Ok(false)
        }
        async fn broadcast_data(&self, _data: serde_json::Value) -> Result<(), AppError> {
            Ok(())
        }
        fn get_status(&self) -> PlatformStatus {
            PlatformStatus {
                is_active: self.is_running(),
                clients: self.get_clients(),
                uptime_ms: 0,
            }
        }
        fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
            self.events.subscribe()
        }
        async fn handle_request(
            &self,
            request: PlatformRequest,
        ) -> Result<Option<PlatformResponse>, AppError> {
            if request.platform != self.id {
                return Ok(None);
            }
            Ok(Some(PlatformResponse::Output(format!("handled by {}", self.id))))
        }
    }

    #[tokio::test]
    async fn aggregates_rosters_across_platforms() {
        let store = PlatformStore::new();
        store.register(StubPlatform::new(PlatformId::Adb, vec![Client::new("dev1")]));
        store.register(StubPlatform::new(
            PlatformId::Websocket,
            vec![Client::new("web1"), Client::new("web2")],
        ));

        let clients = store.get_clients();
        assert_eq!(clients.len(), 3);
        assert_eq!(
            clients
                .iter()
                .filter(|(id, _)| *id == PlatformId::Websocket)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn routes_requests_by_platform_id() {
        let store = PlatformStore::new();
        store.register(StubPlatform::new(PlatformId::Adb, Vec::new()));

        let handled = store
            .handle_request(PlatformRequest {
                platform: PlatformId::Adb,
                action: PlatformAction::Refresh,
            })
            .await
            .expect("request");
        assert!(matches!(handled, Some(PlatformResponse::Output(_))));

        // No websocket platform registered: resolves to nothing.
        let unhandled = store
            .handle_request(PlatformRequest {
                platform: PlatformId::Websocket,
                action: PlatformAction::Refresh,
            })
            .await
            .expect("request");
        assert!(unhandled.is_none());
    }

    #[tokio::test]
    async fn forwards_platform_events_tagged_with_their_source() {
        let store = PlatformStore::new();
        let platform = StubPlatform::new(PlatformId::Adb, Vec::new());
        store.register(platform.clone());
        let mut events = store.subscribe();

        platform
            .events
            .send(PlatformEvent::ClientConnected(Client::new("dev1")))
            .expect("send");

        let (id, event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timely")
            .expect("event");
        assert_eq!(id, PlatformId::Adb);
        assert!(matches!(event, PlatformEvent::ClientConnected(_)));
    }

    #[tokio::test]
    async fn start_all_and_stop_all_toggle_every_platform() {
        let store = PlatformStore::new();
        let a = StubPlatform::new(PlatformId::Adb, Vec::new());
        let b = StubPlatform::new(PlatformId::Websocket, Vec::new());
        store.register(a.clone());
        store.register(b.clone());

        store
            .start_all(PlatformConnectionOptions::default())
            .await
            .expect("start all");
        assert!(a.is_running() && b.is_running());

        store.stop_all().await;
        assert!(!a.is_running() && !b.is_running());
    }
}
