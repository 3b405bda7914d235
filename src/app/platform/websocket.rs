use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::models::{Capability, Client, ClientUpdate, PlatformId, PlatformStatus};
use crate::app::platform::message::{PlatformAction, PlatformRequest, PlatformResponse};
use crate::app::platform::socket_server::{spawn_socket_server, ServerCommand};
use crate::app::platform::{PlatformConnectionOptions, PlatformEvent, PlatformInterface};
use crate::app::progress::{ProgressBus, ProgressChannel};

const WS_CAPABILITIES: &[Capability] = &[Capability::Communicate];
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Thin proxy over the socket-server actor: commands go out as messages, the
/// actor's client-lifecycle events are mirrored into the local roster and
/// re-broadcast. If the actor reports a transport error while the platform
/// is active, the platform stops and restarts itself with its last options.
pub struct WebSocketPlatform {
    inner: Arc<Inner>,
}

struct Inner {
    progress: Arc<ProgressBus>,
    commands: mpsc::Sender<ServerCommand>,
    events: broadcast::Sender<PlatformEvent>,
    roster: Mutex<Vec<Client>>,
    active: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    last_options: Mutex<PlatformConnectionOptions>,
}

impl WebSocketPlatform {
    pub fn new(progress: Arc<ProgressBus>) -> Self {
        let (event_tx, mut event_rx) = mpsc::channel::<PlatformEvent>(64);
        let commands = spawn_socket_server(event_tx);
        let (events, _) = broadcast::channel(64);

        let inner = Arc::new(Inner {
            progress,
            commands,
            events,
            roster: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            started_at: Mutex::new(None),
            last_options: Mutex::new(PlatformConnectionOptions::default()),
        });

        let mirror = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                mirror.absorb(event).await;
            }
        });

        Self { inner }
    }

    /// Round-trip latency to a socket client. Resolves to `None` after the
    /// ping window expires without a matching pong.
    pub async fn ping(&self, client_id: &str) -> Option<u64> {
        let progress = &self.inner.progress;
        progress.start(
            ProgressChannel::Ping,
            "Handling Ping",
            &format!("Pinging {client_id}"),
        );

        let mut events = self.inner.events.subscribe();
        let _ = self
            .inner
            .commands
            .send(ServerCommand::Ping {
                client_id: client_id.to_string(),
            })
            .await;
        progress.update(
            ProgressChannel::Ping,
            &format!("Awaiting response from {client_id}"),
            Some(50),
        );

        let latency = tokio::time::timeout(PING_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(PlatformEvent::ClientPong {
                        client_id: pong_id,
                        latency_ms,
                    }) if pong_id == client_id => return Some(latency_ms),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .unwrap_or(None);

        match latency {
            Some(latency_ms) => progress.complete(
                ProgressChannel::Ping,
                &format!("Pinged {client_id} in {latency_ms}ms"),
            ),
            None => progress.complete(
                ProgressChannel::Ping,
                &format!("Pinged {client_id} unsuccessfully"),
            ),
        }
        latency
    }
}

impl Inner {
    fn lock_roster(&self) -> std::sync::MutexGuard<'_, Vec<Client>> {
        self.roster
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn absorb(&self, event: PlatformEvent) {
        match &event {
            PlatformEvent::ClientConnected(client) | PlatformEvent::ClientUpdated(client) => {
                let mut roster = self.lock_roster();
                match roster.iter_mut().find(|entry| entry.id == client.id) {
                    Some(entry) => *entry = client.clone(),
                    None => roster.push(client.clone()),
                }
            }
            PlatformEvent::ClientDisconnected(client) => {
                self.lock_roster().retain(|entry| entry.id != client.id);
            }
            PlatformEvent::ClientList(list) => {
                *self.lock_roster() = list.clone();
            }
            PlatformEvent::Error(message) => {
                warn!(message, "socket server error");
                if self.active.load(Ordering::SeqCst) {
                    // Self-heal: restart the actor with the last-known
                    // options instead of propagating the failure outward.
                    let options = self.lock_last_options().clone();
                    let _ = self.commands.send(ServerCommand::Stop).await;
                    let _ = self.commands.send(ServerCommand::Start { options }).await;
                }
            }
            _ => {}
        }
        let _ = self.events.send(event);
    }

    fn lock_last_options(&self) -> std::sync::MutexGuard<'_, PlatformConnectionOptions> {
        self.last_options
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PlatformInterface for WebSocketPlatform {
    fn id(&self) -> PlatformId {
        PlatformId::Websocket
    }

    fn name(&self) -> &'static str {
        "WebSocket"
    }

    fn capabilities(&self) -> &'static [Capability] {
        WS_CAPABILITIES
    }

    async fn start(&self, options: PlatformConnectionOptions) -> Result<(), AppError> {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.inner.lock_last_options() = options.clone();
        *self
            .inner
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
        self.inner
            .commands
            .send(ServerCommand::Start { options })
            .await
            .map_err(|_| AppError::system("Socket server actor is gone", ""))?;
        info!("websocket platform started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .commands
            .send(ServerCommand::Stop)
            .await
            .map_err(|_| AppError::system("Socket server actor is gone", ""))?;
        info!("websocket platform stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn get_clients(&self) -> Vec<Client> {
        self.inner.lock_roster().clone()
    }

    async fn update_client(&self, client_id: &str, update: ClientUpdate) -> Option<Client> {
        let _ = self
            .inner
            .commands
            .send(ServerCommand::UpdateClient {
                client_id: client_id.to_string(),
                update: update.clone(),
            })
            .await;
        // The actor echoes the authoritative ClientUpdated event; merge
        // locally so the caller sees the update immediately.
        let mut roster = self.inner.lock_roster();
        let client = roster.iter_mut().find(|client| client.id == client_id)?;
        client.apply(update);
        Some(client.clone())
    }

    async fn send_data(
        &self,
        client_id: &str,
        data: serde_json::Value,
    ) -> Result<bool, AppError> {
        if !self.is_running() {
            warn!("socket platform is not active, dropping send");
            return Ok(false);
        }
        let known = self
            .inner
            .lock_roster()
            .iter()
            .any(|client| client.id == client_id);
        if !known {
            return Ok(false);
        }
        self.inner
            .commands
            .send(ServerCommand::SendData {
                client_id: client_id.to_string(),
                data,
            })
            .await
            .map_err(|_| AppError::system("Socket server actor is gone", ""))?;
        Ok(true)
    }

    async fn broadcast_data(&self, data: serde_json::Value) -> Result<(), AppError> {
        if !self.is_running() {
            return Ok(());
        }
        self.inner
            .commands
            .send(ServerCommand::Broadcast { data })
            .await
            .map_err(|_| AppError::system("Socket server actor is gone", ""))?;
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
        if request.platform != PlatformId::Websocket {
            return Ok(None);
        }
        match request.action {
            PlatformAction::Disconnect { client_id } => {
                self.inner
                    .commands
                    .send(ServerCommand::Disconnect { client_id })
                    .await
                    .map_err(|_| AppError::system("Socket server actor is gone", ""))?;
                Ok(Some(PlatformResponse::Ack))
            }
            PlatformAction::Ping { client_id } => {
                let latency_ms = self.ping(&client_id).await;
                Ok(Some(PlatformResponse::Pong { latency_ms }))
            }
            PlatformAction::Restart => {
                let options = self.inner.lock_last_options().clone();
                self.stop().await?;
                self.start(options).await?;
                Ok(Some(PlatformResponse::Ack))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_for_port(events: &mut broadcast::Receiver<PlatformEvent>) -> u16 {
        timeout(WAIT, async {
            loop {
                if let Ok(PlatformEvent::ServerStarted { port }) = events.recv().await {
                    return port;
                }
            }
        })
        .await
        .expect("server did not start")
    }

    async fn wait_for_connected(events: &mut broadcast::Receiver<PlatformEvent>) -> Client {
        timeout(WAIT, async {
            loop {
                if let Ok(PlatformEvent::ClientConnected(client)) = events.recv().await {
                    return client;
                }
            }
        })
        .await
        .expect("client did not connect")
    }

    #[tokio::test]
    async fn clients_connect_send_manifests_and_receive_broadcasts() {
        let platform = WebSocketPlatform::new(Arc::new(ProgressBus::new()));
        let mut events = platform.subscribe();
        platform
            .start(PlatformConnectionOptions {
                address: Some("127.0.0.1".to_string()),
                port: Some(0),
            })
            .await
            .expect("start");

        let port = wait_for_port(&mut events).await;
        let (mut socket, _) =
            tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
                .await
                .expect("connect");

        let connected = wait_for_connected(&mut events).await;
        assert!(connected.connected);
        assert_eq!(platform.get_clients().len(), 1);

        // A manifest message fills in client metadata.
        let manifest_message = serde_json::json!({
            "type": "manifest",
            "payload": {
                "id": "web-client",
                "name": "Web Client",
                "version": "0.11.0"
            }
        });
        socket
            .send(Message::Text(manifest_message.to_string().into()))
            .await
            .expect("send manifest");

        let updated = timeout(WAIT, async {
            loop {
                if let Ok(PlatformEvent::ClientUpdated(client)) = events.recv().await {
                    if client.manifest.is_some() {
                        return client;
                    }
                }
            }
        })
        .await
        .expect("manifest update");
        assert_eq!(
            updated.manifest.expect("manifest").version,
            "0.11.0"
        );

        // Broadcasts reach the connected socket.
        platform
            .broadcast_data(serde_json::json!({ "type": "greeting" }))
            .await
            .expect("broadcast");
        let received = timeout(WAIT, socket.next())
            .await
            .expect("broadcast timed out")
            .expect("stream open")
            .expect("message");
        assert!(received.to_text().expect("text").contains("greeting"));

        // Closing the socket removes the client from the roster.
        socket.close(None).await.expect("close");
        timeout(WAIT, async {
            loop {
                if let Ok(PlatformEvent::ClientDisconnected(_)) = events.recv().await {
                    return;
                }
            }
        })
        .await
        .expect("disconnect event");
        assert!(platform.get_clients().is_empty());

        platform.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn data_messages_surface_as_data_received() {
        let platform = WebSocketPlatform::new(Arc::new(ProgressBus::new()));
        let mut events = platform.subscribe();
        platform
            .start(PlatformConnectionOptions {
                address: Some("127.0.0.1".to_string()),
                port: Some(0),
            })
            .await
            .expect("start");

        let port = wait_for_port(&mut events).await;
        let (mut socket, _) =
            tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
                .await
                .expect("connect");
        let connected = wait_for_connected(&mut events).await;

        socket
            .send(Message::Text(
                serde_json::json!({ "type": "music", "payload": { "action": "play" } })
                    .to_string()
                    .into(),
            ))
            .await
            .expect("send data");

        let (client_id, payload) = timeout(WAIT, async {
            loop {
                if let Ok(PlatformEvent::DataReceived { client_id, payload }) =
                    events.recv().await
                {
                    return (client_id, payload);
                }
            }
        })
        .await
        .expect("data event");
        assert_eq!(client_id, connected.id);
        assert_eq!(payload["type"], "music");

        platform.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn send_data_to_unknown_client_reports_false() {
        let platform = WebSocketPlatform::new(Arc::new(ProgressBus::new()));
        platform
            .start(PlatformConnectionOptions {
                address: Some("127.0.0.1".to_string()),
                port: Some(0),
            })
            .await
            .expect("start");

        let delivered = platform
            .send_data("nobody", serde_json::json!({ "type": "noop" }))
            .await
            .expect("send");
        assert!(!delivered);
        platform.stop().await.expect("stop");
    }
}
