pub mod adb_platform;
pub mod message;
pub mod socket_server;
pub mod store;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::app::error::AppError;
use crate::app::models::{Capability, Client, ClientUpdate, PlatformId, PlatformStatus};
use crate::app::platform::message::{PlatformRequest, PlatformResponse};

/// Client-lifecycle and transport events emitted by every platform.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    ClientConnected(Client),
    ClientUpdated(Client),
    ClientDisconnected(Client),
    ClientList(Vec<Client>),
    DataReceived {
        client_id: String,
        payload: serde_json::Value,
    },
    ClientPong {
        client_id: String,
        latency_ms: u64,
    },
    Error(String),
    StatusChanged(PlatformStatus),
    ServerStarted {
        port: u16,
    },
}

#[derive(Debug, Clone, Default)]
pub struct PlatformConnectionOptions {
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// Uniform contract over heterogeneous transports. Callers query
/// `capabilities()` before invoking operations an implementation may not
/// support.
#[async_trait]
pub trait PlatformInterface: Send + Sync {
    fn id(&self) -> PlatformId;
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> &'static [Capability];

    async fn start(&self, options: PlatformConnectionOptions) -> Result<(), AppError>;
    async fn stop(&self) -> Result<(), AppError>;
    fn is_running(&self) -> bool;

    fn get_clients(&self) -> Vec<Client>;
    fn get_client_by_id(&self, client_id: &str) -> Option<Client> {
        self.get_clients()
            .into_iter()
            .find(|client| client.id == client_id)
    }
    async fn update_client(&self, client_id: &str, update: ClientUpdate) -> Option<Client>;

    async fn send_data(
        &self,
        client_id: &str,
        data: serde_json::Value,
    ) -> Result<bool, AppError>;
    async fn broadcast_data(&self, data: serde_json::Value) -> Result<(), AppError>;

    fn get_status(&self) -> PlatformStatus;
    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;

    /// Dispatch a platform-scoped request. Returns `Ok(None)` for actions
    /// the platform does not support.
    async fn handle_request(
        &self,
        request: PlatformRequest,
    ) -> Result<Option<PlatformResponse>, AppError>;
}
