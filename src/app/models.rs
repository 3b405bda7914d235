use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformId {
    Websocket,
    Adb,
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformId::Websocket => write!(f, "websocket"),
            PlatformId::Adb => write!(f, "adb"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    Websocket,
    Adb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Detect,
    Configure,
    Communicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Compatibility {
    pub server: String,
    pub app: String,
}

impl Default for Compatibility {
    fn default() -> Self {
        Self {
            server: ">=0.0.0".to_string(),
            app: ">=0.0.0".to_string(),
        }
    }
}

/// Connection details embedded in a client manifest. For staged bundles this
/// is rewritten to point at the device it is being pushed to, then restored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConnectionContext {
    pub method: Option<ConnectionMethod>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub adb_id: Option<String>,
    pub app_version: Option<String>,
    pub usid: Option<String>,
    pub mac_bt: Option<String>,
    #[serde(default)]
    pub services: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub compatibility: Compatibility,
    #[serde(default)]
    pub context: ConnectionContext,
}

/// A connected consumer of the bridge: a socket peer or an ADB-attached
/// device. `id` is unique within one platform's roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Client {
    pub id: String,
    pub connection_id: String,
    pub adb_id: Option<String>,
    pub connected: bool,
    pub timestamp: DateTime<Utc>,
    pub manifest: Option<ClientManifest>,
    pub current_app: Option<String>,
    pub miniplayer: Option<String>,
    pub default_view: Option<String>,
}

impl Client {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            adb_id: None,
            connected: false,
            timestamp: Utc::now(),
            manifest: None,
            current_app: None,
            miniplayer: None,
            default_view: None,
        }
    }

    /// Merge a partial update into this client. Absent fields are left alone.
    pub fn apply(&mut self, update: ClientUpdate) {
        if let Some(connected) = update.connected {
            self.connected = connected;
        }
        if let Some(timestamp) = update.timestamp {
            self.timestamp = timestamp;
        }
        if let Some(manifest) = update.manifest {
            self.manifest = Some(manifest);
        }
        if let Some(current_app) = update.current_app {
            self.current_app = Some(current_app);
        }
        if let Some(miniplayer) = update.miniplayer {
            self.miniplayer = Some(miniplayer);
        }
        if let Some(default_view) = update.default_view {
            self.default_view = Some(default_view);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientUpdate {
    pub connected: Option<bool>,
    pub timestamp: Option<DateTime<Utc>>,
    pub manifest: Option<ClientManifest>,
    pub current_app: Option<String>,
    pub miniplayer: Option<String>,
    pub default_view: Option<String>,
}

impl ClientUpdate {
    pub fn seen_now(connected: bool) -> Self {
        Self {
            connected: Some(connected),
            timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }
}

/// One row of `adb devices -l` output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdbDevice {
    pub adb_id: String,
    pub state: String,
    pub offline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformStatus {
    pub is_active: bool,
    pub clients: Vec<Client>,
    pub uptime_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_merges_only_present_fields() {
        let mut client = Client::new("dev1");
        client.adb_id = Some("dev1".to_string());
        client.connected = true;
        client.current_app = Some("music".to_string());

        client.apply(ClientUpdate {
            connected: Some(false),
            ..ClientUpdate::default()
        });

        assert!(!client.connected);
        assert_eq!(client.adb_id.as_deref(), Some("dev1"));
        assert_eq!(client.current_app.as_deref(), Some("music"));
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = ClientManifest {
            id: "dev1".to_string(),
            name: "Superbird Device".to_string(),
            description: None,
            version: "0.11.0".to_string(),
            compatibility: Compatibility::default(),
            context: ConnectionContext {
                method: Some(ConnectionMethod::Adb),
                adb_id: Some("dev1".to_string()),
                ip: Some("localhost".to_string()),
                port: Some(8891),
                ..ConnectionContext::default()
            },
        };
        let raw = serde_json::to_string(&manifest).expect("serialize");
        let parsed: ClientManifest = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed, manifest);
    }
}
