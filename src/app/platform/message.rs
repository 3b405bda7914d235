use serde::{Deserialize, Serialize};

use crate::app::models::{Client, ClientManifest, PlatformId};

/// Platform-scoped request envelope: routed to the platform named in
/// `platform`, which dispatches on the action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformRequest {
    pub platform: PlatformId,
    #[serde(flatten)]
    pub action: PlatformAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformAction {
    GetManifest { adb_id: String },
    SetManifest { manifest: serde_json::Value },
    SetSupervisor { adb_id: String, service: String, enabled: bool },
    PushStaged { adb_id: String },
    Refresh,
    Run { adb_id: Option<String>, command: String },
    Configure { adb_id: String },
    SetBrightness { adb_id: String, percent: u8 },
    GetBrightness { adb_id: String },
    RestartDevice { adb_id: String },
    ShutdownDevice { adb_id: String },
    Disconnect { client_id: String },
    Ping { client_id: String },
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PlatformResponse {
    Manifest(ClientManifest),
    Clients(Vec<Client>),
    Output(String),
    Brightness(u8),
    Pong { latency_ms: Option<u64> },
    Ack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_round_trips() {
        let raw = r#"{"platform":"adb","type":"run","adb_id":"dev1","command":"shell ls"}"#;
        let request: PlatformRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(request.platform, PlatformId::Adb);
        match request.action {
            PlatformAction::Run { ref adb_id, ref command } => {
                assert_eq!(adb_id.as_deref(), Some("dev1"));
                assert_eq!(command, "shell ls");
            }
            ref other => panic!("unexpected action: {other:?}"),
        }

        let encoded = serde_json::to_value(&request).expect("encode");
        assert_eq!(encoded["platform"], "adb");
        assert_eq!(encoded["type"], "run");
    }

    #[test]
    fn unit_actions_need_no_payload() {
        let raw = r#"{"platform":"websocket","type":"restart"}"#;
        let request: PlatformRequest = serde_json::from_str(raw).expect("parse");
        assert!(matches!(request.action, PlatformAction::Restart));
    }
}
