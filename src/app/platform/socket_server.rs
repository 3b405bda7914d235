use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::models::{Client, ClientUpdate};
use crate::app::platform::{PlatformConnectionOptions, PlatformEvent};

pub const DEFAULT_WS_PORT: u16 = 8891;

/// Commands accepted by the socket-server actor. All socket I/O lives behind
/// this channel; the owning platform never touches a socket directly.
#[derive(Debug)]
pub enum ServerCommand {
    Start {
        options: PlatformConnectionOptions,
    },
    Stop,
    SendData {
        client_id: String,
        data: serde_json::Value,
    },
    Broadcast {
        data: serde_json::Value,
    },
    UpdateClient {
        client_id: String,
        update: ClientUpdate,
    },
    Disconnect {
        client_id: String,
    },
    Ping {
        client_id: String,
    },
}

struct ClientHandle {
    client: Client,
    sender: mpsc::UnboundedSender<Message>,
    ping_sent_at: Option<Instant>,
}

type SharedClients = Arc<Mutex<HashMap<String, ClientHandle>>>;

/// Spawn the socket-server actor. Events flow back on `events`; the returned
/// sender is the only way to drive the server.
pub fn spawn_socket_server(events: mpsc::Sender<PlatformEvent>) -> mpsc::Sender<ServerCommand> {
    let (command_tx, mut command_rx) = mpsc::channel::<ServerCommand>(64);

    tokio::spawn(async move {
        let clients: SharedClients = Arc::new(Mutex::new(HashMap::new()));
        let mut listener_task: Option<JoinHandle<()>> = None;

        while let Some(command) = command_rx.recv().await {
            match command {
                ServerCommand::Start { options } => {
                    if let Some(task) = listener_task.take() {
                        task.abort();
                    }
                    let address = options
                        .address
                        .unwrap_or_else(|| "127.0.0.1".to_string());
                    let port = options.port.unwrap_or(DEFAULT_WS_PORT);
                    match TcpListener::bind((address.as_str(), port)).await {
                        Ok(listener) => {
                            let bound_port = listener
                                .local_addr()
                                .map(|addr| addr.port())
                                .unwrap_or(port);
                            info!(address, port = bound_port, "socket server listening");
                            let _ = events
                                .send(PlatformEvent::ServerStarted { port: bound_port })
                                .await;
                            listener_task = Some(tokio::spawn(accept_loop(
                                listener,
                                Arc::clone(&clients),
                                events.clone(),
                            )));
                        }
                        Err(err) => {
                            let _ = events
                                .send(PlatformEvent::Error(format!(
                                    "Failed to bind socket server on {address}:{port}: {err}"
                                )))
                                .await;
                        }
                    }
                }
                ServerCommand::Stop => {
                    if let Some(task) = listener_task.take() {
                        task.abort();
                    }
                    let dropped: Vec<Client> = {
                        let mut clients = lock_clients(&clients);
                        clients
                            .drain()
                            .map(|(_, handle)| {
                                let mut client = handle.client;
                                client.connected = false;
                                client.timestamp = Utc::now();
                                client
                            })
                            .collect()
                    };
                    for client in dropped {
                        let _ = events.send(PlatformEvent::ClientDisconnected(client)).await;
                    }
                    let _ = events.send(PlatformEvent::ClientList(Vec::new())).await;
                }
                ServerCommand::SendData { client_id, data } => {
                    send_text(&clients, &client_id, &data);
                }
                ServerCommand::Broadcast { data } => {
                    let message = Message::Text(data.to_string().into());
                    let clients = lock_clients(&clients);
                    for handle in clients.values() {
                        let _ = handle.sender.send(message.clone());
                    }
                }
                ServerCommand::UpdateClient { client_id, update } => {
                    let updated = {
                        let mut clients = lock_clients(&clients);
                        clients.get_mut(&client_id).map(|handle| {
                            handle.client.apply(update);
                            handle.client.clone()
                        })
                    };
                    if let Some(client) = updated {
                        let _ = events.send(PlatformEvent::ClientUpdated(client)).await;
                    }
                }
                ServerCommand::Disconnect { client_id } => {
                    // Dropping the handle closes the outbound channel, which
                    // ends the writer task and closes the socket.
                    let removed = lock_clients(&clients).remove(&client_id);
                    if let Some(handle) = removed {
                        let mut client = handle.client;
                        client.connected = false;
                        client.timestamp = Utc::now();
                        let _ = events.send(PlatformEvent::ClientDisconnected(client)).await;
                    }
                }
                ServerCommand::Ping { client_id } => {
                    let mut clients = lock_clients(&clients);
                    if let Some(handle) = clients.get_mut(&client_id) {
                        handle.ping_sent_at = Some(Instant::now());
                        let payload = serde_json::json!({ "type": "ping" });
                        let _ = handle.sender.send(Message::Text(payload.to_string().into()));
                    }
                }
            }
        }
    });

    command_tx
}

fn lock_clients(
    clients: &SharedClients,
) -> std::sync::MutexGuard<'_, HashMap<String, ClientHandle>> {
    clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn send_text(clients: &SharedClients, client_id: &str, data: &serde_json::Value) -> bool {
    let clients = lock_clients(clients);
    match clients.get(client_id) {
        Some(handle) => handle
            .sender
            .send(Message::Text(data.to_string().into()))
            .is_ok(),
        None => {
            debug!(client_id, "send requested for unknown socket client");
            false
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    clients: SharedClients,
    events: mpsc::Sender<PlatformEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    Arc::clone(&clients),
                    events.clone(),
                ));
            }
            Err(err) => {
                let _ = events
                    .send(PlatformEvent::Error(format!(
                        "Socket server accept failed: {err}"
                    )))
                    .await;
                return;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    clients: SharedClients,
    events: mpsc::Sender<PlatformEvent>,
) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(err) => {
            debug!(%peer, error = %err, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();

    let client_id = Uuid::new_v4().to_string();
    let (sender, mut outbound) = mpsc::unbounded_channel::<Message>();

    let client = {
        let mut client = Client::new(&client_id);
        client.connected = true;
        client
    };
    lock_clients(&clients).insert(
        client_id.clone(),
        ClientHandle {
            client: client.clone(),
            sender,
            ping_sent_at: None,
        },
    );
    debug!(%peer, client_id, "socket client connected");
    let _ = events.send(PlatformEvent::ClientConnected(client)).await;

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_text_message(&client_id, &text, &clients, &events).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(client_id, error = %err, "socket read failed");
                break;
            }
        }
    }

    let removed = lock_clients(&clients).remove(&client_id);
    writer.abort();
    if let Some(handle) = removed {
        let mut client = handle.client;
        client.connected = false;
        client.timestamp = Utc::now();
        let _ = events.send(PlatformEvent::ClientDisconnected(client)).await;
    }
}

async fn handle_text_message(
    client_id: &str,
    text: &str,
    clients: &SharedClients,
    events: &mpsc::Sender<PlatformEvent>,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            debug!(client_id, error = %err, "discarding non-JSON socket message");
            return;
        }
    };

    match value.get("type").and_then(|kind| kind.as_str()) {
        Some("manifest") => {
            let manifest = value
                .get("payload")
                .cloned()
                .and_then(|payload| serde_json::from_value(payload).ok());
            if manifest.is_none() {
                warn!(client_id, "manifest message carried an invalid payload");
            }
            let updated = {
                let mut clients = lock_clients(clients);
                clients.get_mut(client_id).map(|handle| {
                    if let Some(manifest) = manifest {
                        handle.client.manifest = Some(manifest);
                    }
                    handle.client.timestamp = Utc::now();
                    handle.client.clone()
                })
            };
            if let Some(client) = updated {
                let _ = events.send(PlatformEvent::ClientUpdated(client)).await;
            }
        }
        Some("ping") => {
            let payload = serde_json::json!({ "type": "pong" });
            send_text(clients, client_id, &payload);
        }
        Some("pong") => {
            let latency_ms = {
                let mut clients = lock_clients(clients);
                clients
                    .get_mut(client_id)
                    .and_then(|handle| handle.ping_sent_at.take())
                    .map(|sent_at| sent_at.elapsed().as_millis() as u64)
            };
            if let Some(latency_ms) = latency_ms {
                let _ = events
                    .send(PlatformEvent::ClientPong {
                        client_id: client_id.to_string(),
                        latency_ms,
                    })
                    .await;
            }
        }
        _ => {
            let _ = events
                .send(PlatformEvent::DataReceived {
                    client_id: client_id.to_string(),
                    payload: value,
                })
                .await;
        }
    }
}
