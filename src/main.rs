use std::sync::Arc;

use tracing::{error, info, warn};

use deskbridge::app::adb::service::AdbService;
use deskbridge::app::config::ConfigStore;
use deskbridge::app::error::AppError;
use deskbridge::app::logging::init_logging;
use deskbridge::app::platform::adb_platform::AdbPlatform;
use deskbridge::app::platform::store::PlatformStore;
use deskbridge::app::platform::websocket::WebSocketPlatform;
use deskbridge::app::platform::{PlatformConnectionOptions, PlatformEvent};
use deskbridge::app::progress::ProgressBus;
use deskbridge::app::staging::{NoClientReleases, StagedClient};

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        error!(error = %err, "deskbridge exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = ConfigStore::load()?;
    let settings = config.get();
    info!(
        ws_port = settings.server.ws_port,
        auto_detect = settings.adb.auto_detect,
        "starting deskbridge"
    );

    let progress = Arc::new(ProgressBus::new());
    spawn_progress_logger(&progress);

    let staged = Arc::new(StagedClient::new(settings.staging_dir()));
    let adb_service = Arc::new(AdbService::new(
        config.watch(),
        Arc::clone(&progress),
        Arc::clone(&staged),
        Arc::new(NoClientReleases),
    ));

    let platforms = Arc::new(PlatformStore::new());
    platforms.register(Arc::new(WebSocketPlatform::new(Arc::clone(&progress))));
    platforms.register(Arc::new(AdbPlatform::new(
        adb_service,
        Arc::clone(&progress),
        config.watch(),
    )));

    spawn_platform_logger(&platforms);

    platforms
        .start_all(PlatformConnectionOptions {
            address: Some(settings.server.address.clone()),
            port: Some(settings.server.ws_port),
        })
        .await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::system(format!("Failed to listen for shutdown: {err}"), ""))?;
    info!("shutting down");

    platforms.stop_all().await;
    platforms.shutdown();
    Ok(())
}

/// Surface progress events in the structured log until a UI transport is
/// attached.
fn spawn_progress_logger(progress: &Arc<ProgressBus>) {
    let mut events = progress.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    channel = ?event.channel,
                    status = ?event.status,
                    progress = ?event.progress,
                    operation = %event.operation,
                    "{}",
                    event.message
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress log stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn spawn_platform_logger(platforms: &Arc<PlatformStore>) {
    let mut events = platforms.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok((platform, event)) => match event {
                    PlatformEvent::ClientConnected(client) => {
                        info!(%platform, client_id = %client.id, "client connected");
                    }
                    PlatformEvent::ClientDisconnected(client) => {
                        info!(%platform, client_id = %client.id, "client disconnected");
                    }
                    PlatformEvent::Error(message) => {
                        warn!(%platform, message, "platform error");
                    }
                    PlatformEvent::ServerStarted { port } => {
                        info!(%platform, port, "platform server started");
                    }
                    _ => {}
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "platform log stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}
