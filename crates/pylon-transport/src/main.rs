//! Pylon host binary.
//!
//! Run with: cargo run -p pylon-transport
//!
//! Environment:
//! - `PYLON_PORT` - local fan-out port (default 9395)
//! - `PYLON_RELAY_URL` - relay WebSocket URL (default ws://127.0.0.1:9393/ws)
//! - `PYLON_DEVICE_ID` - this pylon's device id (default: random)
//! - `PYLON_DATA_DIR` - state directory (default: platform data dir)

use std::{path::PathBuf, sync::Arc};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pylon_agent::{Arbitrator, EchoBackend, SessionEngine};
use pylon_blob::BlobEngine;
use pylon_core::MessageStore;
use pylon_tasks::{Orchestrator, TaskStore, WorkspaceStore};
use pylon_transport::{
    Dispatcher, LocalConfig, LocalFanout, RelayClient, RelayClientConfig, SessionTaskRunner,
    serve_local,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let device_id = std::env::var("PYLON_DEVICE_ID")
        .unwrap_or_else(|_| uuid::Uuid::new_v4().simple().to_string());
    let relay_url = std::env::var("PYLON_RELAY_URL")
        .unwrap_or_else(|_| "ws://127.0.0.1:9393/ws".to_string());
    let data_dir = std::env::var("PYLON_DATA_DIR").map_or_else(
        |_| BlobEngine::default_root().parent().map_or_else(
            || PathBuf::from(".pylon"),
            std::path::Path::to_path_buf,
        ),
        PathBuf::from,
    );

    let store = Arc::new(MessageStore::open(data_dir.join("messages"))?);
    let workspaces = Arc::new(WorkspaceStore::open(data_dir.clone())?);
    let tasks = Arc::new(TaskStore::open(data_dir.clone())?);
    let blobs = Arc::new(BlobEngine::new(data_dir.join("blobs")));
    let engine = Arc::new(SessionEngine::new(
        Arc::new(EchoBackend),
        Arc::new(Arbitrator::default()),
        Arc::clone(&store),
    ));
    let relay = Arc::new(RelayClient::new(RelayClientConfig::new(
        relay_url,
        device_id.clone(),
        format!("pylon-{device_id}"),
    )));

    let dispatcher = Arc::new(Dispatcher::new(
        device_id.clone(),
        Arc::new(LocalFanout::new()),
        relay,
        Arc::clone(&engine),
        store,
        blobs,
        Arc::clone(&workspaces),
    ));
    dispatcher.spawn_pumps();

    // Resume queued work left over from a previous run.
    let orchestrator = Arc::new(Orchestrator::new(
        tasks,
        Arc::new(SessionTaskRunner::new(engine, Arc::clone(&workspaces))),
    ));
    let mut workspace_ids: Vec<String> = workspaces
        .desk_list()
        .into_iter()
        .map(|d| d.workspace_id)
        .collect();
    workspace_ids.dedup();
    for workspace_id in workspace_ids {
        if let Err(e) = orchestrator.start(&workspace_id).await {
            tracing::warn!("Failed to resume tasks for {workspace_id}: {e}");
        }
    }

    let relay_loop = Arc::clone(&dispatcher);
    tokio::spawn(async move { relay_loop.run_relay().await });

    // Local bind failure is the one fatal startup error.
    serve_local(dispatcher, LocalConfig::from_env(device_id)).await?;
    Ok(())
}
