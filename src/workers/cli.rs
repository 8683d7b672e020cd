//! The `send`, `receive` and `demo` flows of the binary.
//!
//! Each flow owns one [`TransferEngine`] and reacts to its events; no
//! transfer logic lives here.

use crate::core::connection::{
    ConnectionState, LoopbackNetwork, ManualSignaling, Signaling, WebRtcTransport,
};
use crate::core::engine::{EngineEvent, TransferEngine};
use crate::core::pipeline::StagedFile;
use crate::core::queue::{FileTransfer, TransferStatus};
use crate::core::protocol::TransferId;
use crate::utils::files::write_received;
use crate::workers::args::{Args, Command, Settings};
use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

type Events = mpsc::UnboundedReceiver<EngineEvent>;

pub async fn run(args: Args) -> Result<()> {
    let settings = args.settings()?;
    match args.command {
        Command::Send { files, peer } => send(&settings, &files, &peer).await,
        Command::Receive { out, id } => receive(&settings, &out, id.as_deref()).await,
        Command::Demo { files, out } => demo(&settings, &files, &out).await,
    }
}

/// Engine over WebRTC with copy/paste signaling on stdin/stdout.
fn webrtc_engine(settings: &Settings) -> Result<(TransferEngine, Events)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let signaling: Arc<dyn Signaling> = Arc::new(ManualSignaling::stdio());
    let transport =
        WebRtcTransport::new(signaling.clone()).with_ice_servers(settings.ice_servers.clone());
    let engine = TransferEngine::new(settings.engine.clone(), signaling, Arc::new(transport), Some(tx))?;
    Ok((engine, rx))
}

async fn stage_all(engine: &TransferEngine, files: &[PathBuf]) -> Result<HashSet<TransferId>> {
    let mut ids = HashSet::new();
    for path in files {
        let staged = StagedFile::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let transfer = engine.stage(staged);
        println!("staged {} ({} bytes)", transfer.file_name, transfer.byte_length);
        ids.insert(transfer.id);
    }
    Ok(ids)
}

// ── Send ─────────────────────────────────────────────────────────────────────

async fn send(settings: &Settings, files: &[PathBuf], peer: &str) -> Result<()> {
    let (engine, mut events) = webrtc_engine(settings)?;
    let ids = stage_all(&engine, files).await?;

    engine.connect_to(peer).await.context("connecting to peer")?;
    println!("connected, sending {} file(s)", ids.len());
    engine.start_all()?;

    let outcome = tokio::select! {
        r = wait_for_transfers(&mut events, ids) => r,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    };
    if let Some(stats) = engine.wire_stats() {
        info!(
            event = "wire_stats",
            frames = stats.frames_sent,
            bytes = stats.bytes_sent,
            pauses = stats.pauses
        );
    }
    engine.disconnect().await;
    outcome
}

/// Follow outbound transfers until each one is done or failed.
async fn wait_for_transfers(events: &mut Events, mut pending: HashSet<TransferId>) -> Result<()> {
    let mut failed = 0usize;
    let mut last_percent = HashSet::new();
    while !pending.is_empty() {
        let Some(event) = events.recv().await else {
            return Err(anyhow!("engine stopped"));
        };
        let EngineEvent::Transfer(transfer) = event else {
            continue;
        };
        if !pending.contains(&transfer.id) {
            continue;
        }
        match transfer.status {
            TransferStatus::Done | TransferStatus::Failed => {
                report(&transfer);
                if transfer.status == TransferStatus::Failed {
                    failed += 1;
                }
                pending.remove(&transfer.id);
            }
            TransferStatus::Transferring => {
                // One line per 10% step.
                let step = (transfer.progress * 10.0) as u8;
                if step > 0 && last_percent.insert((transfer.id, step)) {
                    println!("  {} {}%", transfer.file_name, u32::from(step) * 10);
                }
            }
            TransferStatus::Queued => {}
        }
    }
    match failed {
        0 => Ok(()),
        n => Err(anyhow!("{n} transfer(s) failed")),
    }
}

fn report(transfer: &FileTransfer) {
    match (&transfer.status, &transfer.error) {
        (TransferStatus::Done, _) => {
            println!("done    {} ({} bytes)", transfer.file_name, transfer.byte_length)
        }
        (_, Some(error)) => println!("failed  {}: {error}", transfer.file_name),
        (status, None) => println!("{status:?} {}", transfer.file_name),
    }
}

// ── Receive ──────────────────────────────────────────────────────────────────

async fn receive(settings: &Settings, out: &Path, id: Option<&str>) -> Result<()> {
    let (engine, mut events) = webrtc_engine(settings)?;
    engine.begin_negotiation(id).await.context("publishing local descriptor")?;
    engine.accept().await.context("waiting for peer")?;
    println!("connected, saving files to {}", out.display());

    let outcome = tokio::select! {
        r = save_incoming(&engine, &mut events, out) => r,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };
    engine.disconnect().await;
    outcome
}

/// Write every received file to `out` until the connection ends.
async fn save_incoming(engine: &TransferEngine, events: &mut Events, out: &Path) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::FileReceived { .. } => {
                for file in engine.take_received() {
                    let path = write_received(out, &file.file_name, &file.data).await?;
                    println!("saved   {} ({} bytes)", path.display(), file.data.len());
                }
            }
            EngineEvent::Transfer(transfer) if transfer.status == TransferStatus::Failed => {
                report(&transfer);
            }
            EngineEvent::ProtocolViolation { error, .. } => {
                println!("peer protocol error: {error}");
            }
            EngineEvent::Connection(state)
                if matches!(state.state, ConnectionState::Error | ConnectionState::Closed) =>
            {
                println!("peer disconnected");
                return Ok(());
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Demo ─────────────────────────────────────────────────────────────────────

async fn demo(settings: &Settings, files: &[PathBuf], out: &Path) -> Result<()> {
    let network = LoopbackNetwork::new();

    let (tx, mut sender_events) = mpsc::unbounded_channel();
    let endpoint = network.endpoint();
    let sender = TransferEngine::new(settings.engine.clone(), endpoint.clone(), endpoint, Some(tx))?;

    let (tx, mut receiver_events) = mpsc::unbounded_channel();
    let endpoint = network.endpoint();
    let receiver =
        TransferEngine::new(settings.engine.clone(), endpoint.clone(), endpoint, Some(tx))?;

    let state = receiver.begin_negotiation(Some("demo-receiver")).await?;
    let acceptor = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.accept().await })
    };
    sender.connect_to("demo-receiver").await?;
    acceptor.await??;
    println!(
        "connected through {}",
        state.share_token.as_deref().unwrap_or("loopback")
    );

    let ids = stage_all(&sender, files).await?;
    let saver = {
        let receiver = receiver.clone();
        let out = out.to_path_buf();
        tokio::spawn(async move { save_incoming(&receiver, &mut receiver_events, &out).await })
    };

    sender.start_all()?;
    let outcome = wait_for_transfers(&mut sender_events, ids).await;
    sender.disconnect().await;
    saver.await??;
    receiver.disconnect().await;
    outcome
}
