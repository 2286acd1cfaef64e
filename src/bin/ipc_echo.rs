//! Child-side echo endpoint speaking the event protocol over stdio.
//!
//! - `ping`     → answers `pong` with the same arguments
//! - `echo`     → answers `echo` with the same arguments
//! - `shutdown` → exits
//!
//! Announces itself with `ready(pid)` on startup and exits when the parent
//! closes the channel.

use anyhow::Result;
use hexeo_ipc::{args, ChannelHandle, EventChannel, ProcessHandle, Value, DISCONNECT_EVENT};
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::mpsc;

enum Command {
    Reply(&'static str, Vec<Value>),
    Shutdown,
}

fn forward(channel: &EventChannel, event: &str, reply: &'static str, tx: &mpsc::UnboundedSender<Command>) {
    let tx = tx.clone();
    channel.on(event, move |args| {
        let _ = tx.send(Command::Reply(reply, args.to_vec()));
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // env_logger writes to stderr, stdout carries the channel
    env_logger::init();

    let handle = Arc::new(ProcessHandle::stdio());
    let channel = EventChannel::new(handle.clone())?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    // 読み取りは最初の channel.on で始まるので、切断リスナーを先に登録
    if let Some(events) = handle.events() {
        let disconnect_tx = tx.clone();
        events.on(DISCONNECT_EVENT, move |_| {
            let _ = disconnect_tx.send(Command::Shutdown);
        });
    }

    forward(&channel, "ping", "pong", &tx);
    forward(&channel, "echo", "echo", &tx);
    channel.on("shutdown", move |_| {
        let _ = tx.send(Command::Shutdown);
    });

    channel.emit("ready", args![std::process::id()]).await?;
    info!("ipc_echo ready");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Reply(event, args) => {
                debug!("Replying with '{}'", event);
                if let Err(e) = channel.emit(event, args).await {
                    error!("Failed to reply with '{}': {}", event, e);
                }
            }
            Command::Shutdown => break,
        }
    }

    info!("ipc_echo shutting down");
    // A pending blocking read on stdin would keep the runtime from shutting down.
    std::process::exit(0)
}
