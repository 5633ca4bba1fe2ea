//! Supervisor signal dispatch.
//!
//! - SIGINT/SIGTERM: planned shutdown
//! - SIGUSR2: live upgrade

use std::io;

use log::info;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

/// What the supervising loop is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Shutdown,
    Upgrade,
}

pub struct SignalDispatcher {
    sigint: Signal,
    sigterm: Signal,
    sigusr2: Signal,
}

impl SignalDispatcher {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigusr2: signal(SignalKind::user_defined2())?,
        })
    }

    /// Waits for the next signal of interest.
    pub async fn wait(&mut self) -> Command {
        tokio::select! {
            _ = self.sigint.recv() => {
                info!("received SIGINT");
                Command::Shutdown
            }
            _ = self.sigterm.recv() => {
                info!("received SIGTERM");
                Command::Shutdown
            }
            _ = self.sigusr2.recv() => {
                info!("received SIGUSR2");
                Command::Upgrade
            }
        }
    }

    /// Forwards signals as [`Command`]s until the receiver is dropped.
    pub fn spawn_forwarder(mut self) -> mpsc::Receiver<Command> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            loop {
                let command = self.wait().await;
                if tx.send(command).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}
