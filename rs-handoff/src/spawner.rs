//! Worker Spawner: argument vector, handle numbering, readiness handshake.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ReadEnd, Token, CHANNEL_WRITE_FD};
use crate::error::SpawnError;
use crate::launcher::{InheritedFd, Launched, Launcher, WorkerProcess};
use crate::sockets::ListeningSockets;

/// Appended to the argument vector of every worker.
pub const CHILD_FLAG: &str = "--child";
/// Carries the JSON `{name: fd}` map of inherited listeners.
pub const BOOTSTRAP_ARGS_FLAG: &str = "--bootstrap-args";
/// Listeners are numbered upward from here, right after the channel.
pub const FIRST_LISTENER_FD: RawFd = CHANNEL_WRITE_FD + 1;

/// Inherited listener numbering, as carried by `--bootstrap-args`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BootstrapArgs {
    pub listeners: BTreeMap<String, RawFd>,
}

impl BootstrapArgs {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A worker that reported `ReadyOK` and is ready to be promoted.
pub struct Spawned {
    pub process: Box<dyn WorkerProcess>,
    pub channel: Channel,
}

pub struct Spawner {
    args: Arc<[String]>,
    launcher: Arc<dyn Launcher>,
    ready_timeout: Option<Duration>,
}

impl Spawner {
    /// `args` is the supervisor's original argument vector, program first.
    pub fn new(
        args: Arc<[String]>,
        launcher: Arc<dyn Launcher>,
        ready_timeout: Option<Duration>,
    ) -> Self {
        Self {
            args,
            launcher,
            ready_timeout,
        }
    }

    /// Builds the worker argument vector and its descriptor plan.
    pub fn command_line(
        &self,
        sockets: &ListeningSockets,
    ) -> Result<(Vec<String>, Vec<InheritedFd>), SpawnError> {
        let mut inherited = Vec::with_capacity(sockets.len());
        let mut bootstrap = BootstrapArgs::default();
        for ((name, source), target) in sockets.descriptors().zip(FIRST_LISTENER_FD..) {
            inherited.push(InheritedFd { source, target });
            bootstrap.listeners.insert(name.to_string(), target);
        }

        let mut args = self.args.to_vec();
        args.push(CHILD_FLAG.to_string());
        args.push(format!(
            "{BOOTSTRAP_ARGS_FLAG}={}",
            serde_json::to_string(&bootstrap)?
        ));
        Ok((args, inherited))
    }

    /// Starts a worker and blocks until it reports readiness.
    ///
    /// On any failure the worker is killed and reaped before returning.
    pub async fn spawn(&self, sockets: &ListeningSockets) -> Result<Spawned, SpawnError> {
        let (args, inherited) = self.command_line(sockets)?;
        let Launched {
            mut process,
            mut channel,
        } = self
            .launcher
            .launch(&args, &inherited)
            .map_err(SpawnError::Launch)?;
        let pid = process.id();
        info!("worker {pid:?} started, waiting for readiness");

        match self.await_ready(&mut channel).await {
            Ok(()) => {
                info!("worker {pid:?} reported {}", Token::ReadyOk);
                Ok(Spawned { process, channel })
            }
            Err(err) => {
                error!("worker {pid:?} failed to become ready: {err}");
                drop(channel);
                discard(process.as_mut()).await;
                Err(err)
            }
        }
    }

    async fn await_ready(&self, channel: &mut Channel) -> Result<(), SpawnError> {
        let mut verdict = None;
        let read = channel.read(|token| match token {
            Token::ReadyOk | Token::ReadyError => {
                verdict = Some(token);
                false
            }
            other => {
                debug!("ignoring {other} while waiting for readiness");
                true
            }
        });
        let end = match self.ready_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| SpawnError::TimedOut(limit))??,
            None => read.await?,
        };

        match (end, verdict) {
            (ReadEnd::Stopped, Some(Token::ReadyOk)) => Ok(()),
            (ReadEnd::Stopped, _) => Err(SpawnError::Refused),
            (ReadEnd::Closed, _) => Err(SpawnError::Closed),
        }
    }
}

/// Kills a worker that will never be promoted and reaps it.
async fn discard(process: &mut dyn WorkerProcess) {
    if let Err(err) = process.start_kill() {
        warn!("failed to kill worker {:?}: {err}", process.id());
    }
    match process.wait().await {
        Ok(status) => debug!("discarded worker {:?} exited: {status}", process.id()),
        Err(err) => warn!("failed to reap worker {:?}: {err}", process.id()),
    }
}
