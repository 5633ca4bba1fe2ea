//! One worker generation and its Exit Watcher.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{Channel, Token};
use crate::error::ChannelError;
use crate::launcher::WorkerProcess;
use crate::spawner::Spawned;

/// Sent by an Exit Watcher once its worker process is gone.
#[derive(Debug)]
pub struct Exited {
    pub generation: u64,
    pub pid: Option<u32>,
    pub status: io::Result<ExitStatus>,
}

/// A promoted worker: its channel, a kill trigger, and its Exit Watcher.
pub(crate) struct Generation {
    id: u64,
    pid: Option<u32>,
    channel: Channel,
    kill: oneshot::Sender<()>,
    watcher: JoinHandle<()>,
}

impl Generation {
    /// Promotes a ready worker and starts watching for its exit.
    pub(crate) fn start(id: u64, spawned: Spawned, exits: mpsc::UnboundedSender<Exited>) -> Self {
        let Spawned { process, channel } = spawned;
        let pid = process.id();
        let (kill, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(id, process, kill_rx, exits));
        Self {
            id,
            pid,
            channel,
            kill,
            watcher,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Asks the worker to exit, then kills it regardless, then joins its
    /// Exit Watcher.
    ///
    /// A worker that acknowledges gets up to `drain` to exit by itself before
    /// the kill lands. Total time is bounded by `reply_timeout + drain`.
    pub(crate) async fn retire(self, reply_timeout: Duration, drain: Duration) {
        let Generation {
            id,
            pid,
            mut channel,
            kill,
            mut watcher,
        } = self;
        info!("retiring worker {pid:?} (generation {id})");

        let replied =
            match tokio::time::timeout(reply_timeout, request_exit(&mut channel)).await {
                Ok(Ok(true)) => {
                    info!("worker {pid:?} acknowledged {}", Token::ExitRequest);
                    true
                }
                Ok(Ok(false)) => {
                    warn!("worker {pid:?} closed its channel without {}", Token::ExitReply);
                    false
                }
                Ok(Err(err)) => {
                    warn!("exit handshake with worker {pid:?} failed: {err}");
                    false
                }
                Err(_) => {
                    warn!("worker {pid:?} sent no {} within {reply_timeout:?}", Token::ExitReply);
                    false
                }
            };
        drop(channel);

        let finished = if replied {
            match tokio::time::timeout(drain, &mut watcher).await {
                Ok(joined) => {
                    log_join(pid, joined);
                    true
                }
                Err(_) => false,
            }
        } else {
            false
        };

        // Backstop: harmless when the watcher already saw the exit.
        let _ = kill.send(());
        if !finished {
            log_join(pid, watcher.await);
        }
    }

    /// Joins the watcher of a worker that has already exited.
    pub(crate) async fn reap(self) {
        let Generation { pid, watcher, .. } = self;
        log_join(pid, watcher.await);
    }
}

async fn request_exit(channel: &mut Channel) -> Result<bool, ChannelError> {
    channel.send(Token::ExitRequest).await?;
    let mut replied = false;
    channel
        .read(|token| {
            replied = token == Token::ExitReply;
            !replied
        })
        .await?;
    Ok(replied)
}

fn log_join(pid: Option<u32>, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!("exit watcher for worker {pid:?} failed: {err}");
    }
}

/// Exit Watcher: waits for the process (or a kill request), then reports.
///
/// A dropped kill trigger counts as a kill request, so an abandoned
/// generation never outlives its handle.
async fn watch(
    id: u64,
    mut process: Box<dyn WorkerProcess>,
    kill: oneshot::Receiver<()>,
    exits: mpsc::UnboundedSender<Exited>,
) {
    let pid = process.id();
    let status = tokio::select! {
        status = process.wait() => status,
        _ = kill => {
            debug!("killing worker {pid:?} (generation {id})");
            if let Err(err) = process.start_kill() {
                warn!("failed to kill worker {pid:?}: {err}");
            }
            process.wait().await
        }
    };
    match &status {
        Ok(status) => info!("worker {pid:?} (generation {id}) exited: {status}"),
        Err(err) => error!("failed to wait for worker {pid:?} (generation {id}): {err}"),
    }
    if exits
        .send(Exited {
            generation: id,
            pid,
            status,
        })
        .is_err()
    {
        debug!("supervisor gone; exit of generation {id} unreported");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::Launcher;
    use crate::testing::{Behavior, FakeLauncher};
    use std::sync::Arc;

    fn promote(
        launcher: &Arc<FakeLauncher>,
        exits: mpsc::UnboundedSender<Exited>,
    ) -> Generation {
        let launched = launcher.launch(&["worker".to_string()], &[]).unwrap();
        let spawned = Spawned {
            process: launched.process,
            channel: launched.channel,
        };
        Generation::start(7, spawned, exits)
    }

    #[tokio::test]
    async fn test_watcher_reports_unplanned_exit() {
        let launcher = FakeLauncher::scripted(vec![Behavior::CrashAfterReady]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generation = promote(&launcher, tx);

        let exited = rx.recv().await.unwrap();
        assert_eq!(exited.generation, 7);
        assert_eq!(exited.status.unwrap().code(), Some(1));
        generation.reap().await;
    }

    #[tokio::test]
    async fn test_retire_cooperative_worker() {
        let launcher = FakeLauncher::healthy();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generation = promote(&launcher, tx);

        generation
            .retire(Duration::from_secs(1), Duration::from_secs(1))
            .await;
        let exited = rx.try_recv().unwrap();
        assert_eq!(exited.status.unwrap().code(), Some(0));
        assert_eq!(launcher.reaped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_kills_worker_that_never_replies() {
        let launcher = FakeLauncher::scripted(vec![Behavior::IgnoreExitRequest]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generation = promote(&launcher, tx);

        generation
            .retire(Duration::from_secs(3), Duration::from_secs(3))
            .await;
        let exited = rx.try_recv().unwrap();
        let status = exited.status.unwrap();
        assert_eq!(status.code(), None);
        assert_eq!(launcher.reaped(), 1);
    }

    #[tokio::test]
    async fn test_dropped_generation_is_killed() {
        let launcher = FakeLauncher::scripted(vec![Behavior::IgnoreExitRequest]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(promote(&launcher, tx));

        let exited = rx.recv().await.unwrap();
        assert!(exited.status.unwrap().code().is_none());
    }
}
