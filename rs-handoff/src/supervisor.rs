//! Generation Swapper and restart policy.
//!
//! All replacements go through [`Supervisor::replace`], which holds the swap
//! lock for its whole duration, so at most one is in flight and the current
//! generation only changes once a successor has reported `ReadyOK`.
//!
//! Exit Watchers only observe; classification and crash restarts happen in
//! the single task driving [`Supervisor::run`]:
//!
//! ```text
//! exit ─┬─ upgradeRequested (consumed) ─► UpgradePath   (already superseded)
//!       ├─ shutdownRequested ───────────► ShutdownPath
//!       ├─ not the current generation ──► ignored
//!       └─ budget -= 1 ─┬─ budget >= 0 ─► CrashRetryPath (replace, loop)
//!                       └─ budget < 0 ──► CrashFatalPath (run returns Err)
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use sd_notify::NotifyState;
use tokio::sync::{mpsc, Mutex};

use crate::config::SupervisorConfig;
use crate::error::{SpawnError, SupervisorError};
use crate::generation::{Exited, Generation};
use crate::launcher::Launcher;
use crate::signals::Command;
use crate::sockets::ListeningSockets;
use crate::spawner::Spawner;

/// Result of a successful [`Supervisor::replace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replaced {
    pub generation: u64,
    /// The generation that was retired to make room, if any.
    pub retired: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Upgraded(u64),
    /// Another upgrade holds the flag; this trigger was dropped.
    AlreadyInFlight,
    /// The successor never became ready; the previous generation still serves.
    Failed,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitPath {
    Upgrade,
    Shutdown,
    Stale,
    CrashRetry { remaining: i64 },
    CrashFatal,
}

pub struct Supervisor {
    config: SupervisorConfig,
    spawner: Spawner,
    sockets: Arc<ListeningSockets>,
    upgrade_requested: AtomicBool,
    shutdown_requested: AtomicBool,
    budget: AtomicI64,
    next_generation: AtomicU64,
    current: Mutex<Option<Generation>>,
    exits_tx: mpsc::UnboundedSender<Exited>,
    exits_rx: Mutex<mpsc::UnboundedReceiver<Exited>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        sockets: Arc<ListeningSockets>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let spawner = Spawner::new(config.args.clone(), launcher, config.ready_timeout);
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            budget: AtomicI64::new(i64::from(config.restart_budget)),
            config,
            spawner,
            sockets,
            upgrade_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            current: Mutex::new(None),
            exits_tx,
            exits_rx: Mutex::new(exits_rx),
        }
    }

    pub async fn current_generation(&self) -> Option<u64> {
        self.current.lock().await.as_ref().map(Generation::id)
    }

    /// Restarts left before the next unplanned exit becomes fatal.
    pub fn restarts_remaining(&self) -> i64 {
        self.budget.load(Ordering::SeqCst)
    }

    pub fn upgrade_in_flight(&self) -> bool {
        self.upgrade_requested.load(Ordering::SeqCst)
    }

    /// Spawns a successor and, once it is ready, retires the current
    /// generation and promotes the successor.
    ///
    /// On failure nothing changes: the current generation keeps serving.
    pub async fn replace(&self) -> Result<Replaced, SpawnError> {
        let mut current = self.current.lock().await;

        let spawned = match self.spawner.spawn(&self.sockets).await {
            Ok(spawned) => spawned,
            Err(err) => {
                warn!(
                    "replacement failed, generation {:?} stays current: {err}",
                    current.as_ref().map(Generation::id)
                );
                return Err(err);
            }
        };

        let retired = match current.take() {
            Some(previous) => {
                let id = previous.id();
                previous
                    .retire(self.config.exit_timeout, self.config.drain_timeout)
                    .await;
                Some(id)
            }
            None => None,
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let promoted = Generation::start(generation, spawned, self.exits_tx.clone());
        info!(
            "generation {generation} (worker {:?}) is current",
            promoted.pid()
        );
        *current = Some(promoted);
        Ok(Replaced {
            generation,
            retired,
        })
    }

    /// Live upgrade. Only one may be in flight; extra triggers are dropped.
    pub async fn request_upgrade(&self) -> UpgradeOutcome {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            info!("shutting down; ignoring upgrade trigger");
            return UpgradeOutcome::ShuttingDown;
        }
        if self
            .upgrade_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("upgrade already in flight; ignoring trigger");
            return UpgradeOutcome::AlreadyInFlight;
        }

        info!("upgrade requested");
        match self.replace().await {
            Ok(Replaced {
                generation,
                retired: Some(_),
            }) => UpgradeOutcome::Upgraded(generation),
            Ok(Replaced {
                generation,
                retired: None,
            }) => {
                // Nothing was superseded, so no exit will consume the flag.
                self.upgrade_requested.store(false, Ordering::SeqCst);
                UpgradeOutcome::Upgraded(generation)
            }
            Err(err) => {
                error!("upgrade failed, previous worker keeps serving: {err}");
                self.upgrade_requested.store(false, Ordering::SeqCst);
                UpgradeOutcome::Failed
            }
        }
    }

    /// Planned stop: flags the exit as intended, then retires the current
    /// generation.
    pub async fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        notify_systemd(&[NotifyState::Stopping]);
        let mut current = self.current.lock().await;
        match current.take() {
            Some(generation) => {
                generation
                    .retire(self.config.exit_timeout, self.config.drain_timeout)
                    .await
            }
            None => info!("no worker to stop"),
        }
    }

    /// Brings up the first generation, then serves commands and worker exits
    /// until shutdown (`Ok`) or budget exhaustion (`Err`).
    ///
    /// A closed command channel is treated as a shutdown request.
    pub async fn run(&self, mut commands: mpsc::Receiver<Command>) -> Result<(), SupervisorError> {
        let mut exits = self.exits_rx.lock().await;

        let first = self.replace().await.map_err(SupervisorError::Startup)?;
        info!("supervising generation {}", first.generation);
        notify_systemd(&[NotifyState::Ready]);

        loop {
            tokio::select! {
                biased;
                Some(exited) = exits.recv() => self.on_exit(exited).await?,
                command = commands.recv() => match command {
                    Some(Command::Upgrade) => {
                        let outcome = self.request_upgrade().await;
                        debug!("upgrade outcome: {outcome:?}");
                    }
                    Some(Command::Shutdown) => {
                        info!("shutdown requested");
                        self.shutdown().await;
                        return Ok(());
                    }
                    None => {
                        info!("command source closed; shutting down");
                        self.shutdown().await;
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn on_exit(&self, exited: Exited) -> Result<(), SupervisorError> {
        let mut current = self.current.lock().await;
        let current_id = current.as_ref().map(Generation::id);
        let Exited {
            generation,
            pid,
            status,
        } = exited;
        let status = match status {
            Ok(status) => status.to_string(),
            Err(err) => format!("unknown status ({err})"),
        };

        match self.classify(generation, current_id) {
            ExitPath::Upgrade => {
                info!("worker {pid:?} (generation {generation}) superseded by upgrade");
                Ok(())
            }
            ExitPath::Shutdown => {
                info!("worker {pid:?} (generation {generation}) stopped for shutdown");
                Ok(())
            }
            ExitPath::Stale => {
                debug!("ignoring exit of non-current generation {generation}");
                Ok(())
            }
            ExitPath::CrashRetry { remaining } => {
                error!(
                    "worker {pid:?} (generation {generation}) exited unexpectedly: {status}; \
                     {remaining} restart(s) left"
                );
                if let Some(dead) = current.take() {
                    dead.reap().await;
                }
                drop(current);
                self.respawn().await
            }
            ExitPath::CrashFatal => {
                error!(
                    "worker {pid:?} (generation {generation}) exited unexpectedly: {status}; \
                     restart budget exhausted"
                );
                if let Some(dead) = current.take() {
                    dead.reap().await;
                }
                Err(self.exhausted())
            }
        }
    }

    fn classify(&self, generation: u64, current: Option<u64>) -> ExitPath {
        if self
            .upgrade_requested
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return ExitPath::Upgrade;
        }
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return ExitPath::Shutdown;
        }
        if current != Some(generation) {
            return ExitPath::Stale;
        }
        match self.charge_budget() {
            Some(remaining) => ExitPath::CrashRetry { remaining },
            None => ExitPath::CrashFatal,
        }
    }

    /// Spends one restart; `None` once the budget has gone negative.
    fn charge_budget(&self) -> Option<i64> {
        let remaining = self.budget.fetch_sub(1, Ordering::SeqCst) - 1;
        (remaining >= 0).then_some(remaining)
    }

    /// Replaces a crashed generation, charging every failed attempt.
    async fn respawn(&self) -> Result<(), SupervisorError> {
        loop {
            match self.replace().await {
                Ok(replaced) => {
                    info!("respawned as generation {}", replaced.generation);
                    return Ok(());
                }
                Err(err) => {
                    error!("respawn failed: {err}");
                    match self.charge_budget() {
                        Some(remaining) => warn!("{remaining} restart(s) left"),
                        None => return Err(self.exhausted()),
                    }
                }
            }
        }
    }

    fn exhausted(&self) -> SupervisorError {
        SupervisorError::RestartBudgetExhausted {
            budget: self.config.restart_budget,
        }
    }
}

fn notify_systemd(state: &[NotifyState]) {
    if let Err(err) = sd_notify::notify(false, state) {
        warn!("systemd notification failed: {err}");
    }
}
