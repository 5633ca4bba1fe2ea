//! Process entry: picks the role of this invocation and runs it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use log::info;

use crate::config::{DaemonArgs, Role, SupervisorConfig};
use crate::error::DaemonError;
use crate::launcher::{Launcher, OsLauncher};
use crate::pidfile::{signal_upgrade, write_pid_file};
use crate::signals::SignalDispatcher;
use crate::sockets::preallocate;
use crate::supervisor::Supervisor;
use crate::worker::{run_worker, WorkerContext};

pub struct Daemon {
    args: DaemonArgs,
    config: SupervisorConfig,
    launcher: Arc<dyn Launcher>,
}

impl Daemon {
    /// `argv` is the full argument vector of this process, program first.
    pub fn new(argv: Vec<String>, args: DaemonArgs) -> Self {
        Self {
            config: SupervisorConfig::from_args(argv, &args),
            args,
            launcher: Arc::new(OsLauncher),
        }
    }

    pub fn from_env(args: DaemonArgs) -> Self {
        Self::new(std::env::args().collect(), args)
    }

    /// Runs this process in its role.
    ///
    /// - supervisor: binds `ports` by name, records its PID, and supervises
    ///   workers until SIGINT/SIGTERM or budget exhaustion
    /// - worker: adopts the inherited listeners and hands them to `serve`
    /// - upgrade trigger: signals the recorded supervisor and returns
    pub async fn bootstrap<F, Fut>(
        self,
        ports: BTreeMap<String, u16>,
        serve: F,
    ) -> Result<(), DaemonError>
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match self.args.role() {
            Role::Worker { bootstrap_args } => {
                let bootstrap_args = bootstrap_args.ok_or(DaemonError::MissingBootstrapArgs)?;
                run_worker(&bootstrap_args, self.config.drain_timeout, serve).await?;
            }
            Role::UpgradeTrigger => {
                let pid = signal_upgrade(&self.config.pid_file)?;
                info!("upgrade requested from supervisor {pid}");
            }
            Role::Supervisor => {
                let sockets = preallocate(&ports)?;
                write_pid_file(&self.config.pid_file)?;
                let commands = SignalDispatcher::new()?.spawn_forwarder();
                let supervisor = Supervisor::new(self.config, Arc::new(sockets), self.launcher);
                supervisor.run(commands).await?;
                info!("supervisor stopped");
            }
        }
        Ok(())
    }
}
