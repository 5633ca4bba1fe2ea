use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;

/// Flags every host binary flattens into its own parser.
///
/// `--child` and `--bootstrap-args` are added by the supervisor when it
/// starts a worker; operators only use the others.
#[derive(Debug, Clone, Args)]
pub struct DaemonArgs {
    /// Run as a supervised worker.
    #[arg(long, hide = true)]
    pub child: bool,

    /// JSON map of inherited listener names to descriptor numbers.
    #[arg(long, hide = true)]
    pub bootstrap_args: Option<String>,

    /// Signal the running supervisor (from the PID file) to upgrade, then exit.
    #[arg(long)]
    pub upgrade: bool,

    /// Unplanned worker exits tolerated before the supervisor gives up.
    #[arg(long, default_value_t = 3)]
    pub restart_budget: u32,

    #[arg(long, default_value = "daemon.pid")]
    pub pid_file: PathBuf,

    /// Seconds a new worker has to report readiness; 0 waits forever.
    #[arg(long, default_value_t = 60)]
    pub ready_timeout_secs: u64,

    /// Seconds a retiring worker has to acknowledge an exit request.
    #[arg(long, default_value_t = 10)]
    pub exit_timeout_secs: u64,

    /// Seconds an acknowledging worker may drain before it is killed.
    #[arg(long, default_value_t = 5)]
    pub drain_timeout_secs: u64,
}

/// Which of the three process roles this invocation plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Worker { bootstrap_args: Option<String> },
    UpgradeTrigger,
}

impl DaemonArgs {
    pub fn role(&self) -> Role {
        if self.child {
            Role::Worker {
                bootstrap_args: self.bootstrap_args.clone(),
            }
        } else if self.upgrade {
            Role::UpgradeTrigger
        } else {
            Role::Supervisor
        }
    }
}

/// Supervisor context, built once at process entry.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Snapshot of the original argument vector, program first.
    pub args: Arc<[String]>,
    pub pid_file: PathBuf,
    pub restart_budget: u32,
    pub ready_timeout: Option<Duration>,
    pub exit_timeout: Duration,
    pub drain_timeout: Duration,
}

impl SupervisorConfig {
    pub fn from_args(argv: Vec<String>, args: &DaemonArgs) -> Self {
        Self {
            args: argv.into(),
            pid_file: args.pid_file.clone(),
            restart_budget: args.restart_budget,
            ready_timeout: match args.ready_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            exit_timeout: Duration::from_secs(args.exit_timeout_secs),
            drain_timeout: Duration::from_secs(args.drain_timeout_secs),
        }
    }
}
