//! Zero-downtime process supervision.
//!
//! A long-lived supervisor binds every listening port once, keeps exactly one
//! worker process alive, and hands the bound sockets down to each worker
//! generation so that restarts and live upgrades never refuse a connection.
//!
//! ```text
//!  supervisor                                 worker (same binary, --child)
//!  ----------                                 ------------------------------
//!  preallocate sockets
//!  spawn ── fd 3/4 channel, fd 5.. sockets ──▶ adopt sockets, run service
//!        ◀──────────── ReadyOK / ReadyError ── readiness from the service
//!  retire previous generation
//!        ── ExitRequest ─────────────────────▶ stop accepting, drain
//!        ◀──────────────────────── ExitReply ──
//!        ── SIGKILL (backstop)
//! ```
//!
//! `SIGUSR2` (or `--upgrade`, which signals the PID from the PID file) swaps
//! in a freshly executed worker; `SIGINT`/`SIGTERM` shut down; unplanned
//! worker exits are restarted until the crash-restart budget runs out.

#[cfg(not(unix))]
compile_error!("handoff requires a Unix platform (Linux or macOS)");

mod channel;
mod config;
mod daemon;
mod error;
mod generation;
mod launcher;
mod pidfile;
mod signals;
mod sockets;
mod spawner;
mod supervisor;
#[cfg(test)]
mod testing;
mod worker;

pub use channel::{Channel, ReadEnd, Token};
pub use config::{DaemonArgs, Role, SupervisorConfig};
pub use daemon::Daemon;
pub use error::{
    BindError, ChannelError, DaemonError, PidFileError, SpawnError, SupervisorError, WorkerError,
};
pub use generation::Exited;
pub use launcher::{InheritedFd, Launched, Launcher, OsLauncher, WorkerProcess};
pub use pidfile::{read_pid_file, signal_upgrade, write_pid_file};
pub use signals::{Command, SignalDispatcher};
pub use sockets::{adopt_listeners, preallocate, ListeningSockets};
pub use spawner::{BootstrapArgs, Spawned, Spawner};
pub use supervisor::{Replaced, Supervisor, UpgradeOutcome};
pub use worker::{run_worker, ReadySignal, WorkerContext};
