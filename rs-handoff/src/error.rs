use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Errors on the supervisor/worker channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("inherited descriptor {fd} is not a pipe")]
    NotAPipe { fd: i32 },
}

/// A configured port could not be bound during preallocation.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("failed to bind listener '{name}' on port {port}: {source}")]
    Bind {
        name: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// A new worker generation could not be brought up.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to start worker process: {0}")]
    Launch(#[source] io::Error),

    #[error("failed to encode bootstrap arguments: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("worker reported ReadyError")]
    Refused,

    #[error("worker closed its channel before reporting readiness")]
    Closed,

    #[error("worker did not report readiness within {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Fatal supervisor outcomes.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("initial worker failed to start: {0}")]
    Startup(#[source] SpawnError),

    #[error("crash-restart budget of {budget} exhausted")]
    RestartBudgetExhausted { budget: u32 },
}

/// Failures inside a worker process before or while it serves.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid bootstrap arguments: {0}")]
    BootstrapArgs(#[from] serde_json::Error),

    #[error("inherited listener '{name}' (fd {fd}) is not a socket")]
    NotASocket { name: String, fd: i32 },

    #[error("failed to adopt inherited listener '{name}': {source}")]
    Adopt {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("service reported it is not ready")]
    NotReady,

    #[error("service stopped before an exit was requested")]
    ServiceExited,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("PID file {path} I/O failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("PID file {path} does not contain a process ID: {content:?}")]
    Parse { path: PathBuf, content: String },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },
}

/// Anything that ends a [`Daemon`](crate::Daemon) run unsuccessfully.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error("worker mode requires --bootstrap-args")]
    MissingBootstrapArgs,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
