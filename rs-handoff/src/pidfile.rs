use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::info;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::PidFileError;

/// Records this process's ID so `--upgrade` can find the supervisor.
pub fn write_pid_file(path: &Path) -> Result<(), PidFileError> {
    let io_err = |source| PidFileError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(path)
        .map_err(io_err)?;
    write!(file, "{}", std::process::id()).map_err(io_err)?;
    info!("wrote PID {} to {}", std::process::id(), path.display());
    Ok(())
}

pub fn read_pid_file(path: &Path) -> Result<i32, PidFileError> {
    let content = fs::read_to_string(path).map_err(|source| PidFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    content
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| PidFileError::Parse {
            path: path.to_path_buf(),
            content,
        })
}

/// Sends SIGUSR2 to the supervisor recorded in `path`.
pub fn signal_upgrade(path: &Path) -> Result<i32, PidFileError> {
    let pid = read_pid_file(path)?;
    kill(Pid::from_raw(pid), Signal::SIGUSR2)
        .map_err(|source| PidFileError::Signal { pid, source })?;
    info!("sent SIGUSR2 to supervisor {pid}");
    Ok(pid)
}
