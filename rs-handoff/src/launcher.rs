//! Platform seam for starting a worker with inherited handles.
//!
//! Everything above this module is platform-neutral policy: it decides which
//! descriptors a worker gets and at which numbers. A [`Launcher`] only has to
//! open the channel, place the descriptors, and start the process.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use log::debug;
use tokio::process::{Child, Command};

use crate::channel::{os_pipe, Channel, CHANNEL_READ_FD, CHANNEL_WRITE_FD};

/// A supervisor-side descriptor and the number it must have in the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InheritedFd {
    pub source: RawFd,
    pub target: RawFd,
}

/// A started worker process and the supervisor's end of its channel.
pub struct Launched {
    pub process: Box<dyn WorkerProcess>,
    pub channel: Channel,
}

pub trait Launcher: Send + Sync + 'static {
    /// Starts `args[0]` with `args[1..]`, the channel at fds 3/4 and every
    /// `inherited` descriptor at its target number.
    fn launch(&self, args: &[String], inherited: &[InheritedFd]) -> io::Result<Launched>;
}

#[async_trait]
pub trait WorkerProcess: Send + 'static {
    fn id(&self) -> Option<u32>;

    /// Sends the forced-kill signal without waiting.
    fn start_kill(&mut self) -> io::Result<()>;

    /// Waits for exit. Must be cancel-safe.
    async fn wait(&mut self) -> io::Result<ExitStatus>;
}

/// Fork/exec launcher for POSIX systems.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, args: &[String], inherited: &[InheritedFd]) -> io::Result<Launched> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"))?;

        let (to_child_read, to_child_write) = os_pipe()?;
        let (from_child_read, from_child_write) = os_pipe()?;

        let mut plan = vec![
            InheritedFd {
                source: to_child_read.as_raw_fd(),
                target: CHANNEL_READ_FD,
            },
            InheritedFd {
                source: from_child_write.as_raw_fd(),
                target: CHANNEL_WRITE_FD,
            },
        ];
        plan.extend_from_slice(inherited);
        // Staged copies must land above every source and target so no dup2
        // can clobber a descriptor that is still to be moved.
        let floor = plan
            .iter()
            .fold(0, |acc, fd| acc.max(fd.source).max(fd.target))
            + 1;
        let mut staged: Vec<RawFd> = vec![-1; plan.len()];
        debug!("launching {program} with descriptor plan {plan:?}");

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            // Terminal ^C goes to the supervisor only; it decides how the worker stops.
            .process_group(0);
        unsafe {
            cmd.pre_exec(move || {
                for (slot, fd) in staged.iter_mut().zip(&plan) {
                    let copy = libc::fcntl(fd.source, libc::F_DUPFD_CLOEXEC, floor);
                    if copy < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    *slot = copy;
                }
                // dup2 clears close-on-exec on the target; the staged copies close at exec.
                for (copy, fd) in staged.iter().zip(&plan) {
                    if libc::dup2(*copy, fd.target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        debug!("spawned worker process, pid={:?}", child.id());

        drop(to_child_read);
        drop(from_child_write);
        let channel = Channel::from_pipes(from_child_read, to_child_write)?;
        Ok(Launched {
            process: Box::new(OsProcess(child)),
            channel,
        })
    }
}

struct OsProcess(Child);

#[async_trait]
impl WorkerProcess for OsProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.0.start_kill()
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.0.wait().await
    }
}
