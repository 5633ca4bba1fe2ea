//! Scripted in-process workers for exercising supervision policy.

use std::collections::VecDeque;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::channel::{Channel, Token};
use crate::launcher::{InheritedFd, Launched, Launcher, WorkerProcess};

/// How a fake worker behaves once launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    /// ReadyOK, then ExitReply on ExitRequest and exit 0.
    Healthy,
    /// ReadyError, then exit 1.
    RefuseReady,
    /// Exit 2 without a word.
    ExitBeforeReady,
    /// Keep the channel open and never report readiness.
    NeverReady,
    /// ReadyOK, then exit 1 straight away.
    CrashAfterReady,
    /// ReadyOK, then swallow ExitRequest and run until killed.
    IgnoreExitRequest,
    /// The launch itself fails.
    FailLaunch,
}

pub(crate) struct FakeLauncher {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    launches: AtomicUsize,
    reaped: Arc<AtomicUsize>,
    next_pid: AtomicU32,
    commands: Mutex<Vec<(Vec<String>, Vec<InheritedFd>)>>,
}

impl FakeLauncher {
    pub(crate) fn new(script: Vec<Behavior>, fallback: Behavior) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            launches: AtomicUsize::new(0),
            reaped: Arc::new(AtomicUsize::new(0)),
            next_pid: AtomicU32::new(1000),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn healthy() -> Arc<Self> {
        Self::new(Vec::new(), Behavior::Healthy)
    }

    /// Plays `script` in order, then behaves healthily.
    pub(crate) fn scripted(script: Vec<Behavior>) -> Arc<Self> {
        Self::new(script, Behavior::Healthy)
    }

    /// Launch attempts, including failed ones.
    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Workers whose exit has been observed through `wait`.
    pub(crate) fn reaped(&self) -> usize {
        self.reaped.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self) -> Vec<(Vec<String>, Vec<InheritedFd>)> {
        self.commands.lock().unwrap().clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, args: &[String], inherited: &[InheritedFd]) -> io::Result<Launched> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.commands
            .lock()
            .unwrap()
            .push((args.to_vec(), inherited.to_vec()));
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        if behavior == Behavior::FailLaunch {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
        }

        let (supervisor_end, worker_end) = Channel::pair();
        let task = tokio::spawn(run_fake_worker(behavior, worker_end));
        Ok(Launched {
            process: Box::new(FakeProcess {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                task,
                status: None,
                reaped: self.reaped.clone(),
            }),
            channel: supervisor_end,
        })
    }
}

async fn run_fake_worker(behavior: Behavior, mut channel: Channel) -> i32 {
    match behavior {
        Behavior::Healthy => {
            if channel.send(Token::ReadyOk).await.is_err() {
                return 1;
            }
            let mut asked = false;
            let _ = channel
                .read(|token| {
                    asked = token == Token::ExitRequest;
                    !asked
                })
                .await;
            if asked {
                let _ = channel.send(Token::ExitReply).await;
            }
            0
        }
        Behavior::RefuseReady => {
            let _ = channel.send(Token::ReadyError).await;
            1
        }
        Behavior::ExitBeforeReady => 2,
        Behavior::NeverReady => {
            let _keep_open = channel;
            std::future::pending::<i32>().await
        }
        Behavior::CrashAfterReady => {
            let _ = channel.send(Token::ReadyOk).await;
            1
        }
        Behavior::IgnoreExitRequest => {
            let _ = channel.send(Token::ReadyOk).await;
            let _ = channel.read(|_| true).await;
            std::future::pending::<i32>().await
        }
        Behavior::FailLaunch => unreachable!("launch fails before a worker exists"),
    }
}

struct FakeProcess {
    pid: u32,
    task: JoinHandle<i32>,
    status: Option<ExitStatus>,
    reaped: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.task.abort();
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = match (&mut self.task).await {
            Ok(code) => ExitStatus::from_raw(code << 8),
            Err(_) => ExitStatus::from_raw(libc::SIGKILL),
        };
        self.status = Some(status);
        self.reaped.fetch_add(1, Ordering::SeqCst);
        Ok(status)
    }
}
