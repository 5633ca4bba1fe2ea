//! Worker side of a generation: adopt inherited listeners, run the host
//! service, and speak the readiness and exit handshakes.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, Token};
use crate::error::{ChannelError, WorkerError};
use crate::sockets::adopt_listeners;
use crate::spawner::BootstrapArgs;

/// Handed to the host service when a worker starts.
pub struct WorkerContext {
    /// Inherited listeners by name. Already bound and listening.
    pub listeners: BTreeMap<String, TcpListener>,
    /// Must be resolved once the service can take traffic.
    pub ready: ReadySignal,
    /// Cancelled when the supervisor asks this worker to exit.
    pub shutdown: CancellationToken,
    /// How long the supervisor lets this worker drain after `shutdown`
    /// fires before killing it.
    pub drain_timeout: Duration,
}

impl WorkerContext {
    pub fn take_listener(&mut self, name: &str) -> Option<TcpListener> {
        self.listeners.remove(name)
    }
}

/// One-shot readiness report. Dropping it counts as not ready.
pub struct ReadySignal(oneshot::Sender<bool>);

impl ReadySignal {
    pub fn ready(self) {
        let _ = self.0.send(true);
    }

    pub fn not_ready(self) {
        let _ = self.0.send(false);
    }
}

/// Entry point of a worker process.
///
/// Opens the inherited channel, adopts the listeners named in
/// `bootstrap_args`, runs `serve` and returns once the service has drained
/// after an exit request (or after the supervisor went away). The service
/// should finish draining within `drain_timeout`.
///
/// SIGINT and SIGTERM are recorded rather than acted on: a worker only stops
/// when its supervisor says so.
pub async fn run_worker<F, Fut>(
    bootstrap_args: &str,
    drain_timeout: Duration,
    serve: F,
) -> Result<(), WorkerError>
where
    F: FnOnce(WorkerContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut channel = Channel::inherited()?;

    let signalled = Arc::new(AtomicBool::new(false));
    let setup = register_stop_signals(&signalled).and_then(|()| {
        let bootstrap = BootstrapArgs::parse(bootstrap_args)?;
        adopt_listeners(&bootstrap.listeners)
    });
    let listeners = match setup {
        Ok(listeners) => listeners,
        Err(err) => {
            error!("worker setup failed: {err}");
            report(&mut channel, Token::ReadyError).await;
            return Err(err);
        }
    };
    info!("adopted {} listener(s)", listeners.len());

    let result = serve_generation(channel, listeners, drain_timeout, serve).await;
    if signalled.load(Ordering::SeqCst) {
        info!("ignored SIGINT/SIGTERM while supervised");
    }
    result
}

fn register_stop_signals(flag: &Arc<AtomicBool>) -> Result<(), WorkerError> {
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(flag)).map_err(WorkerError::Signal)?;
    }
    Ok(())
}

pub(crate) async fn serve_generation<F, Fut>(
    mut channel: Channel,
    listeners: BTreeMap<String, TcpListener>,
    drain_timeout: Duration,
    serve: F,
) -> Result<(), WorkerError>
where
    F: FnOnce(WorkerContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let shutdown = CancellationToken::new();
    let (ready_tx, ready_rx) = oneshot::channel();
    let mut service = tokio::spawn(serve(WorkerContext {
        listeners,
        ready: ReadySignal(ready_tx),
        shutdown: shutdown.clone(),
        drain_timeout,
    }));

    if !ready_rx.await.unwrap_or(false) {
        warn!("service is not ready");
        report(&mut channel, Token::ReadyError).await;
        shutdown.cancel();
        join(service).await;
        return Err(WorkerError::NotReady);
    }
    channel.send(Token::ReadyOk).await?;
    info!("service ready");

    let requested = tokio::select! {
        requested = await_exit_request(&mut channel) => requested,
        joined = &mut service => {
            if let Err(err) = joined {
                error!("service task failed: {err}");
            }
            return Err(WorkerError::ServiceExited);
        }
    };

    shutdown.cancel();
    match requested {
        Ok(true) => {
            info!("exit requested, draining");
            channel.send(Token::ExitReply).await?;
        }
        Ok(false) => warn!("supervisor closed the channel, draining"),
        Err(err) => warn!("channel failed ({err}), draining"),
    }
    join(service).await;
    info!("service drained");
    Ok(())
}

/// Waits for `ExitRequest`; `false` if the supervisor closed the channel.
async fn await_exit_request(channel: &mut Channel) -> Result<bool, ChannelError> {
    let mut requested = false;
    channel
        .read(|token| {
            requested = token == Token::ExitRequest;
            !requested
        })
        .await?;
    Ok(requested)
}

async fn report(channel: &mut Channel, token: Token) {
    if let Err(err) = channel.send(token).await {
        warn!("failed to send {token}: {err}");
    }
}

async fn join(service: JoinHandle<()>) {
    if let Err(err) = service.await {
        error!("service task failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ReadEnd;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const DRAIN: Duration = Duration::from_secs(3);

    async fn next_token(channel: &mut Channel) -> Option<Token> {
        let mut seen = None;
        channel
            .read(|token| {
                seen = Some(token);
                false
            })
            .await
            .unwrap();
        seen
    }

    #[tokio::test]
    async fn test_ready_then_exit_handshake() {
        let (mut supervisor, worker) = Channel::pair();
        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();

        let handle = tokio::spawn(serve_generation(worker, BTreeMap::new(), DRAIN, |ctx| async move {
            ctx.ready.ready();
            ctx.shutdown.cancelled().await;
            flag.store(ctx.drain_timeout == DRAIN, Ordering::SeqCst);
        }));

        assert_eq!(next_token(&mut supervisor).await, Some(Token::ReadyOk));
        supervisor.send(Token::ExitRequest).await.unwrap();
        assert_eq!(next_token(&mut supervisor).await, Some(Token::ExitReply));
        handle.await.unwrap().unwrap();
        assert!(drained.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_not_ready_reports_ready_error() {
        let (mut supervisor, worker) = Channel::pair();
        let handle = tokio::spawn(serve_generation(worker, BTreeMap::new(), DRAIN, |ctx| async move {
            ctx.ready.not_ready();
        }));

        assert_eq!(next_token(&mut supervisor).await, Some(Token::ReadyError));
        assert!(matches!(
            handle.await.unwrap(),
            Err(WorkerError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_dropped_ready_signal_is_not_ready() {
        let (mut supervisor, worker) = Channel::pair();
        let handle = tokio::spawn(serve_generation(worker, BTreeMap::new(), DRAIN, |ctx| async move {
            drop(ctx);
        }));

        assert_eq!(next_token(&mut supervisor).await, Some(Token::ReadyError));
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_stops_without_reply() {
        let (mut supervisor, worker) = Channel::pair();
        let handle = tokio::spawn(serve_generation(worker, BTreeMap::new(), DRAIN, |ctx| async move {
            ctx.ready.ready();
            ctx.shutdown.cancelled().await;
        }));

        assert_eq!(next_token(&mut supervisor).await, Some(Token::ReadyOk));
        drop(supervisor);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_service_exit_ends_worker() {
        let (mut supervisor, worker) = Channel::pair();
        let handle = tokio::spawn(serve_generation(worker, BTreeMap::new(), DRAIN, |ctx| async move {
            ctx.ready.ready();
        }));

        assert_eq!(next_token(&mut supervisor).await, Some(Token::ReadyOk));
        assert!(matches!(
            handle.await.unwrap(),
            Err(WorkerError::ServiceExited)
        ));
        assert_eq!(supervisor.read(|_| true).await.unwrap(), ReadEnd::Closed);
    }

    #[tokio::test]
    async fn test_service_serves_adopted_listener() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let mut listeners = BTreeMap::new();
        listeners.insert(
            "web".to_string(),
            TcpListener::from_std(std_listener).unwrap(),
        );

        let served = Arc::new(AtomicUsize::new(0));
        let count = served.clone();
        let (mut supervisor, worker) = Channel::pair();
        let handle = tokio::spawn(serve_generation(worker, listeners, DRAIN, |mut ctx| async move {
            let listener = ctx.take_listener("web").unwrap();
            ctx.ready.ready();
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let (mut stream, _) = accepted.unwrap();
                        stream.write_all(b"hello").await.unwrap();
                        count.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }));

        assert_eq!(next_token(&mut supervisor).await, Some(Token::ReadyOk));
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut body = String::new();
        client.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "hello");

        supervisor.send(Token::ExitRequest).await.unwrap();
        assert_eq!(next_token(&mut supervisor).await, Some(Token::ExitReply));
        handle.await.unwrap().unwrap();
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }
}
