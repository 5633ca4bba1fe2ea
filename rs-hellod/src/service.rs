use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use handoff::WorkerContext;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const WEB: &str = "web";
pub const METRICS: &str = "metrics";

struct Instance {
    id: Uuid,
    requests: AtomicU64,
}

/// Serves the web and metrics listeners until the supervisor asks this
/// worker to exit, then drains open connections within the drain timeout.
pub async fn serve(mut ctx: WorkerContext) {
    let (Some(web), Some(metrics)) = (ctx.take_listener(WEB), ctx.take_listener(METRICS)) else {
        error!("expected '{WEB}' and '{METRICS}' listeners");
        ctx.ready.not_ready();
        return;
    };
    let instance = Arc::new(Instance {
        id: Uuid::new_v4(),
        requests: AtomicU64::new(0),
    });

    let servers = async {
        tokio::join!(
            run_http(WEB, web, web_router(instance.clone()), ctx.shutdown.clone()),
            run_http(
                METRICS,
                metrics,
                metrics_router(instance.clone()),
                ctx.shutdown.clone()
            ),
        )
    };
    tokio::pin!(servers);

    ctx.ready.ready();
    info!("instance {} serving", instance.id);

    tokio::select! {
        _ = &mut servers => {
            error!("HTTP servers stopped before shutdown");
            return;
        }
        _ = ctx.shutdown.cancelled() => {}
    }

    let drain_timeout = ctx.drain_timeout;
    if tokio::time::timeout(drain_timeout, servers).await.is_err() {
        warn!("connections still open after {drain_timeout:?}");
    }
}

fn web_router(instance: Arc<Instance>) -> Router {
    Router::new().route("/", get(hello)).with_state(instance)
}

fn metrics_router(instance: Arc<Instance>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(instance)
}

/// Serves `app` on `listener` until `shutdown` fires and every open
/// connection has finished.
async fn run_http(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!("{name} serving on {addr}"),
        Err(err) => warn!("{name} listener has no local address: {err}"),
    }
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("{name} draining connections");
        })
        .await;
    if let Err(err) = served {
        error!("{name} server failed: {err}");
    }
}

async fn hello(State(instance): State<Arc<Instance>>) -> String {
    instance.requests.fetch_add(1, Ordering::Relaxed);
    format!("Hello, world! (instance: {})\n", instance.id)
}

async fn render_metrics(State(instance): State<Arc<Instance>>) -> String {
    format!(
        "hellod_requests_total{{instance=\"{}\"}} {}\n",
        instance.id,
        instance.requests.load(Ordering::Relaxed),
    )
}
