mod app;
mod auth;
mod config;
mod metrics;
mod transport;
mod util;

use app::{
    handle_connection, run_control_listener, run_deliver_worker, run_flusher, run_save_worker,
    spawn_local_pipeline, AppState, CallRegistry, Coalescer, Pipeline, ServerError,
    SessionRegistry,
};
use auth::{KeyedTokenVerifier, TokenVerifier};
use config::{PipelineMode, ServerConfig};
use metrics::Metrics;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accepted sends buffered by the in-process pipeline before senders
/// start seeing errors.
const LOCAL_QUEUE_CAPACITY: usize = 200_000;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("WIREGATE_CONFIG").unwrap_or_else(|_| "wiregate.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(serve(config)).expect("serve");
}

async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let storage = Arc::new(
        wiregate_storage::connect(&config.postgres_dsn, &config.redis_url).await?,
    );
    storage.migrate().await?;
    storage.readiness().await?;
    let verifier: Arc<dyn TokenVerifier> = Arc::new(KeyedTokenVerifier::new(config.auth_secret));

    let (pipeline, local_queue) = match config.pipeline_mode {
        PipelineMode::Direct => (Pipeline::Direct, None),
        PipelineMode::TwoPhase => (Pipeline::Stream, None),
        PipelineMode::Local => {
            let (queue_tx, queue_rx) = mpsc::channel(LOCAL_QUEUE_CAPACITY);
            (Pipeline::Local(queue_tx), Some(queue_rx))
        }
    };
    let state = Arc::new(AppState {
        config,
        storage,
        metrics: Arc::new(Metrics::new()),
        verifier,
        sessions: SessionRegistry::new(),
        calls: CallRegistry::new(),
        coalescer: Coalescer::new(),
        pipeline,
    });

    run_control_listener(Arc::clone(&state));
    run_flusher(Arc::clone(&state));
    match state.config.pipeline_mode {
        PipelineMode::TwoPhase => {
            if state.config.pipeline_deliver_first {
                run_deliver_worker(Arc::clone(&state));
            }
            run_save_worker(Arc::clone(&state));
        }
        PipelineMode::Local => {
            if let Some(queue) = local_queue {
                spawn_local_pipeline(Arc::clone(&state), queue);
            }
        }
        PipelineMode::Direct => {}
    }
    if let Some(metrics_bind) = state.config.metrics_bind.clone() {
        spawn_metrics_listener(metrics_bind, Arc::clone(&state.metrics));
    }

    let listener = TcpListener::bind(&state.config.bind).await?;
    info!(
        address = %state.config.bind,
        instance = %state.config.instance_id,
        "wiregate listening"
    );
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(%peer, "tcp connection accepted");
                tokio::spawn(handle_connection(Arc::clone(&state), socket));
            }
            Err(error) => {
                warn!(%error, "tcp accept failed");
            }
        }
    }
}

/// Serves the Prometheus scrape endpoint. Any request on the socket
/// gets the full counter dump; no routing is needed.
fn spawn_metrics_listener(bind: String, metrics: Arc<Metrics>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(error) => {
                warn!(address = %bind, %error, "metrics bind failed");
                return;
            }
        };
        info!(address = %bind, "metrics listening");
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let body = metrics.encode_prometheus();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    })
}
