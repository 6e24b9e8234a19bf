#![forbid(unsafe_code)]

//! `appgen-relay`: generation session coordinator binary.
//!
//! Bootstraps configuration and the shared store, wires the coordinator,
//! drivers and completion hooks, and serves the HTTP API until a shutdown
//! signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use appgen_relay::api::{self, AppState};
use appgen_relay::config::GlobalConfig;
use appgen_relay::driver::{HttpAgentRuntime, HttpEnvironmentProvider};
use appgen_relay::notify::{NotificationService, NotificationSink, SmsSink};
use appgen_relay::orchestrator::completion::{
    spawn_hook_sweep, HOOK_SWEEP_INTERVAL, HOOK_SWEEP_MIN_AGE,
};
use appgen_relay::orchestrator::{
    CompletionHook, DriverDeps, DriverRegistry, Generations, HookRunner, NotifyPreviewHook,
    SessionCoordinator,
};
use appgen_relay::persistence::hook_repo::HookRepo;
use appgen_relay::persistence::retry::RetryPolicy;
use appgen_relay::persistence::stream_repo::StreamRepo;
use appgen_relay::persistence::transcript_repo::TranscriptRepo;
use appgen_relay::persistence::{db, retention};
use appgen_relay::stream::StreamTransport;
use appgen_relay::{AppError, Result};

/// How long local drivers get to write their terminal state on shutdown.
const DRIVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// How long open HTTP connections get to finish on shutdown.
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "appgen-relay", about = "Generation session coordinator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP port from the configuration file.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("appgen-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    config.load_credentials().await?;
    let node_id = config
        .node_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let config = Arc::new(config);
    info!(node_id, "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);
    let retry = RetryPolicy::from(&config.store);
    info!(db_path = %config.db_path.display(), "database connected");

    // ── Wire orchestration ──────────────────────────────
    let transport = StreamTransport::new(Arc::clone(&db), retry, &config.stream);
    let registry = DriverRegistry::new();
    let coordinator = SessionCoordinator::new(
        Arc::clone(&db),
        retry,
        transport.clone(),
        registry.clone(),
        &config.coordinator,
    );

    let mut hooks: Vec<Arc<dyn CompletionHook>> = Vec::new();
    let notify_worker = if config.notify.enabled {
        let sms: Arc<dyn NotificationSink> = Arc::new(SmsSink::new(&config.notify));
        let (service, worker) = NotificationService::start(sms, config.notify.max_attempts);
        hooks.push(Arc::new(NotifyPreviewHook::new(
            Arc::new(service),
            config.notify.preview_domain.clone(),
        )));
        Some(worker)
    } else {
        info!("notifications disabled");
        None
    };
    let hook_runner = HookRunner::new(HookRepo::with_retry(Arc::clone(&db), retry), hooks);

    let deps = DriverDeps::new(
        Arc::clone(&db),
        retry,
        transport.clone(),
        hook_runner.clone(),
        Arc::new(HttpAgentRuntime::new(&config.agent)),
        Arc::new(HttpEnvironmentProvider::new(&config.environment)),
        config.coordinator.poll_interval(),
    );
    let generations = Generations::new(
        coordinator,
        deps,
        registry,
        config.coordinator.stop_timeout(),
    );

    // ── Background services ─────────────────────────────
    let ct = CancellationToken::new();
    let retention_handle = retention::spawn_retention_task(
        StreamRepo::with_retry(Arc::clone(&db), retry),
        Duration::from_secs(config.stream.gc_interval_seconds),
        ct.clone(),
    );
    let sweep_handle = spawn_hook_sweep(
        hook_runner,
        HOOK_SWEEP_INTERVAL,
        HOOK_SWEEP_MIN_AGE,
        ct.clone(),
    );
    info!("retention and hook sweep started");

    // ── Serve HTTP ──────────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        generations: generations.clone(),
        transport,
        transcripts: TranscriptRepo::with_retry(db, retry),
    });
    let http_ct = ct.clone();
    let port = config.http_port;
    let http_handle = tokio::spawn(async move {
        if let Err(err) = api::serve(state, port, http_ct).await {
            error!(%err, "http api failed");
        }
    });

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    info!(running = generations.running(), "interrupting local generation drivers");
    generations.shutdown(DRIVER_DRAIN_TIMEOUT).await;
    if tokio::time::timeout(HTTP_DRAIN_TIMEOUT, http_handle)
        .await
        .is_err()
    {
        warn!("open HTTP connections did not finish before the deadline");
    }
    let _ = tokio::join!(retention_handle, sweep_handle);
    if let Some(worker) = notify_worker {
        worker.abort();
    }
    info!("appgen-relay shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
