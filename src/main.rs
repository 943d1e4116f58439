use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use ai_taskd::config::Config;
use ai_taskd::error::{DatabaseError, WorkerError};
use ai_taskd::gateway::{self, AppState};
use ai_taskd::store::{LibSqlBackend, TaskStore};
use ai_taskd::tasks::NewTask;
use ai_taskd::worker::{TaskExecutor, Worker};

#[derive(Parser)]
#[command(name = "ai-taskd", version, about = "Task orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Claim and execute tasks until SIGINT/SIGTERM.
    Worker,
    /// Serve the HTTP control gateway.
    Gateway {
        /// Overrides TASKD_BIND.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Insert tasks from a JSON file (one submission object or an array).
    Enqueue { file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    // Tracing is not up yet, so configuration errors go to stderr only.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = init_tracing(config.log_dir.as_deref());

    let result = match cli.command {
        Command::Worker => run_worker(config).await,
        Command::Gateway { bind } => run_gateway(config, bind).await,
        Command::Enqueue { file } => run_enqueue(config, &file).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// stderr always; a daily rolling file as well when a log directory is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let appender = tracing_appender::rolling::daily(dir, "ai-taskd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

async fn open_store(config: &Config) -> Result<Arc<LibSqlBackend>, DatabaseError> {
    let token = config.database_token.as_ref().map(|t| t.expose_secret().to_string());
    LibSqlBackend::connect(&config.database_url, token.as_deref())
        .await
        .map(Arc::new)
}

/// Cancel the token on the first SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable, using Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });
}

async fn run_worker(config: Config) -> Result<()> {
    let router = Arc::new(config.build_router().context("failed to build backends")?);

    let store: Arc<dyn TaskStore> = match open_store(&config).await {
        Ok(store) => store,
        Err(e) => return Err(WorkerError::StoreUnavailable(e).into()),
    };

    let executor = TaskExecutor::new(store, router).with_options(config.routing_options());
    let worker = Worker::new(config.worker_config(), executor);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let summary = worker.run(shutdown).await?;
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

async fn run_gateway(config: Config, bind: Option<String>) -> Result<()> {
    let router = Arc::new(config.build_router().context("failed to build backends")?);
    let store: Arc<dyn TaskStore> = open_store(&config)
        .await
        .context("failed to open task store")?;

    let addr = bind.unwrap_or_else(|| config.bind.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let state = AppState::new(store, router)
        .with_defaults(config.routing_options())
        .with_shutdown(shutdown);
    gateway::serve(listener, state).await.context("gateway failed")?;
    Ok(())
}

async fn run_enqueue(config: Config, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw).context("invalid JSON")?;
    let submissions: Vec<NewTask> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    for (index, submission) in submissions.iter().enumerate() {
        submission
            .validate()
            .map_err(|reason| anyhow::anyhow!("submission {index}: {reason}"))?;
    }

    let store = open_store(&config).await.context("failed to open task store")?;
    let (mut inserted, mut skipped) = (0, 0);
    for submission in submissions {
        let id = submission.id.clone();
        match store.enqueue(submission).await {
            Ok(_) => inserted += 1,
            Err(DatabaseError::DuplicateKey { .. }) => {
                tracing::warn!(task_id = %id, "Task already exists, skipped");
                skipped += 1;
            }
            Err(e) => return Err(e).with_context(|| format!("failed to enqueue {id}")),
        }
    }
    println!("{}", serde_json::json!({ "inserted": inserted, "skipped": skipped }));
    Ok(())
}
