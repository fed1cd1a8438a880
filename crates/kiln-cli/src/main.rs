//! kiln - command line front end for kiln-core.
//!
//! `run` drives one session end to end with demo stage executors,
//! `sessions` lists what is on disk, `maintain` runs the lifecycle policies once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use kiln_core::app::{App, AppBuilder, KilnConfig};
use kiln_core::domain::{JobStatusView, SessionId, SessionStatus, StageError};
use kiln_core::ports::{ExecutionMode, StageExecutor, StageRequest};

const DEMO_STAGES: [&str; 3] = ["preprocess", "symbolic", "eval"];

#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    version,
    about = "Session-isolated job orchestration for image pipelines",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// TOML config file; flags and env vars override it
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Storage root
    #[arg(long, global = true, env = "KILN_ROOT", value_name = "DIR")]
    root: Option<PathBuf>,

    /// Worker count
    #[arg(long, global = true, env = "KILN_WORKERS")]
    workers: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload images into a new session, run a job over them, print the final status
    Run(RunArgs),
    /// List sessions and their status
    Sessions,
    /// Run every lifecycle policy once and print the report
    Maintain,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Image files to upload
    #[arg(required = true, value_name = "IMAGE")]
    files: Vec<PathBuf>,

    /// Comma-separated stage list
    #[arg(long, value_delimiter = ',', default_values_t = DEMO_STAGES.map(String::from))]
    stages: Vec<String>,

    /// Make the `symbolic` stage fail transiently this many times first
    #[arg(long, default_value_t = 0)]
    flaky: u32,

    /// Mark the session completed afterwards so `maintain` can archive it
    #[arg(long)]
    complete: bool,

    /// Give up polling after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

/// Demo executor: reads its input and writes a small JSON digest.
struct DigestStage {
    failures_left: AtomicU32,
}

impl DigestStage {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[derive(Serialize)]
struct Digest<'a> {
    stage: &'a str,
    file_id: String,
    input_bytes: usize,
    checksum: u32,
    fallback: bool,
}

#[async_trait]
impl StageExecutor for DigestStage {
    async fn execute(&self, request: StageRequest<'_>) -> Result<(), StageError> {
        let left = self.failures_left.load(Ordering::Relaxed);
        if left > 0 {
            self.failures_left.fetch_sub(1, Ordering::Relaxed);
            return Err(StageError::transient(format!(
                "simulated runtime error ({left} left)"
            )));
        }

        let input = tokio::fs::read(request.input_path)
            .await
            .map_err(|e| StageError::fatal(format!("read input: {e}")))?;
        let checksum = input
            .iter()
            .fold(0u32, |acc, b| acc.rotate_left(5) ^ u32::from(*b));
        let digest = Digest {
            stage: request.stage,
            file_id: request.file_id.to_string(),
            input_bytes: input.len(),
            checksum,
            fallback: request.mode == ExecutionMode::Fallback,
        };
        let body = serde_json::to_vec_pretty(&digest)
            .map_err(|e| StageError::fatal(format!("encode digest: {e}")))?;
        tokio::fs::write(request.output_path, body)
            .await
            .map_err(|e| StageError::transient(format!("write output: {e}")))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_config(global: &GlobalArgs) -> Result<KilnConfig> {
    let mut config = match &global.config {
        Some(path) => KilnConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => KilnConfig::default(),
    };
    if let Some(root) = &global.root {
        config.storage_root = root.clone();
    }
    if let Some(workers) = global.workers {
        config.workers = workers;
    }
    Ok(config)
}

async fn build_app(config: KilnConfig, flaky: u32) -> Result<App> {
    let mut builder = AppBuilder::new(config);
    for stage in DEMO_STAGES {
        let failures = if stage == "symbolic" { flaky } else { 0 };
        builder = builder.register_stage(stage, Arc::new(DigestStage::new(failures)))?;
    }
    let app = builder.expect_stages(&DEMO_STAGES).build().await?;
    Ok(app)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(app: &App, args: &RunArgs) -> Result<()> {
    let session = app.sessions().create_session(None).await?;
    let session_id = session.session_id;

    let mut file_ids = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let name = display_name(path);
        let file = app
            .sessions()
            .register_file(session_id, &name, &bytes)
            .await
            .with_context(|| format!("upload {}", path.display()))?;
        file_ids.push(file.file_id);
    }

    let receipt = app
        .submit(session_id, file_ids, args.stages.clone())
        .await?;
    tracing::info!(job_id = %receipt.job_id, "submitted");

    let workers = app.start_workers();
    let view = poll_until_terminal(app, receipt.job_id, Duration::from_secs(args.timeout_secs)).await;
    workers.shutdown_and_join().await;
    let view = view?;

    if args.complete {
        app.sessions().mark_completed(session_id).await?;
    }
    print_json(&view)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn poll_until_terminal(
    app: &App,
    job_id: kiln_core::domain::JobId,
    timeout: Duration,
) -> Result<JobStatusView> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let view = app.status().get_job_status(job_id).await?;
        if view.status.is_terminal() {
            return Ok(view);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("job {job_id} still {} after {timeout:?}", view.status);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[derive(Serialize)]
struct SessionLine {
    session_id: SessionId,
    status: SessionStatus,
    files: usize,
    jobs: usize,
}

async fn sessions(app: &App) -> Result<()> {
    let mut lines = Vec::new();
    for session_id in app.sessions().list_session_ids().await? {
        let session = app.sessions().load(session_id).await?;
        lines.push(SessionLine {
            session_id,
            status: session.status,
            files: session.files.len(),
            jobs: session.job_ids.len(),
        });
    }
    print_json(&lines)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;

    match &cli.command {
        Command::Run(args) => {
            let app = build_app(config, args.flaky).await?;
            run(&app, args).await
        }
        Command::Sessions => {
            let app = build_app(config, 0).await?;
            sessions(&app).await
        }
        Command::Maintain => {
            let app = build_app(config, 0).await?;
            let report = app.lifecycle().run_once().await;
            print_json(&report)
        }
    }
}
