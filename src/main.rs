use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use async_trait::async_trait;
use videonode::encoder::{EncoderProbe, EncoderSelector};
use videonode::events::{Event, EventBus};
use videonode::model::Codec;
use videonode::ring::LogRing;
use videonode::store::StreamStore;
use videonode::supervisor::{ChildHandle, EncoderRunner, LineSource, ProcessSupervisor};
use videonode::{AppError, Result};

/// Log level for the application.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// videonode command line arguments.
#[derive(Parser, Debug)]
#[command(name = "videonode")]
#[command(version, about = "Stream orchestration core for a single-host video node", long_about = None)]
struct CliArgs {
    /// Log level (error, warn, info, debug, trace).
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Probe every known encoder candidate for H.264/H.265 and persist the
    /// result into the validation sidecar at `-o`.
    ValidateEncoders {
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,

        /// Suppress per-encoder progress logging.
        #[arg(long)]
        quiet: bool,
    },
    /// Run a single stream's supervisor in isolation.
    Stream {
        /// Stream id, as stored in the config file.
        id: String,

        #[arg(long, value_name = "FILE", default_value = "/etc/videonode/streams.toml")]
        config: PathBuf,

        /// Force a specific encoder name instead of the validated default.
        #[arg(long, value_name = "NAME")]
        encoder_override: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!(
        "videonode v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_DATE")
    );

    match args.command {
        CliCommand::ValidateEncoders { output, quiet } => validate_encoders(output, quiet).await,
        CliCommand::Stream {
            id,
            config,
            encoder_override,
        } => run_stream(id, config, encoder_override).await,
    }
}

async fn validate_encoders(output: PathBuf, quiet: bool) -> anyhow::Result<()> {
    let probe = ProcessEncoderProbe;
    let store = StreamStore::new(&output);
    // A fresh install has no sidecar yet; a missing file is not an error.
    let _ = store.load();

    let mut record = store.get_validation();
    for codec in [Codec::H264, Codec::H265] {
        let (working, failed) = EncoderSelector::validate(codec, &probe).await;
        if !quiet {
            tracing::info!(
                codec = codec.as_str(),
                working = working.len(),
                failed = failed.len(),
                "encoder validation complete"
            );
        }
        let entry = record.for_codec_mut(codec);
        entry.working = working;
        entry.failed = failed;
    }

    store.update_validation(record)?;
    store.save()?;
    tracing::info!(path = %output.display(), "validation sidecar written");
    Ok(())
}

async fn run_stream(id: String, config: PathBuf, encoder_override: Option<String>) -> anyhow::Result<()> {
    let store = StreamStore::new(&config);
    store.load()?;
    let spec = store
        .get(&id)
        .ok_or_else(|| AppError::StreamNotFound(id.clone()))?;

    let bus = Arc::new(EventBus::new());
    let ring = Arc::new(LogRing::default());
    tokio::spawn(drain_bus_to_ring(bus.subscribe(), ring));

    let supervisor = Arc::new(ProcessSupervisor::new(Arc::new(ProcessEncoderRunner), bus.clone()));
    tokio::spawn(supervisor.clone().run_device_discovery_loop(bus));
    let device_path = Some(spec.device.clone());
    supervisor
        .register(spec, device_path, true, encoder_override)
        .await;
    supervisor.start(&id).await?;

    tracing::info!(stream_id = %id, "stream running, press Ctrl+C to stop");
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });
    let _ = shutdown_rx.recv().await;

    tracing::info!(stream_id = %id, "shutting down");
    supervisor.stop(&id).await?;
    Ok(())
}

/// Bridges the event bus into both `tracing` (so stdout shows live activity)
/// and the log ring (so the last 1000 entries are retained in memory).
async fn drain_bus_to_ring(mut rx: broadcast::Receiver<Event>, ring: Arc<LogRing>) {
    loop {
        match rx.recv().await {
            Ok(Event::Log { entry }) => {
                tracing::info!(module = %entry.module, "{}", entry.message);
                ring.append(entry);
            }
            Ok(Event::StreamCrashed { stream_id, .. }) => {
                tracing::error!(stream_id = %stream_id, "stream crashed");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Spawns the encoder binary as a real child process: piped stdout/stderr
/// drained by dedicated reader tasks, `kill_on_drop` as a backstop against
/// orphaned children if this process is killed uncleanly.
struct ProcessEncoderRunner;

#[async_trait]
impl EncoderRunner for ProcessEncoderRunner {
    async fn spawn(&self, argv: &[String]) -> Result<Box<dyn ChildHandle>> {
        let (bin, rest) = argv
            .split_first()
            .ok_or_else(|| AppError::Internal("empty encoder argv".into()))?;

        let mut child = Command::new(bin)
            .args(rest)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::SpawnFailed {
                stream_id: "unknown".into(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, LineSource::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, LineSource::Stderr, tx.clone());
        }

        Ok(Box::new(ProcessChildHandle { child, lines: rx }))
    }
}

fn spawn_line_reader<R>(reader: R, source: LineSource, tx: mpsc::Sender<(LineSource, String)>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((source, line)).await.is_err() {
                break;
            }
        }
    });
}

struct ProcessChildHandle {
    child: tokio::process::Child,
    lines: mpsc::Receiver<(LineSource, String)>,
}

#[async_trait]
impl ChildHandle for ProcessChildHandle {
    async fn next_line(&mut self) -> Option<(LineSource, String)> {
        self.lines.recv().await
    }

    async fn wait(&mut self) -> i32 {
        match self.child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        }
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Validates an encoder candidate by asking `ffmpeg` to actually encode one
/// frame with it; only a clean exit counts as "working".
struct ProcessEncoderProbe;

#[async_trait]
impl EncoderProbe for ProcessEncoderProbe {
    async fn probe(&self, encoder_name: &str, _codec: Codec) -> bool {
        let status = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "lavfi",
                "-i",
                "testsrc=size=64x64:rate=1:duration=1",
                "-frames:v",
                "1",
                "-c:v",
                encoder_name,
                "-f",
                "null",
                "-",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "videonode=error",
        LogLevel::Warn => "videonode=warn",
        LogLevel::Info => "videonode=info",
        LogLevel::Debug => "videonode=debug",
        LogLevel::Trace => "videonode=trace",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}
