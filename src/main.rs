use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use wakemux_core::{AppConfig, DETECTION_SAMPLE_RATE};
use wakemux_engine::{ModelRegistry, ScorerCatalog};

#[derive(Parser)]
#[command(name = "wakemux", about = "On-demand wake word detection service")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "wakemux.toml")]
    config: PathBuf,

    /// Override `general.log_level` (an EnvFilter directive)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the detection protocol over TCP
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Record from the microphone between two wake words
    Record {
        /// WAV file to write (16 kHz, mono, 16-bit)
        #[arg(short, long)]
        output: PathBuf,
        /// Input device name; overrides `recorder.device_name`
        #[arg(long)]
        device: Option<String>,
    },
    /// Print the status of every configured model as JSON
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from_file(&cli.config)
        .with_context(|| format!("failed to load config from {:?}", cli.config))?;

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::Registry::default().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false),
    );
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    tracing::info!("wakemux starting");
    let registry = Arc::new(build_registry(&config)?);

    match cli.command {
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            serve(&config, &registry, &format!("{host}:{port}")).await?;
        }
        Command::Record { output, device } => {
            let device = device.unwrap_or_else(|| config.recorder.device_name.clone());
            record(&config, &registry, &device, &output).await?;
        }
        Command::Models => {
            let status = serde_json::to_string_pretty(&registry.list_status())
                .context("failed to serialize model status")?;
            println!("{status}");
        }
    }

    registry.stop().await;
    tracing::info!("wakemux stopped");
    Ok(())
}

fn build_registry(config: &AppConfig) -> Result<ModelRegistry> {
    let ttl = Duration::try_from_secs_f64(config.models.ttl_seconds)
        .with_context(|| format!("invalid models.ttl_seconds {}", config.models.ttl_seconds))?;
    let mut registry = ModelRegistry::with_catalog(Arc::new(ScorerCatalog::new()), ttl);

    if config.model.is_empty() {
        tracing::warn!("no [[model]] entries configured");
    }
    for model in &config.model {
        registry
            .register(model.clone())
            .with_context(|| format!("failed to register model '{}'", model.model_name))?;
    }
    if let Some(default) = &config.models.default {
        registry
            .set_default_model(default)
            .with_context(|| format!("default model '{default}' is not configured"))?;
    }
    Ok(registry)
}

async fn serve(config: &AppConfig, registry: &Arc<ModelRegistry>, addr: &str) -> Result<()> {
    registry.start();
    if !config.models.preload.is_empty() {
        registry
            .preload(Some(&config.models.preload))
            .await
            .context("failed to preload models")?;
    }

    let server = wakemux_protocol::ProtocolServer::bind(addr, Arc::clone(registry))
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server.run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");

    let status = serde_json::to_string(&registry.list_status())
        .context("failed to serialize model status")?;
    tracing::info!(%status, "final model status");

    cancel.cancel();
    server_task
        .await
        .context("server task panicked")?
        .context("protocol server failed")?;
    Ok(())
}

async fn record(
    config: &AppConfig,
    registry: &Arc<ModelRegistry>,
    device_name: &str,
    output: &Path,
) -> Result<()> {
    let start_model = registry
        .get_manager(config.recorder.start_model.as_deref())
        .context("failed to resolve the start model")?;
    let stop_model = match config.recorder.stop_model.as_deref() {
        Some(name) => registry
            .get_manager(Some(name))
            .context("failed to resolve the stop model")?,
        None => Arc::clone(&start_model),
    };
    registry.start();

    let device_manager = wakemux_audio::DeviceManager::new();
    let device = device_manager
        .get_input_device(device_name)
        .with_context(|| format!("failed to get input device: {device_name}"))?;
    let (tap_tx, mut tap_rx) = mpsc::unbounded_channel();
    let (_capture, capture_handle) = wakemux_audio::CaptureNode::new(&device, tap_tx, "mic")
        .with_context(|| format!("failed to open input device: {device_name}"))?;

    let stop = CancellationToken::new();
    let (pcm_tx, pcm_rx) = mpsc::channel(config.recorder.queue_capacity.max(1));
    let bridge = tokio::spawn(async move {
        while let Some(chunk) = tap_rx.recv().await {
            let pcm = match wakemux_audio::pcm16_mono_16k(&chunk) {
                Ok(pcm) => pcm,
                Err(e) => {
                    tracing::error!("dropping capture chunk: {e}");
                    continue;
                }
            };
            if pcm_tx.send(pcm).await.is_err() {
                break;
            }
        }
    });

    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stop requested");
            ctrl_c_stop.cancel();
        }
    });

    tracing::info!(
        start_model = %start_model.name(),
        stop_model = %stop_model.name(),
        "say the wake word to start recording"
    );
    let recorder = wakemux_recorder::DualPhaseRecorder::new(start_model, stop_model)
        .with_queue_capacity(config.recorder.queue_capacity);
    let recording = recorder
        .record(pcm_rx, stop.clone())
        .await
        .context("recording failed")?;

    capture_handle.set_enabled(false);
    bridge.abort();
    if capture_handle.has_failed() {
        tracing::warn!("capture device reported an error during recording");
    }

    match recording {
        Some(pcm) => {
            write_wav(output, &pcm)?;
            tracing::info!(
                path = %output.display(),
                seconds = pcm.len() as f64 / (2.0 * DETECTION_SAMPLE_RATE as f64),
                "recording saved"
            );
            Ok(())
        }
        None if stop.is_cancelled() => {
            tracing::info!("stopped before the stop word; nothing written");
            Ok(())
        }
        None => bail!("audio capture ended before the stop word"),
    }
}

fn write_wav(path: &Path, pcm: &[u8]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: DETECTION_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for sample in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
            .context("failed to write sample")?;
    }
    writer.finalize().context("failed to finalize WAV file")?;
    Ok(())
}
