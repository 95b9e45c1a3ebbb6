use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chorus_audio::loopback_iodev::{LoopbackIodev, LoopbackRing, LoopbackType};
use chorus_audio::test_iodev::TestIodev;
use chorus_server::{Server, ServerConfig};

/// User-space audio routing daemon.
#[derive(Debug, Parser)]
#[command(name = "chorusd", version)]
struct Cli {
    /// Configuration file (JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the control and per-stream sockets.
    #[arg(long)]
    sock_dir: Option<PathBuf>,

    /// Directory for shared-memory files.
    #[arg(long)]
    shm_dir: Option<PathBuf>,

    /// Group id granted access to the socket directory.
    #[arg(long)]
    audio_gid: Option<u32>,

    /// DSP configuration file for the reload handler.
    #[arg(long)]
    dsp_config: Option<PathBuf>,

    /// Create loopback capture devices fed from the playback mix.
    #[arg(long)]
    enable_loopback: bool,

    /// Register a virtual hotword-capable capture device.
    #[arg(long)]
    test_device: bool,

    /// Log filter, e.g. "info" or "chorus_audio=debug".
    #[arg(long)]
    log: Option<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("chorusd: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let mut config = match cli.config.as_deref() {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(sock_dir) = cli.sock_dir {
        config.shm_dir = sock_dir.join("shm");
        config.sock_dir = sock_dir;
    }
    if let Some(shm_dir) = cli.shm_dir {
        config.shm_dir = shm_dir;
    }
    if cli.audio_gid.is_some() {
        config.audio_gid = cli.audio_gid;
    }
    if cli.dsp_config.is_some() {
        config.dsp_config = cli.dsp_config;
    }

    let mut server = Server::new(config).context("server initialization failed")?;

    if cli.enable_loopback {
        for loopback_type in [LoopbackType::PostMixPreDsp, LoopbackType::PostDsp] {
            let ring = LoopbackRing::new(
                loopback_type,
                chorus_audio::loopback_iodev::LOOPBACK_BUFFER_FRAMES,
                4,
            );
            let dev = LoopbackIodev::new(ring.clone());
            let index = server.add_device(Box::new(dev), Some(ring));
            info!(dev = index, ?loopback_type, "loopback device registered");
        }
    }
    if cli.test_device {
        let index = server.add_device(Box::new(TestIodev::new(true)), None);
        info!(dev = index, "test device registered");
    }

    info!("chorusd up");
    server.run().context("server loop failed")?;
    Ok(())
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
