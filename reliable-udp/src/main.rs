//! Entry point for `reliable-udp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing) and the file plumbing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use reliable_udp::{Config, Listener, Stream};

/// Reliable, ordered file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    tuning: Tuning,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and store each received stream as `<dir>/<n>.file`.
    Server {
        /// UDP port to listen on.
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
        /// Directory for received files.
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// Send a file to a server, then close.
    Client {
        /// Server host name or address.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Server UDP port.
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
        /// File to send.
        #[arg(short, long)]
        file: PathBuf,
    },
}

/// Protocol knobs; unset flags keep the library defaults.
#[derive(Args)]
struct Tuning {
    /// Maximum payload bytes per segment.
    #[arg(long, global = true)]
    mss: Option<usize>,
    /// Fixed transmission window in bytes.
    #[arg(long, global = true)]
    window: Option<usize>,
    /// Initial retransmission timeout in milliseconds.
    #[arg(long, global = true)]
    initial_rto_ms: Option<u64>,
    /// Consecutive timeouts tolerated before giving up.
    #[arg(long, global = true)]
    max_retries: Option<u32>,
    /// Linger after the local FIN is acknowledged, in milliseconds.
    #[arg(long, global = true)]
    linger_ms: Option<u64>,
}

impl Tuning {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = Config::default();
        if let Some(mss) = self.mss {
            config.mss = mss;
        }
        if let Some(window) = self.window {
            config.window = window;
            config.max_reorder = 2 * window;
        }
        if let Some(ms) = self.initial_rto_ms {
            config.initial_rto = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(ms) = self.linger_ms {
            config.linger = Duration::from_millis(ms);
        }
        config.validate().context("bad tuning flags")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.tuning.into_config()?;

    match cli.mode {
        Mode::Server { port, dir } => run_server(port, &dir, config).await,
        Mode::Client { host, port, file } => run_client(&host, port, &file, config).await,
    }
}

async fn run_server(port: u16, dir: &Path, config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let mut listener = Listener::bind(port, config)
        .await
        .with_context(|| format!("listening on port {port}"))?;
    log::info!("Server listening on {}", listener.local_addr());

    let mut next_id: u64 = 1;
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        let path = dir.join(format!("{next_id}.file"));
        next_id += 1;
        tokio::spawn(async move {
            if let Err(e) = store(stream, &path).await {
                log::error!("{}: {e:#}", path.display());
                if let Err(e) = tokio::fs::write(&path, b"ERROR").await {
                    log::error!("{}: {e}", path.display());
                }
            }
        });
    }
}

/// Write everything the peer sends into `path`, then finish the close.
async fn store(mut stream: Stream, path: &Path) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    let mut total = 0usize;
    while let Some(chunk) = stream.receive().await? {
        total += chunk.len();
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    stream.close().await?;
    log::info!("Stored {total} bytes from {} in {}", stream.peer(), path.display());
    Ok(())
}

async fn run_client(host: &str, port: u16, path: &Path, config: Config) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut stream = Stream::open(host, port, config)
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;

    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0usize;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.send(&buf[..n]).await?;
        total += n;
    }
    stream.close().await?;
    log::info!("Sent {total} bytes to {host}:{port}");
    Ok(())
}
