//! Server and operator CLI for kURL installer bundles.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use kurl_bundle::{Bundler, Config, DEFAULT_LISTEN, DEFAULT_SCRATCH_DIR, DEFAULT_UPSTREAM};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "kurl-bundle",
    version,
    about = "Streams kURL installer bundles as gzip tar archives"
)]
struct Cli {
    #[command(flatten)]
    opts: ServeArgs,

    /// Log output format.
    #[arg(long, global = true, env = "KURL_BUNDLE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bundle server (default).
    Serve,

    /// Pull one image into a docker-archive file.
    Pull {
        /// Image reference (e.g., ttl.sh/org/app:1h).
        image: String,
        /// Destination archive.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "KURL_BUNDLE_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Base URL of the manifest service.
    #[arg(long, env = "KURL_BUNDLE_UPSTREAM", default_value = DEFAULT_UPSTREAM)]
    upstream: String,

    /// Directory for per-image scratch space.
    #[arg(long, env = "KURL_BUNDLE_SCRATCH_DIR", default_value = DEFAULT_SCRATCH_DIR)]
    scratch_dir: PathBuf,

    /// Timeout in seconds for each outbound HTTP request.
    #[arg(long, env = "KURL_BUNDLE_HTTP_TIMEOUT")]
    http_timeout: Option<u64>,

    /// Release stage attached to error reports.
    #[arg(long, env = "ENVIRONMENT")]
    environment: Option<String>,
}

impl ServeArgs {
    fn timeout(&self) -> Option<Duration> {
        self.http_timeout.map(Duration::from_secs)
    }

    fn config(&self) -> Config {
        Config::default()
            .listen(self.listen)
            .upstream(self.upstream.clone())
            .scratch_dir(self.scratch_dir.clone())
            .http_timeout(self.timeout())
            .release_stage(self.environment.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    if let Err(e) = cli.dispatch().await {
        eprintln!("kurl-bundle: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => fmt.init(),
        LogFormat::Json => fmt.json().init(),
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command.unwrap_or(Command::Serve) {
            Command::Serve => serve(&self.opts).await,
            Command::Pull { image, output } => pull(self.opts.timeout(), image, output).await,
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "kurl-bundle",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

async fn serve(opts: &ServeArgs) -> Result<()> {
    let config = opts.config();
    let commit = std::env::var("VERSION").unwrap_or_else(|_| "unknown".to_owned());
    tracing::info!(%commit, "kurl-bundle starting");

    std::fs::create_dir_all(&config.scratch_dir)
        .with_context(|| format!("creating scratch dir {}", config.scratch_dir.display()))?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    let bundler = Arc::new(Bundler::builder(config).build());
    kurl_bundle::serve(bundler, listener, shutdown_signal()).await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn pull(timeout: Option<Duration>, image: String, output: PathBuf) -> Result<()> {
    let dest = output.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let staging = tempfile::Builder::new()
            .prefix(kurl_bundle::SCRATCH_PREFIX)
            .tempdir()?;
        kurl_bundle_oci::Puller::new(kurl_bundle_oci::agent(timeout))
            .save(&image, staging.path(), &dest)
            .with_context(|| format!("pulling {image}"))?;
        staging.close()?;
        Ok(())
    })
    .await??;
    println!("{}", output.display());
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown requested, draining connections");
}
