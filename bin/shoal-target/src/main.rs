//! shoal storage target daemon

use anyhow::{bail, Context, Result};
use clap::Parser;
use shoal_common::Config;
use shoal_node::{http, Node};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// A shutdown marker parks the process instead of serving (set by a
/// decommission; cleared by the operator).
const SHUTDOWN_MARKER: &str = ".shutdown";

#[derive(Parser, Debug)]
#[command(name = "shoal-target", about = "shoal storage target daemon", version)]
struct Args {
    /// Target id (must be cluster-unique)
    #[arg(long)]
    tid: String,

    /// Path to the JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Configuration directory (shutdown marker, local state)
    #[arg(long, default_value = "/etc/shoal")]
    config_dir: PathBuf,

    /// Mountpaths (one filesystem per disk); repeatable
    #[arg(long = "mountpath", required = true)]
    mountpaths: Vec<PathBuf>,

    /// Override the intra-cluster API listen address
    #[arg(long)]
    listen: Option<String>,

    /// Log to stderr instead of the configured log directory
    #[arg(long)]
    stderr_log: bool,
}

fn init_logging(args: &Args, config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    if args.stderr_log {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }
    let appender = tracing_appender::rolling::daily(&config.log.dir, "shoal-target.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

fn main() {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("FATAL: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    let _log_guard = init_logging(&args, &config);

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(1);
    }

    // a present shutdown marker parks the process (no restart loops
    // under a supervisor)
    let marker = args.config_dir.join(SHUTDOWN_MARKER);
    if marker.exists() {
        warn!(marker = %marker.display(), "shutdown marker present, parking");
        loop {
            std::thread::sleep(std::time::Duration::from_secs(3600));
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    let code = match runtime.block_on(run(args, config)) {
        Ok(code) => code,
        Err(e) => {
            error!("FATAL: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args, config: Config) -> Result<i32> {
    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| config.net.listen.clone());
    let stream_listen = config.net.stream_listen.clone();

    let node = Node::new(&args.tid, config, &args.mountpaths)
        .context("failed to initialize the target")?;
    info!(tid = %args.tid, mountpaths = args.mountpaths.len(), "target initialized");

    let stream_addr = node
        .serve_streams(&stream_listen)
        .await
        .context("failed to bind the stream listener")?;
    info!(%stream_addr, "inter-target streams listening");

    let _hk = node.hk.spawn();

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, "intra-cluster API listening");
    let router = http::router(node.clone());

    let shutdown = shutdown_signal();
    tokio::select! {
        res = axum::serve(listener, router) => {
            res.context("http server failed")?;
            Ok(0)
        }
        signum = shutdown => {
            info!(signum, "signal received, shutting down");
            node.tgt.reg.abort_all("target shutting down");
            Ok(128 + signum)
        }
    }
}

async fn shutdown_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("sigint handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
    tokio::select! {
        _ = sigint.recv() => libc_signum::SIGINT,
        _ = sigterm.recv() => libc_signum::SIGTERM,
    }
}

mod libc_signum {
    pub const SIGINT: i32 = 2;
    pub const SIGTERM: i32 = 15;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let args = Args::try_parse_from([
            "shoal-target",
            "--tid",
            "t01",
            "--mountpath",
            "/data/1",
            "--mountpath",
            "/data/2",
            "--stderr-log",
        ])
        .unwrap();
        assert_eq!(args.tid, "t01");
        assert_eq!(args.mountpaths.len(), 2);
        assert!(args.stderr_log);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_mountpath_required() {
        assert!(Args::try_parse_from(["shoal-target", "--tid", "t01"]).is_err());
    }
}
