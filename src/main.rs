//! JingWei Compositor
//!
//! A multi-process display server: clients render into shared-memory
//! canvases and ask `jw-core` over a Unix socket to put them on screen.

mod app;
mod backend;
mod compositor;
mod config;
mod server;

use anyhow::{Context, Result};
use app::CompositorApp;
use backend::{HeadlessBackend, PresentationBackend, X11Backend};
use config::{BackendKind, Config};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line overrides
#[derive(Debug, Default)]
struct Args {
    headless: bool,
    socket: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--headless" => parsed.headless = true,
                "--socket" => {
                    parsed.socket = Some(args.next().context("--socket needs a path")?.into());
                }
                "--config" => {
                    parsed.config = Some(args.next().context("--config needs a path")?.into());
                }
                other => anyhow::bail!("Unknown argument: {}", other),
            }
        }
        Ok(parsed)
    }
}

fn run<B: PresentationBackend>(config: &Config, backend: B) -> Result<()> {
    let app = CompositorApp::new(config, backend)?;

    // Handle SIGTERM and SIGINT
    let shutdown = app.shutdown_flag();
    signal_hook::flag::register(SIGTERM, shutdown.clone())
        .context("Failed to install SIGTERM handler")?;
    signal_hook::flag::register(SIGINT, shutdown).context("Failed to install SIGINT handler")?;

    app.run()
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "jw_core=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting JingWei compositor");

    let args = Args::parse(std::env::args().skip(1))?;

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    if args.headless {
        config.backend.kind = BackendKind::Headless;
    }
    if let Some(socket) = args.socket {
        config.server.socket_path = Some(socket);
    }

    match config.backend.kind {
        BackendKind::X11 => {
            let backend = X11Backend::connect(config.backend.display.as_deref())
                .context("Failed to initialize X11 presentation backend")?;
            run(&config, backend)
        }
        BackendKind::Headless => {
            info!("Running headless, presented frames stay in memory");
            run(&config, HeadlessBackend::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        let args = parse(&["--headless", "--socket", "/tmp/a.sock"]).unwrap();
        assert!(args.headless);
        assert_eq!(args.socket, Some(PathBuf::from("/tmp/a.sock")));
        assert_eq!(args.config, None);

        assert!(parse(&["--socket"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }
}
