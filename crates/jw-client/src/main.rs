//! JingWei demo client
//!
//! Opens a display on jw-core, maps its canvas and cycles a solid color
//! through it at 10 FPS.

mod ipc;

use anyhow::{Context, Result};
use ipc::IpcClient;
use jw_ipc::{SharedBuffer, BYTES_PER_PIXEL};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Socket wait, in retry intervals
const CONNECT_RETRIES: u32 = 100;

#[derive(Debug, PartialEq, Eq)]
struct Args {
    name: String,
    width: u32,
    height: u32,
    /// 0 runs until the server goes away
    frames: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            name: "Client1".into(),
            width: 800,
            height: 480,
            frames: 0,
        }
    }
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--name" => parsed.name = args.next().context("--name needs a value")?,
                "--size" => {
                    let size = args.next().context("--size needs WxH")?;
                    let (w, h) = size
                        .split_once('x')
                        .with_context(|| format!("Invalid size: {}", size))?;
                    parsed.width = w.parse().with_context(|| format!("Invalid width: {}", w))?;
                    parsed.height = h.parse().with_context(|| format!("Invalid height: {}", h))?;
                }
                "--frames" => {
                    let n = args.next().context("--frames needs a count")?;
                    parsed.frames = n.parse().with_context(|| format!("Invalid frame count: {}", n))?;
                }
                other => anyhow::bail!("Unknown argument: {}", other),
            }
        }
        Ok(parsed)
    }
}

/// Solid color that drifts a little every frame
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ColorCycle {
    r: u32,
    g: u32,
    b: u32,
}

impl ColorCycle {
    fn step(&mut self) {
        self.r = (self.r + 2) % 255;
        self.g = (self.g + 5) % 255;
        self.b = (self.b + 8) % 255;
    }

    /// Opaque ARGB
    fn argb(&self) -> u32 {
        (255 << 24) | (self.r << 16) | (self.g << 8) | self.b
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "jw_client=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse(std::env::args().skip(1))?;
    info!("Starting JingWei client '{}' ({}x{})", args.name, args.width, args.height);

    let mut client = IpcClient::connect(&jw_ipc::socket_path(), CONNECT_RETRIES).await?;

    let display_id = client
        .create_display(&args.name, args.width, args.height)
        .await?;
    info!("Display {} created", display_id);

    let canvas_name = client
        .create_canvas(display_id, args.width, args.height)
        .await?;
    let size = args.width as usize * args.height as usize * BYTES_PER_PIXEL;
    let mut canvas = SharedBuffer::open(&canvas_name, size)
        .with_context(|| format!("Failed to map canvas {}", canvas_name))?;
    info!("Mapped canvas {} ({} bytes)", canvas_name, size);

    let mut color = ColorCycle::default();
    let mut interval = tokio::time::interval(FRAME_INTERVAL);
    let mut frame = 0u64;
    while args.frames == 0 || frame < args.frames {
        interval.tick().await;
        canvas.fill(color.argb());
        client.commit(display_id).await?;
        debug!("Frame {} committed with {:#010x}", frame, color.argb());
        color.step();
        frame += 1;
    }

    info!("Done after {} frames", frame);
    Ok(())
}
