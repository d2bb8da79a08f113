//! Pipe Stage Demo - Main Entry Point
//!
//! Runs a single pipe over a simulated device node and prints its statistics
//! and final state dump.

use anyhow::Context;
use clap::{Parser, Subcommand};
use pipe_stage::{
    Frame, MockNode, Pipe, PipeConfig, PipeId, PipeInfo, RetrieveStep, ShotMetadata,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long the demo waits for a frame before declaring the pipe stuck
const OUTPUT_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "pipe-stage")]
#[command(about = "Drive a pipeline stage over a simulated device node")]
#[command(version)]
struct Cli {
    /// Pipe configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to a daily rotated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream frames through the worker thread
    Run {
        /// Number of frames to push
        #[arg(short, long, default_value = "30")]
        frames: u64,

        /// Buffers in the pool
        #[arg(short, long, default_value = "4")]
        buffers: u32,

        /// Return the first pool's worth of buffers in reverse order
        #[arg(long)]
        reorder: bool,
    },

    /// Submit and retrieve frames synchronously in instant mode
    Instant {
        /// Number of frames to process
        #[arg(short, long, default_value = "8")]
        frames: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let (file_layer, _guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pipe-stage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pipe_stage=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    let config = match &cli.config {
        Some(path) => PipeConfig::load(path)
            .with_context(|| format!("loading pipe config {}", path.display()))?,
        None => PipeConfig::new(PipeId(1), "PIPE_DEMO"),
    };

    match cli.command {
        Commands::Run {
            frames,
            buffers,
            reorder,
        } => run_threaded(config, frames, buffers, reorder),
        Commands::Instant { frames } => run_instant(config, frames),
        Commands::Config => {
            let text = toml::to_string_pretty(&config).context("serializing config")?;
            println!("{}", text);
            Ok(())
        }
    }
}

fn request(sequence: u64) -> ShotMetadata {
    ShotMetadata {
        request_frame_count: sequence as u32,
        ..Default::default()
    }
}

fn run_threaded(
    config: PipeConfig,
    frames: u64,
    buffers: u32,
    reorder: bool,
) -> anyhow::Result<()> {
    let pipe_id = config.pipe_id;
    let node = MockNode::new("mock-node");
    let handle = node.handle();
    if reorder {
        handle.script((0..buffers as usize).rev().map(RetrieveStep::Index));
    }

    let mut pipe = Pipe::new(config, Box::new(node))?;
    let (out_tx, out_rx) = crossbeam_channel::unbounded();
    pipe.set_output_queue(out_tx)?;
    pipe.create()?;
    pipe.setup(PipeInfo::new(640, 480, "NV21", buffers))?;
    pipe.start()?;
    pipe.start_thread()?;

    let pool = pipe.buffer_pool();
    let mut sent = 0;
    let mut received = 0;
    while received < frames {
        while sent < frames {
            let Some(buffer) = pool.acquire() else { break };
            sent += 1;
            let frame = Frame::new(sent)
                .with_buffer(pipe_id, buffer)
                .with_metadata(request(sent));
            pipe.push_frame(frame)?;
        }

        let mut frame = out_rx
            .recv_timeout(OUTPUT_WAIT)
            .with_context(|| {
                format!("no frame from {} after {} of {}", pipe.name(), received, frames)
            })?;
        received += 1;
        tracing::debug!(
            "frame {} out: {:?}, dynamic {:?}",
            frame.sequence(),
            frame.stage_state(pipe_id),
            frame.dynamic_metadata()
        );
        if let Some(buffer) = frame.take_buffer(pipe_id) {
            pool.release(buffer);
        }
    }

    let dump = pipe.dump();
    pipe.stop()?;
    report(&pipe, &dump)?;
    pipe.destroy()?;
    Ok(())
}

fn run_instant(config: PipeConfig, frames: u64) -> anyhow::Result<()> {
    let pipe_id = config.pipe_id;
    let mut pipe = Pipe::new(config, Box::new(MockNode::new("mock-node")))?;
    let (out_tx, _out_rx) = crossbeam_channel::unbounded();
    pipe.set_output_queue(out_tx)?;
    pipe.create()?;
    pipe.setup(PipeInfo::new(640, 480, "NV21", 2))?;
    pipe.instant_on()?;

    let pool = pipe.buffer_pool();
    for sequence in 1..=frames {
        let buffer = pool.acquire().context("buffer pool exhausted")?;
        let frame = Frame::new(sequence)
            .with_buffer(pipe_id, buffer)
            .with_metadata(request(sequence));
        pipe.instant_submit(frame)?;

        let mut done = pipe
            .instant_retrieve()?
            .with_context(|| format!("frame {} did not come back", sequence))?;
        tracing::info!(
            "frame {} done, applied crop {:?}",
            done.sequence(),
            done.dynamic_metadata().and_then(|d| d.applied_crop)
        );
        if let Some(buffer) = done.take_buffer(pipe_id) {
            pool.release(buffer);
        }
    }

    let dump = pipe.dump();
    pipe.instant_off()?;
    report(&pipe, &dump)?;
    pipe.destroy()?;
    Ok(())
}

fn report(pipe: &Pipe, dump: &pipe_stage::PipeDump) -> anyhow::Result<()> {
    let stats = pipe.stats();
    println!(
        "{}: {} submitted, {} completed, {} failed, {} retrieve timeouts ({:.1}% complete)",
        pipe.name(),
        stats.submitted,
        stats.completed,
        stats.failed_local,
        stats.retrieve_timeouts,
        stats.completion_rate()
    );
    println!("{}", dump.to_json()?);
    Ok(())
}
