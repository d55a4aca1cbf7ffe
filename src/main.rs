//! Mercury CLI
//!
//! Small drivers for exercising the scheduling core from a shell.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mercury::config::{HostContext, RuntimeConfig};
use mercury::deferred::DeferredOptions;
use mercury::promise::{PromiseState, ReactionOptions};
use mercury::stream::{Entry, NextResult, StreamOptions, StreamState};
use mercury::{Runtime, Status, Value, VERSION};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mercury")]
#[command(author, version, about = "Frame-driven promises, streams and deferred callbacks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON runtime configuration
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Host memory budget in bytes used to derive zero capacities
    #[arg(long, value_name = "BYTES", global = true)]
    memory_budget: Option<usize>,

    /// Print a telemetry snapshot as JSON when the command finishes
    #[arg(long, global = true)]
    telemetry: bool,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved capacities
    Config {
        /// Configuration file to resolve instead of --config
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Build a promise chain and tick until it settles
    Chain {
        /// Number of reactions in the chain
        #[arg(long, default_value_t = 10)]
        length: usize,

        /// Microtasks drained per frame
        #[arg(long, default_value_t = 3)]
        budget: usize,

        /// Reject the head of the chain after this many frames instead of
        /// resolving it immediately
        #[arg(long)]
        timeout_frames: Option<u64>,
    },

    /// Run a producer and a consumer against one stream
    Stream {
        /// Items the producer emits
        #[arg(long, default_value_t = 8)]
        items: usize,

        /// Stream queue capacity
        #[arg(long, default_value_t = 2)]
        capacity: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let context = match cli.memory_budget {
        Some(bytes) => HostContext::default().with_memory_budget(bytes),
        None => HostContext::default(),
    };
    let config = load_config(cli.config.as_deref())?;

    let runtime = match cli.command {
        Commands::Config { file } => {
            let config = match file {
                Some(path) => load_config(Some(&path))?,
                None => config,
            };
            show_config(&config, &context)?;
            return Ok(());
        }
        Commands::Chain {
            length,
            budget,
            timeout_frames,
        } => {
            let config = RuntimeConfig {
                microtask_budget: budget,
                ..config
            };
            run_chain(Runtime::new(config, context)?, length, timeout_frames)?
        }
        Commands::Stream { items, capacity } => {
            run_stream(Runtime::new(config, context)?, items, capacity)?
        }
    };

    if cli.telemetry {
        println!("{}", runtime.telemetry().to_json_pretty()?);
    }
    Ok(())
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if let Err(err) = builder.try_init() {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn show_config(config: &RuntimeConfig, context: &HostContext) -> anyhow::Result<()> {
    let capacities = config
        .resolve(context)
        .context("configuration does not resolve")?;
    println!("{}", serde_json::to_string_pretty(&capacities)?);
    Ok(())
}

fn run_chain(
    mut runtime: Runtime,
    length: usize,
    timeout_frames: Option<u64>,
) -> anyhow::Result<Runtime> {
    if length == 0 {
        bail!("chain length must be at least 1");
    }

    let promises = runtime.promises_mut();
    let head = promises.create_promise("head")?;
    let mut tail = head;
    for link in 0..length {
        tail = promises.then(
            tail,
            ReactionOptions::new()
                .label(format!("link-{}", link))
                .on_fulfilled(|input| {
                    Ok(Value::from(input.value().as_number().unwrap_or(0.0) + 1.0))
                }),
        )?;
    }

    match timeout_frames {
        Some(frames) => {
            runtime.reject_after(head, DeferredOptions::new().delay_frames(frames), "timed out")?;
        }
        None => runtime.promises_mut().resolve(head, Value::from(0), "")?,
    }

    let mut frame = 0;
    while runtime.promises().is_pending(tail) {
        frame += 1;
        let report = runtime.tick(frame, 1.0 / 60.0)?;
        debug!(
            "frame {}: {} microtasks, {} left",
            frame, report.microtasks.processed, report.microtasks.remaining
        );
        if frame > length as u64 * 2 + timeout_frames.unwrap_or(0) + 2 {
            bail!("chain did not settle after {} frames", frame);
        }
    }

    let snapshot = runtime.promises().snapshot(tail)?;
    match snapshot.state {
        PromiseState::Fulfilled => println!(
            "chain of {} settled in {} frames with {}",
            length, frame, snapshot.value
        ),
        state => println!(
            "chain of {} ended {} in {} frames: {}",
            length, state, frame, snapshot.diagnostics
        ),
    }
    Ok(runtime)
}

fn run_stream(mut runtime: Runtime, items: usize, capacity: usize) -> anyhow::Result<Runtime> {
    let stream = runtime
        .streams_mut()
        .create_stream(StreamOptions::new().queue_capacity(capacity).label("cli"))?;

    let mut produced = 0;
    let mut received = Vec::new();
    let mut backpressure = 0;
    let mut frame = 0;
    let mut done = false;

    while !done {
        frame += 1;
        runtime.tick(frame, 1.0 / 60.0)?;
        let streams = runtime.streams_mut();

        // The producer runs twice as fast as the consumer.
        for _ in 0..2 {
            if produced == items {
                if streams.state(stream)? == StreamState::Active {
                    streams.signal_complete(stream)?;
                }
                break;
            }
            match streams.enqueue(stream, Entry::value(produced as f64), false) {
                Ok(_) => produced += 1,
                Err(err) if err.status() == Status::CapacityExceeded => {
                    backpressure += 1;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        for result in streams.drain_settled(stream, usize::MAX)? {
            done |= result.entry.done;
            if !result.entry.done {
                received.push(result.entry.value);
            }
        }
        if streams.snapshot(stream)?.waiting == 0 {
            match streams.request_next(stream, format!("frame-{}", frame))? {
                NextResult::Ready(result) if result.entry.done => done = true,
                NextResult::Ready(result) => received.push(result.entry.value),
                NextResult::Pending(ticket) => debug!("{} waiting", ticket),
            }
        }

        if frame > (items as u64 + 2) * 4 {
            bail!("stream did not finish after {} frames", frame);
        }
    }

    info!("stream finished in {} frames", frame);
    println!(
        "mercury {}: {} items over {} frames, producer blocked {} times",
        VERSION,
        received.len(),
        frame,
        backpressure
    );
    for value in &received {
        println!("  {}", value);
    }
    runtime.streams_mut().destroy_stream(stream)?;
    Ok(runtime)
}
