use std::{
    fs::File,
    io::{stdout, BufReader, BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use coherence_sim::{
    bus::{self, BusPolicy},
    config::{DelayPolicy, ShutdownPolicy, SimConfig},
    io::{JsonLinesSink, LogSink, TraceSink},
    sim::{SimOutput, Simulator},
    trace::{InstrStream, MalformedPolicy, TraceReader},
};

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// run every core on its own thread
    Run(RunArgs),
    /// run on one thread following a fixed core schedule
    Replay(ReplayArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// One trace file per core, in core order
    #[arg(required = true)]
    traces: Vec<PathBuf>,
    /// JSON configuration; flags below override it. The core count always
    /// follows the number of traces
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Cache lines per core
    #[arg(long)]
    lines: Option<usize>,
    /// Memory size in bytes
    #[arg(long = "memory")]
    memory_size: Option<usize>,
    /// Keep at most this many bus entries
    #[arg(long)]
    bus_capacity: Option<usize>,
    /// Pause before each instruction, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Scale the pause by core number
    #[arg(long, requires = "delay_ms")]
    stagger: bool,
    /// Warn and continue on malformed trace lines
    #[arg(long)]
    skip_malformed: bool,
    #[arg(long, value_enum)]
    shutdown: Option<Shutdown>,
    /// Verify coherence invariants after the run (settles the bus first)
    #[arg(long)]
    check: bool,
    /// Write trace records as JSON lines to this file instead of the log
    #[arg(long)]
    json: Option<PathBuf>,
    /// Print the bus log to stdout
    #[arg(long)]
    dump_bus: bool,
    /// Print every cache line of every core to stdout
    #[arg(long)]
    dump_caches: bool,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    delegate: CommonArgs,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    #[command(flatten)]
    delegate: CommonArgs,
    /// Core numbers (from 1) to step in order, e.g. `1,2,2,1`
    #[arg(
        short,
        long,
        value_delimiter = ',',
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    schedule: Vec<usize>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Shutdown {
    Halt,
    Settle,
    Flush,
}

impl From<Shutdown> for ShutdownPolicy {
    fn from(s: Shutdown) -> Self {
        match s {
            Shutdown::Halt => ShutdownPolicy::Halt,
            Shutdown::Settle => ShutdownPolicy::Settle,
            Shutdown::Flush => ShutdownPolicy::SettleAndFlush,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let (common, schedule) = match args.command {
        Command::Run(RunArgs { delegate }) => (delegate, None),
        Command::Replay(ReplayArgs { delegate, schedule }) => (delegate, Some(schedule)),
    };
    if common.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::init();
    }
    let config = build_config(&common)?;
    let streams = open_traces(&common.traces)?;

    let json = match &common.json {
        Some(p) => {
            let f = File::create(p).with_context(|| format!("cannot create {}", p.display()))?;
            Some(JsonLinesSink::new(BufWriter::new(f)))
        }
        None => None,
    };
    let log_sink = LogSink;
    let sink: &dyn TraceSink = match &json {
        Some(j) => j,
        None => &log_sink,
    };

    let sim = Simulator::new(config, streams, sink)?;
    let output = match schedule {
        // core numbers on the command line count from 1
        Some(s) => sim.run_interleaved(s.into_iter().map(|c| c - 1))?,
        None => sim.run()?,
    };
    log::info!("finished execution.");

    if let Some(j) = json {
        j.into_inner().flush().context("failed to write trace records")?;
    }
    report(&output, &common)
}

fn build_config(args: &CommonArgs) -> Result<SimConfig> {
    let config = match &args.config {
        Some(p) => {
            let f = File::open(p).with_context(|| format!("cannot open {}", p.display()))?;
            SimConfig::from_reader(BufReader::new(f))
                .with_context(|| format!("in {}", p.display()))?
        }
        None => SimConfig::default(),
    };
    apply_args(config, args)
}

fn apply_args(mut config: SimConfig, args: &CommonArgs) -> Result<SimConfig> {
    if config.cores != args.traces.len() && args.config.is_some() {
        log::warn!(
            "configured for {} cores, running {} traces",
            config.cores,
            args.traces.len()
        );
    }
    config.cores = args.traces.len();
    if let Some(n) = args.lines {
        config.cache_lines = n;
    }
    if let Some(n) = args.memory_size {
        config.memory_size = n;
    }
    if let Some(capacity) = args.bus_capacity {
        config.bus = BusPolicy::Bounded { capacity };
    }
    if let Some(ms) = args.delay_ms {
        config.delay = if args.stagger {
            DelayPolicy::Staggered(ms)
        } else {
            DelayPolicy::Fixed(ms)
        };
    }
    if args.skip_malformed {
        config.malformed = MalformedPolicy::Skip;
    }
    if let Some(s) = args.shutdown {
        config.shutdown = s.into();
    }
    if args.check && !config.shutdown.settles() {
        config.shutdown = ShutdownPolicy::Settle;
    }
    config.validate()?;
    Ok(config)
}

/// Every trace is opened before any core starts.
fn open_traces(paths: &[PathBuf]) -> Result<Vec<Box<dyn InstrStream>>> {
    paths
        .iter()
        .map(|p| {
            let f = File::open(p).with_context(|| format!("cannot open trace {}", p.display()))?;
            Ok(Box::new(TraceReader::new(BufReader::new(f))) as Box<dyn InstrStream>)
        })
        .collect()
}

fn report(output: &SimOutput, args: &CommonArgs) -> Result<()> {
    for r in &output.reports {
        if !r.faults.is_empty() {
            log::warn!("{}: {} instructions not serviced", r.core, r.faults.len());
        }
    }
    log::info!("memory: {:?}", output.memory);
    output_stat(output);
    if args.dump_bus {
        bus::dump(&output.bus, stdout().lock())?;
    }
    if args.dump_caches {
        let mut out = stdout().lock();
        for cache in output.caches() {
            writeln!(out, "{cache}")?;
        }
    }
    if args.check {
        output.verify().context("coherence check failed")?;
        log::info!("coherence check passed.");
    }
    Ok(())
}

#[cfg(not(feature = "stat"))]
fn output_stat(_: &SimOutput) {}

#[cfg(feature = "stat")]
fn output_stat(output: &SimOutput) {
    let max_width = get_terminal_width().unwrap_or(120) as usize;
    log::info!("statistics:\n{}", output.collect_stat().view(max_width));
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}
