use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    process,
    time::Instant,
};

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use memtrack::{
    Result, SbifSummary, SyntheticWorkload, TraceEvent, TraceReader, Tracker, TrackerCreateInfo,
    write_trace,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct TrackerArgs {
    /// Number of lanes (power of two)
    #[arg(long)]
    lanes: Option<usize>,

    /// Items a lane stages before a batch is dispatched
    #[arg(long)]
    lane_capacity: Option<usize>,

    /// Worker threads, 0 runs every job inline
    #[arg(long)]
    workers: Option<usize>,

    /// Serials per output column
    #[arg(long, default_value_t = 4096)]
    events_per_column: u32,

    /// Print every allocation still live at end of trace
    #[arg(long)]
    list_leaks: bool,
}

impl TrackerArgs {
    fn create_info(&self) -> TrackerCreateInfo {
        TrackerCreateInfo {
            lane_count: self.lanes,
            lane_capacity: self.lane_capacity,
            workers: self.workers,
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track the events of a text trace
    Replay {
        /// Trace file, one `alloc` or `free` per line
        file: PathBuf,

        #[command(flatten)]
        tracker: TrackerArgs,
    },

    /// Track a random well-formed workload
    Synth {
        #[arg(long, default_value_t = 1_000_000)]
        events: usize,

        /// Upper bound of simultaneously live allocations
        #[arg(long, default_value_t = 10_000)]
        live: usize,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Also write the workload as a text trace
        #[arg(long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        tracker: TrackerArgs,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Command::Replay { file, tracker } => replay(&file, &tracker),
        Command::Synth {
            events,
            live,
            seed,
            output,
            tracker,
        } => synth(events, live, seed, output.as_deref(), &tracker),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn replay(file: &Path, args: &TrackerArgs) -> Result<()> {
    let reader = TraceReader::new(BufReader::new(File::open(file)?));
    track(reader, args)
}

fn synth(
    events: usize,
    live: usize,
    seed: u64,
    output: Option<&Path>,
    args: &TrackerArgs,
) -> Result<()> {
    if let Some(path) = output {
        let out = BufWriter::new(File::create(path)?);
        write_trace(out, SyntheticWorkload::new(seed, events, live))?;
        println!("wrote {events} events to {}", path.display());
    }
    track(SyntheticWorkload::new(seed, events, live).map(Ok), args)
}

fn track(events: impl IntoIterator<Item = Result<TraceEvent>>, args: &TrackerArgs) -> Result<()> {
    let settings = args.create_info().build()?;
    let builder = SbifSummary::new(args.events_per_column).keep_leaks(args.list_leaks);
    let mut tracker = Tracker::new(settings, builder)?;

    let started = Instant::now();
    tracker.begin();
    for event in events {
        match event? {
            TraceEvent::Alloc { address, metadata } => {
                tracker.add_alloc(address, &metadata);
            }
            TraceEvent::Free { address } => {
                tracker.add_free(address);
            }
        }
    }
    tracker.end();
    let elapsed = started.elapsed();

    let stats = tracker.stats();
    let rate = stats.events as f64 / elapsed.as_secs_f64().max(1e-9) / 1e6;
    println!(
        "events:         {} in {:.3}s ({rate:.2} M/s)",
        stats.events,
        elapsed.as_secs_f64()
    );
    println!("  allocs:       {}", stats.allocs);
    println!("  frees:        {}", stats.frees);
    println!("  ignored:      {}", stats.ignored_events);
    println!(
        "anomalies:      {} unmatched frees, {} double frees, {} superseded allocs",
        stats.lanes.unmatched_frees, stats.lanes.double_frees, stats.lanes.superseded_allocs
    );
    println!(
        "dispatches:     {} ({} grown, {} compacted sets)",
        stats.dispatches, stats.rehashes, stats.compactions
    );
    println!("metadata:       {} entries", tracker.metadata().len());

    let summary = tracker.builder();
    print!("{summary}");
    if args.list_leaks {
        println!("leaks:");
        for leak in summary.leak_records() {
            println!(
                "  {:#014x} serial={} size={} owner={:#x} tag={}",
                leak.address, leak.start_serial, leak.size, leak.owner, leak.tag
            );
        }
    }
    Ok(())
}
