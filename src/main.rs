use std::ffi::OsString;
use std::io;

use clap::Parser;

use chplvis::backend::{analyze, dump, trace_viewer, visualize};
use chplvis::loader::{Config, load_data_with};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        required = true,
        help = "trace basename: files are named <basename>-0, <basename>-1, ..."
    )]
    basename: OsString,

    #[arg(
        short,
        long,
        help = "find trace files by listing the directory instead of reading the node count"
    )]
    discover: bool,

    #[arg(
        short,
        long,
        default_value = "chplvis",
        help = "output directory (or file, with --trace) pathname"
    )]
    output: OsString,

    #[arg(short, long, help = "overwrite output if it exists")]
    force: bool,

    #[arg(short, long, help = "print statistics")]
    statistics: bool,

    #[arg(short, long, help = "emit JSON for Google Trace Viewer")]
    trace: bool,

    #[arg(long, help = "dump the merged event sequence as JSON lines")]
    dump: bool,

    #[arg(long, help = "report repeated tag names merged into one logical tag")]
    logical: bool,

    #[arg(long, help = "decode trace files on one thread")]
    serial: bool,

    #[arg(short, long, help = "print verbose loading information")]
    verbose: bool,
}

fn main() -> io::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if [cli.statistics, cli.trace, cli.dump]
        .iter()
        .filter(|x| **x)
        .count()
        > 1
    {
        eprintln!("chplvis takes at most one of --statistics, --trace, or --dump");
        std::process::exit(2);
    }

    let config = Config {
        discover: cli.discover,
        parallel: !cli.serial,
        verbose: cli.verbose,
    };
    let state = load_data_with(&cli.basename, &config).map_err(io::Error::other)?;

    if !state.warnings().is_empty() {
        println!(
            "Warning: {} malformed events were skipped while aggregating.",
            state.warnings().len()
        );
    }

    if cli.statistics {
        analyze::print_statistics(&state, cli.logical);
    } else if cli.trace {
        trace_viewer::emit_trace(&state, cli.output, cli.force)?;
    } else if cli.dump {
        dump::dump_events(state.events(), io::stdout().lock())?;
    } else {
        visualize::emit_tsv_export(&state, cli.output, cli.force, cli.logical)?;
    }

    Ok(())
}
