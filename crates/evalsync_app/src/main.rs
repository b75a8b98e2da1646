mod config;
mod logging;
mod run;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use evalsync_engine::ClientHandle;
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, author, about = "Follow evaluation runs until they finish.")]
struct Args {
    /// Evaluation ids to follow.
    #[arg(index(1))]
    ids: Vec<String>,

    /// RON configuration file; defaults apply when it does not exist.
    #[arg(short, long, default_value = "evalsync.ron")]
    config: PathBuf,

    /// Override the REST base url, e.g. http://localhost:8000/api/v1.
    #[arg(long)]
    api: Option<String>,

    /// Override the push base url, e.g. ws://localhost:8000.
    #[arg(long)]
    ws: Option<String>,

    /// Also print notifications for this user.
    #[arg(short, long)]
    user: Option<String>,

    /// Also print broadcast messages.
    #[arg(long)]
    broadcast: bool,

    /// Fetch and print the evaluation list first.
    #[arg(short, long)]
    list: bool,

    /// Give up after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Write the effective configuration to --config and exit.
    #[arg(long)]
    write_config: bool,

    /// Write logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log only to --log-file, not the terminal.
    #[arg(short, long, requires = "log_file")]
    quiet: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    logging::initialize(
        logging::LogDestination::from_args(args.log_file.clone(), args.quiet),
        level,
    );

    let loaded = config::load(&args.config)?;
    let config = config::finalize(loaded, args.api, args.ws)?;
    if args.write_config {
        config::save(&args.config, &config)?;
        println!("wrote {}", args.config.display());
        return Ok(());
    }

    let handle = ClientHandle::new(config)?;
    let options = run::RunOptions {
        ids: args.ids,
        user: args.user,
        broadcast: args.broadcast,
        list: args.list,
        timeout: args.timeout_secs.map(Duration::from_secs),
    };
    let outcome = run::run(&handle, options);
    handle.shutdown();
    outcome
}
