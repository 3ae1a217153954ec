use clap::Parser;
use extguard_core::{Arbiter, GuardConfig};
use extguard_server::{open_store, run_server, ServerError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "extguard-server",
    about = "Admission front enforcing one ClusterExtension per package"
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8321")]
    listen: String,

    /// Directory for the durable object snapshot. In-memory when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// TOML file with guard settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of HTTP worker threads.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn install_signal_handler(shutdown: &Arc<AtomicBool>) {
    let flag = Arc::clone(shutdown);
    let installed = ctrlc::set_handler(move || {
        if flag.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        flag.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, draining in-flight requests...");
    });
    if let Err(e) = installed {
        warn!("failed to install signal handler: {e}");
    }
}

fn run(cli: &Cli) -> Result<(), ServerError> {
    let config = match cli.config {
        Some(ref path) => GuardConfig::load(path)?,
        None => GuardConfig::default(),
    };
    info!("arbitration mode: {:?}", config.arbitration);

    let store = open_store(cli.data_dir.as_deref(), &config)?;
    match cli.data_dir {
        Some(ref dir) => info!("data directory: {}", dir.display()),
        None => warn!("no --data-dir given; objects are kept in memory only"),
    }

    let guard = Arc::new(Arbiter::start(store, config)?);
    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handler(&shutdown);

    info!("starting extguard-server on {}", cli.listen);
    run_server(&guard, &cli.listen, cli.workers, &shutdown)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
