use std::path::PathBuf;
use std::process::ExitCode;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use minnow_ircd::{Config, Ircd};

#[derive(Debug, StructOpt)]
#[structopt(rename_all = "kebab")]
struct Opts {
    /// Config file location
    #[structopt(short, long)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let opts = Opts::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load(&opts.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration problem: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut ircd = match Ircd::new(config, Some(opts.config)) {
        Ok(ircd) => ircd,
        Err(e) => {
            eprintln!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Unable to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(ircd.run()) {
        Ok(()) => {
            println!("Server shutdown cleanly.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
