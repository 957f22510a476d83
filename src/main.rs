//! testrig - run the built-in demo catalog
//!
//! ## Usage
//!
//! ```bash
//! # Run everything sequentially
//! testrig
//!
//! # Run one suite, cases on four threads
//! testrig -t arith --threading --async-tests 4
//!
//! # Suites in worker processes with an XUnit report
//! testrig --multiprocessing --async-suites 2 --xunit-report out/xunit.xml
//!
//! # Show what would run
//! testrig --list -t inventory:Stock
//!
//! # Keep the resolved flags as a config file
//! testrig --threading --async-tests 4 --save-config testrig.yaml
//! ```

use clap::Parser;
use tracing::{debug, error};

use testrig::cli::Args;
use testrig::config::env::print_env_help;
use testrig::config::EnvConfig;
use testrig::demo;
use testrig::executor::worker::WorkerMode;
use testrig::program::EXIT_ABORTED;
use testrig::utils::logger::{init_logger, LogLevel};

fn main() {
    let args = Args::parse();
    init_logger(LogLevel::resolve(args.log_level.as_deref(), args.verbose));

    if args.env_help {
        print_env_help();
        return;
    }

    let code = run(&args);
    match code {
        Ok(Some(code)) => std::process::exit(code),
        Ok(None) => {}
        Err(err) => {
            error!("{:#}", err);
            std::process::exit(EXIT_ABORTED);
        }
    }
}

/// Exit code to leave with, or `None` when the process should just return
fn run(args: &Args) -> anyhow::Result<Option<i32>> {
    let config = args.resolve(&EnvConfig::load())?;
    debug!("Resolved configuration: {:?}", config);
    if let Some(path) = &args.save_config {
        args.save_config(path, &config)?;
        println!("Configuration written to {}", path.display());
        return Ok(None);
    }
    // Workers always report through their exit status.
    let exit = config.exit_on_completion || WorkerMode::from_env().is_some();
    let mut program = demo::program(config)?;

    if args.list {
        print!("{}", program.list()?);
        return Ok(None);
    }

    let code = program.main();
    Ok(exit.then_some(code))
}
