//! Command-line entry point: load a plan, bind its arguments, and run it.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use ttpforge_types::LocalFilesystem;

#[derive(Parser)]
#[command(name = "ttpforge", version, about = "Runs declarative TTP procedures")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Load, validate, and execute a TTP plan
    Run {
        /// Path to the TTP plan document
        path: PathBuf,

        /// Bind a declared argument (repeatable)
        #[arg(long = "arg", value_name = "NAME=VALUE")]
        arg: Vec<String>,

        /// Skip the cleanup unwind entirely, even on full success
        #[arg(long)]
        no_cleanup: bool,

        /// Enable debug-level logging
        #[arg(short, long)]
        verbose: bool,

        /// Extra directory searched when a file/sub-plan reference isn't
        /// found relative to the plan's own directory (repeatable)
        #[arg(long, value_name = "DIR")]
        inventory: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    match Cli::parse().command {
        Command::Run { path, arg, no_cleanup, verbose, inventory } => {
            let filter = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt().with_env_filter(filter).init();

            if let Err(e) = run(path, arg, no_cleanup, inventory).await {
                tracing::error!(error = %e, "run failed");
                std::process::exit(1);
            }
        }
    }
}

async fn run(path: PathBuf, raw_args: Vec<String>, no_cleanup: bool, inventory: Vec<PathBuf>) -> anyhow::Result<()> {
    let fs = LocalFilesystem;
    let plan = ttpforge_loader::load(&path, &fs)?;

    ttpforge_loader::validate_specs(&plan.args)?;
    let bound_args = ttpforge_loader::bind(&plan.args, &raw_args)?;

    let config = ttpforge_engine::RunConfig { no_cleanup, inventory, ..ttpforge_engine::RunConfig::default() };

    let cancel = CancellationToken::new();
    let events = ttpforge_engine::EventEmitter::default();

    let report = ttpforge_engine::run(&plan, &bound_args, &config, &fs, &cancel, &events).await?;

    println!("completed {} step(s)", report.step_outputs.len());
    for (name, output) in &report.step_outputs {
        println!("  {name}: success={}", output.success);
    }

    Ok(())
}
