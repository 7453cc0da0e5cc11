//! kmsorter CLI Binary
//!
//! Runs one agent (`load`, `process` or `sort`) until it finishes or is
//! interrupted.

use anyhow::Context;
use clap::Parser;
use kmsorter::tooling::cli::{shutdown_on_ctrl_c, Cli, CliContext, Commands};
use std::process;

fn main() {
    let cli = Cli::parse();

    let context = match CliContext::new(&cli) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error initializing: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = context.init_logging() {
        eprintln!("Error initializing logging: {}", e);
        process::exit(1);
    }

    match run(&context, &cli.command) {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn run(context: &CliContext, command: &Commands) -> anyhow::Result<String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(async {
        let shutdown = shutdown_on_ctrl_c();
        context
            .execute(command, shutdown)
            .await
            .with_context(|| format!("{} failed", command.name()))
    })
}
