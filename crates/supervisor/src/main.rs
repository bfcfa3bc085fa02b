mod cmd;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jobvisor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fork a worker pool and feed it jobs from the queue until stopped
    Listen(Box<cmd::ListenArgs>),
    /// Push one job onto the queue
    Push(cmd::PushArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Listen(args) => cmd::run_listen(*args),
        Command::Push(args) => cmd::run_push(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
