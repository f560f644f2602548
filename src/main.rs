mod commands;
mod config;
mod confirm;
mod credentials;
mod db;
mod error;
mod hosts;
mod llm;
mod orchestrator;
mod payload;
mod safety;
mod ssh;
mod types;

use clap::{Parser, Subcommand};
use config::{get_config_path, load_config};
use error::Result;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "opsh", version, about = "Plain-language ops requests, run over ssh")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging on stderr (OPSH_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Generate a command for the request and run it on a host
    Run {
        /// Host alias; otherwise taken from the request or default_host
        #[arg(long)]
        host: Option<String>,

        /// Decline risky commands without asking
        #[arg(long)]
        no_input: bool,

        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        request: Vec<String>,
    },
    /// Show recent attempts from the audit log
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Include full transcripts
        #[arg(long)]
        full: bool,
    },
    /// List configured hosts
    Hosts,
    /// Check the generator, ssh tooling and audit log
    Doctor,
    /// Open the config file in $EDITOR
    Config,
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "opsh=debug" } else { "opsh=warn" };
    let filter = EnvFilter::try_from_env("OPSH_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(command: Cmd, config_path: &Path) -> Result<i32> {
    let load = || load_config(config_path);

    match command {
        Cmd::Run {
            host,
            no_input,
            request,
        } => commands::cmd_run(&load()?, &request.join(" "), host.as_deref(), no_input),
        Cmd::History { limit, full } => commands::cmd_history(&load()?, limit, full).map(|_| 0),
        Cmd::Hosts => commands::cmd_hosts(&load()?).map(|_| 0),
        Cmd::Doctor => commands::cmd_doctor(&load()?, config_path).map(|_| 0),
        // Never loads the config, so a broken file can still be fixed.
        Cmd::Config => commands::cmd_config(config_path).map(|_| 0),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.unwrap_or_else(get_config_path);

    let result = run(cli.command, &config_path);

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("opsh: {}", e);
            std::process::exit(1);
        }
    }
}
