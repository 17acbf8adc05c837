//! fcnest host CLI
//!
//! ```text
//! fcnest [start|shell]   boot the VM attached to this terminal (default)
//! fcnest detach          boot the VM in the background, console to a log file
//! fcnest config          print the resolved configuration
//! ```

use clap::{Parser, Subcommand};
use tracing::error;

use fcnest::config::ConsoleMode;
use fcnest::logging::init_tracing;
use fcnest::{Ext4Tool, Orchestrator, Settings, SystemRunner};

#[derive(Debug, Parser)]
#[command(
    name = "fcnest",
    version,
    about = "Run a nested container engine inside a Firecracker microVM"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "FCNEST_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Boot the VM with the configured console mode (interactive by default)
    #[command(alias = "shell")]
    Start,
    /// Boot the VM in the background
    Detach,
    /// Print the resolved configuration and exit
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing("fcnest", cli.settings.log_level, cli.log_json);

    let config = match cli.settings.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(e.exit_code());
        }
    };

    let config = match cli.command.unwrap_or(Command::Start) {
        Command::Config => {
            println!("{}", config);
            return;
        }
        Command::Detach => config.with_console_mode(ConsoleMode::Detached),
        Command::Start => config,
    };

    let runner = SystemRunner;
    let fs_tool = Ext4Tool::new(&runner);

    match Orchestrator::new(config, &runner, &fs_tool).run().await {
        Ok(outcome) => {
            let code = outcome.exit_code();
            if code != 0 {
                println!("VM exited with status {}", code);
            }
            std::process::exit(code);
        }
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("❌ {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
