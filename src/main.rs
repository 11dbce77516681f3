// ABOUTME: Command-line entry point: `luabot [-c FILE] run` and `luabot [-c FILE] init <kind>`
// ABOUTME: Loads .env, sets up tracing and the rustls provider, maps failures to exit status 1

use clap::{Parser, Subcommand};
use luabot::BackendKind;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "luabot", version, about = "Scriptable chat bot host driven by Lua")]
struct Cli {
    /// Script to run or generate
    #[arg(short = 'c', long = "config", env = "LUABOT_CONFIG", default_value = "luabot.lua")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot defined by the script
    Run,
    /// Generate a default script for a backend (irc, slack, hipchat, rocket, null)
    Init {
        kind: String,
        /// Overwrite an existing script
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };

    dotenvy::dotenv().ok();
    luabot::logging::init_tracing();
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let outcome = match cli.command {
        Command::Run => luabot::run(&cli.config).await,
        Command::Init { kind, force } => match kind.parse::<BackendKind>() {
            Ok(kind) => luabot::init(&cli.config, kind, force).map(|()| {
                println!("{} has been generated", cli.config.display());
            }),
            Err(e) => Err(e.into()),
        },
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "luabot failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
