//! prise CLI - the scriptable terminal multiplexer server.
//!
//! `prise serve` binds the socket and runs until `quit()` or a
//! termination signal. See the `prise` library for the core.

use anyhow::Result;
use clap::{Parser, Subcommand};
use prise::{Config, Server};

#[derive(Parser)]
#[command(name = "prise")]
#[command(version)]
#[command(about = "Scriptable terminal multiplexer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the multiplexer server.
    Serve {
        /// Listen on this socket instead of the default.
        #[arg(long)]
        socket: Option<std::path::PathBuf>,
        /// Load this script instead of <config dir>/init.lua.
        #[arg(long)]
        script: Option<std::path::PathBuf>,
    },
}

fn init_logging(config: &Config) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Some(path) = &config.log_file {
        match std::fs::File::create(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("prise: cannot open log file {}: {e}", path.display()),
        }
    }
    builder.init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { socket, script } => {
            let mut config = Config::load()?;
            if let Some(socket) = socket {
                config.socket_path = socket;
            }
            if let Some(script) = script {
                config.script_path = Some(script);
            }
            init_logging(&config);

            // A panicking server must still leave a trace in the log.
            let default_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                log::error!("PANIC: {info}");
                default_hook(info);
            }));

            let mut server = Server::new(&config)?;
            server.run()
        }
    }
}
