//! Binary entry point for the followermaze server.

use std::io::Write;
use std::net::TcpStream;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use maze_daemon::config::{ServerConfig, ADMIN_PORT};
use maze_daemon::handlers::STOP_COMMAND;
use maze_daemon::server::Server;

#[derive(Debug, Parser)]
#[command(
    name = "followermaze",
    about = "Single-threaded event fan-out server",
    version
)]
struct Cli {
    /// Port for the event-source stream.
    #[arg(value_name = "event_source_port", requires = "user_port")]
    event_port: Option<u16>,

    /// Port for user-client connections.
    #[arg(value_name = "user_client_port", requires = "event_port")]
    user_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask a running server on this host to shut down.
    Stop,
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(Command::Stop) = cli.command {
        let mut stream = TcpStream::connect(("127.0.0.1", ADMIN_PORT))
            .with_context(|| format!("connecting to admin port {ADMIN_PORT}"))?;
        stream
            .write_all(format!("{STOP_COMMAND}\n").as_bytes())
            .context("sending stop command")?;
        return Ok(());
    }

    let config = match (cli.event_port, cli.user_port) {
        (Some(event_port), Some(user_port)) => ServerConfig::with_ports(event_port, user_port)?,
        _ => ServerConfig::default(),
    };

    let mut server = Server::bind(&config).context("binding listening sockets")?;
    server.serve().context("serving")?;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("server failed: {error:#}");
            ExitCode::FAILURE
        }
    }
}
