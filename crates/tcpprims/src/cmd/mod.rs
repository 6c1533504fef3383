use std::path::PathBuf;
use std::sync::mpsc;

use clap::{Args, Subcommand};
use tcpprims_peer::{PeerConfig, Strategy};

use crate::exit::{CliError, CliResult, INTERNAL};
use crate::output::OutputFormat;

pub mod echo;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an echo server.
    Echo(EchoArgs),
    /// Send a single frame.
    Send(SendArgs),
    /// Listen and print received frames.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: PeerConfig) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, config),
        Command::Send(args) => send::run(args, format, config),
        Command::Listen(args) => listen::run(args, format, config),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Address to bind (host:port).
    pub addr: String,
    /// I/O strategy: blocking or selector.
    #[arg(long, default_value = "blocking")]
    pub strategy: Strategy,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Address to connect to (host:port).
    pub addr: String,
    /// I/O strategy: blocking or selector.
    #[arg(long, default_value = "blocking")]
    pub strategy: Strategy,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Wait for one response frame and print it.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to bind (host:port).
    pub addr: String,
    /// I/O strategy: blocking or selector.
    #[arg(long, default_value = "blocking")]
    pub strategy: Strategy,
    /// Exit after receiving N frames.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Forward Ctrl+C into `events` as `interrupt`.
pub fn install_ctrlc_handler<T: Send + 'static>(
    events: mpsc::Sender<T>,
    interrupt: impl Fn() -> T + Send + 'static,
) -> CliResult<()> {
    ctrlc::set_handler(move || {
        let _ = events.send(interrupt());
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
