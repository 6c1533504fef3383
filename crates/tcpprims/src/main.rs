mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;
use tcpprims_frame::DEFAULT_MAX_PAYLOAD;
use tcpprims_peer::PeerConfig;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "tcpprims", version, about = "Length-prefixed TCP messaging CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Largest payload accepted or sent, in bytes.
    #[arg(
        long,
        value_name = "BYTES",
        env = "TCPPRIMS_MAX_PAYLOAD",
        default_value_t = DEFAULT_MAX_PAYLOAD,
        global = true
    )]
    max_payload: usize,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let config = PeerConfig {
        max_payload_size: cli.max_payload,
        ..PeerConfig::default()
    };
    let result = cmd::run(cli.command, format, config);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
