// A TFTP client compliant with RFC 1350.
//
// A transfer begins with a request to read or write a file. The request goes
// to the server's listener port (69 by default), but the server answers from
// a freshly chosen port of its own: each side's port is its transfer
// identifier (TID), and all traffic after the first reply flows between the
// two TIDs. Files move in 512-byte DATA blocks, each acknowledged before the
// next is sent; a block shorter than 512 bytes (possibly empty) marks the end
// of the file.
//
// Loss is handled by retransmission: whoever is waiting re-sends its last
// packet when a timeout expires. This client paces those timeouts off a
// smoothed estimate of the server's round-trip time, so a fast server is
// re-asked quickly and a slow one is given room. Errors travel as ERROR
// packets, which terminate the transfer and are themselves neither
// acknowledged nor retransmitted.
//
// Three transfer modes exist: octet (verbatim bytes), netascii (canonical
// text with CR LF line endings, translated on both ends), and mail (netascii
// addressed to a user rather than a file, upload only).

use std::path::PathBuf;
use std::process::ExitCode;

pub mod client_conn;
pub mod netascii;
pub mod processor;
pub mod resolve;
pub mod session;
pub mod tftp;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use session::{Status, TransferOptions};
use tftp::FileMode;

const DEFAULT_PORT: u16 = 69;

/// Trivial File Transfer Protocol (RFC 1350) client.
#[derive(Parser)]
#[command(name = "tftp", version, about)]
struct Cli {
    /// TFTP server, as host or host:port (default port 69).
    #[arg(short = 'H', long, value_name = "host[:port]")]
    host: String,

    /// Transfer mode.
    #[arg(long, default_value = "octet", value_name = "netascii|octet|mail")]
    mode: FileMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a remote file to a local path.
    Get { remote: String, local: PathBuf },

    /// Upload a local file to a remote path.
    Put { local: PathBuf, remote: String },
}

fn parse_host_port(input: &str) -> Result<(String, u16)> {
    let Some((host, port)) = input.split_once(':') else {
        return Ok((input.to_string(), DEFAULT_PORT));
    };

    if host.is_empty() || port.is_empty() {
        bail!("Invalid host:port format");
    }

    Ok((host.to_string(), port.parse()?))
}

async fn run(cli: Cli) -> Result<Status> {
    let (host, port) = parse_host_port(&cli.host)?;
    let server = resolve::resolve(&host, port).await?;
    let opts = TransferOptions::default();

    let status = match cli.command {
        Command::Get { remote, local } => {
            client_conn::get(server, &remote, &local, cli.mode, opts, None).await?
        }
        Command::Put { local, remote } => {
            client_conn::put(server, &local, &remote, cli.mode, opts, None).await?
        }
    };

    Ok(status)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(status) if status.is_success() => ExitCode::SUCCESS,
        Ok(status) => {
            eprintln!("{status}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
