//! onionup - expose a directory or an HTTP origin as a Tor onion service
//!
//! Talks to a running Tor daemon over its control port, creates a v3
//! onion service (optionally derived from a passphrase), and serves the
//! target behind it. The resulting address is printed once the network
//! has accepted the service descriptor.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::oneshot;

use onionup::{provision, Error, Parameters, DEFAULT_CONTROL_ADDR};

/// Expose a local directory or an HTTP origin as a Tor onion service
#[derive(Parser, Debug)]
#[command(name = "onionup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Local path or http(s) URL to expose
    target: String,

    /// Serve directories as zip archives instead of listings
    #[arg(long)]
    zip: bool,

    /// Disable the random capability slug for file serving
    #[arg(long)]
    no_slug: bool,

    /// Prompt for a passphrase and derive a stable onion identity from it
    #[arg(short = 'p', long)]
    passphrase: bool,

    /// Tor control port address
    #[arg(long, default_value = DEFAULT_CONTROL_ADDR)]
    control_addr: String,

    /// Tor control port password
    #[arg(long)]
    control_password: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    onionup::logging::init(cli.verbose);

    let passphrase = if cli.passphrase {
        let phrase = rpassword::prompt_password("Enter passphrase for onion identity: ")
            .context("unable to read passphrase")?;
        Some(phrase)
    } else {
        None
    };

    let params = Parameters {
        target: cli.target,
        zip: cli.zip,
        slug: !cli.no_slug,
        control_addr: Some(cli.control_addr),
        control_password: cli.control_password,
        passphrase,
    };

    // The address arrives on this channel only after Tor has confirmed
    // descriptor publication.
    let (link_tx, link_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok(url) = link_rx.await {
            println!("{url}");
        }
    });

    match provision(params, link_tx).await {
        Ok(()) => Ok(()),
        // The service was already live; make that visible in the report.
        Err(err @ Error::ChannelLost(_)) => {
            Err(anyhow::Error::new(err).context("service went down after publication"))
        }
        Err(err) => Err(err.into()),
    }
}
