//! `fnproxyctl` - operational CLI for a single `fnproxy-service` node.
//!
//! Talks to the node's read-only ops surface (`/v1/agents`, `/v1/resources`)
//! and its graceful-shutdown trigger (`/v1/shutdown`), in the style of
//! `aura-swarm-cli`'s `GatewayClient`, scaled down from a full TUI to a
//! one-shot command since this core has no chat/session surface to drive.

mod client;

use clap::{Parser, Subcommand};
use client::NodeClient;

/// Operational CLI for a `fnproxy-service` node.
#[derive(Parser, Debug)]
#[command(name = "fnproxyctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the node's HTTP surface.
    #[arg(long, env = "FNPROXY_NODE", default_value = "http://127.0.0.1:8080")]
    node: String,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every agent registration this node currently holds.
    Agents,
    /// Show the node's current resource view.
    Resources,
    /// Drain admission and evict every agent, then exit.
    Shutdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_env_filter("fnproxy_cli=debug,warn").with_writer(std::io::stderr).init();
    }

    let client = NodeClient::new(&args.node);

    match args.command {
        Command::Agents => {
            let agents = client.agents().await?;
            println!("{}", serde_json::to_string_pretty(&agents)?);
        }
        Command::Resources => {
            let units = client.resources().await?;
            println!("{}", serde_json::to_string_pretty(&units)?);
        }
        Command::Shutdown => {
            client.shutdown().await?;
            println!("shutdown complete");
        }
    }

    Ok(())
}
