//! Wiring CLI - run and talk to wiring nodes
//!
//! `serve` starts a node exporting an echo endpoint, `send` delivers one
//! message to a remote endpoint, `demo` shows both sides in one process.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use wiring_common::{Component, LogLevel, Logger, LoggingConfig};

use wiring_cli::send::SendTarget;
use wiring_cli::{DemoCommand, NodeArgs, SendCommand, ServeCommand};

#[derive(Parser)]
#[command(name = "wiring")]
#[command(about = "Wiring CLI - run nodes and exchange messages between them")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node exporting the echo service
    #[command(name = "serve")]
    Serve {
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Send one message to a remote endpoint and print the reply
    #[command(name = "send")]
    Send {
        #[command(flatten)]
        node: NodeArgs,

        /// Zone of the target node
        #[arg(long)]
        to_zone: String,

        /// Name of the target node
        #[arg(long)]
        to_node: String,

        /// Service id of the target endpoint
        #[arg(long, default_value = "echoService")]
        service: String,

        /// Message text
        #[arg(short, long)]
        message: String,

        /// Seconds to wait for the endpoint to be discovered
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Run two nodes in this process and echo one message between them
    #[command(name = "demo")]
    Demo {
        #[arg(short, long, default_value = "hello")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    LoggingConfig::new().with_default_level(level).apply();

    let logger = Arc::new(Logger::new_root(Component::CLI, "main"));

    match cli.command {
        Commands::Serve { node } => {
            ServeCommand::new(logger).run(&node).await?;
        }
        Commands::Send {
            node,
            to_zone,
            to_node,
            service,
            message,
            wait,
        } => {
            let target = SendTarget {
                zone: to_zone,
                node: to_node,
                service,
                message,
                wait: Duration::from_secs(wait),
            };
            let reply = SendCommand::new(logger).run(&node, &target).await?;
            println!("{}", reply.unwrap_or_else(|| "(no reply)".to_string()));
        }
        Commands::Demo { message } => {
            let reply = DemoCommand::new(logger)
                .run(&message, Duration::from_secs(10))
                .await?;
            println!("{}", reply.unwrap_or_else(|| "(no reply)".to_string()));
        }
    }

    Ok(())
}
