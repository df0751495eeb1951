use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use clap::{Parser, Subcommand};
use lanbus::prelude::*;
use lanbus::DEFAULT_PORT;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Chat over the lanbus message bus: one host, any number of clients.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Listen for clients and greet each one that joins.
    Host {
        /// Port to listen on (0 picks a free one)
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Connect to a host and send every stdin line as a print request.
    Client {
        /// Host address, e.g. 192.168.1.10:40000
        #[arg(short = 'H', long)]
        host: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Args::parse().role {
        Role::Host { port } => run_host(port).await?,
        Role::Client { host } => run_client(host).await?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

async fn run_host(port: u16) -> Result<(), BusError> {
    let bus = Arc::new(HostMessageBus::new(PeerId::random(), BusConfig::with_port(port)));

    bus.register_data_handler(MessageType::PrintRequest, |message, origin| {
        if let Payload::Print(print) = &message.payload {
            println!("[{origin}] {}", print.text);
        }
        Ok(())
    });

    // The peer is identified by the time this runs, so it can be addressed.
    let weak: Weak<HostMessageBus> = Arc::downgrade(&bus);
    bus.register_data_handler(MessageType::IdentifyRequest, move |_, origin| {
        let (Some(bus), Origin::Peer(addr)) = (weak.upgrade(), origin) else {
            return Ok(());
        };
        tokio::spawn(async move {
            let greeting = PrintRequest::new(format!("welcome, {addr}"));
            if let Err(e) = bus.send(greeting.into(), Some(addr), false).await {
                tracing::warn!(%addr, error = %e, "greeting not sent");
            }
        });
        Ok(())
    });

    bus.start(()).await?;
    if let Some(addr) = bus.local_addr() {
        println!("hosting on {addr}; Ctrl-C to stop");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
    }
    bus.stop().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

async fn run_client(host: SocketAddr) -> Result<(), BusError> {
    let bus = ClientMessageBus::new(PeerId::random(), BusConfig::default());

    bus.register_data_handler(MessageType::PrintRequest, |message, _| {
        if let Payload::Print(print) = &message.payload {
            println!("host: {}", print.text);
        }
        Ok(())
    });

    bus.start(host).await?;
    println!("connected to {host}; type a line to send it, Ctrl-D to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let text = match line {
            Ok(Some(text)) => text,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if text.trim().is_empty() {
            continue;
        }

        let report = bus.send(PrintRequest::new(text).into(), None, true).await?;
        if report.target_count() == 0 || !report.disconnected.is_empty() {
            println!("host went away");
            break;
        }
        for (_, error) in &report.failed {
            println!("host rejected the line: {error}");
        }
    }

    bus.stop().await;
    Ok(())
}
