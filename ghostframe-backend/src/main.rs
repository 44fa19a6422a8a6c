use std::io::Write;

use clap::Parser;
use ghostframe_backend::{AppState, BackendOptions, serve};
use ghostframe_core::{PortAnnouncement, encode_port_announcement};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ghostframe-backend")]
struct BackendArgs {
    /// Print `{"host", "port"}` as one JSON line on stdout once bound.
    #[arg(long, default_value_t = false)]
    print_port: bool,
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// 0 picks a free port.
    #[arg(long, default_value_t = 0)]
    port: u16,
    /// Seed a peer into the directory; repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[arg(long, default_value_t = false)]
    echo: bool,
}

#[tokio::main]
async fn main() {
    // stdout carries the handshake line only.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = BackendArgs::parse();
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", bind_address, err);
            std::process::exit(1);
        }
    };

    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(err) => {
            error!("failed to read bound address: {}", err);
            std::process::exit(1);
        }
    };

    if args.print_port {
        let announcement = PortAnnouncement {
            port,
            host: Some(args.host.clone()),
        };
        match encode_port_announcement(&announcement) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if writeln!(stdout, "{line}").and_then(|()| stdout.flush()).is_err() {
                    error!("failed to write port announcement");
                    std::process::exit(1);
                }
            }
            Err(err) => {
                error!("failed to encode port announcement: {}", err);
                std::process::exit(1);
            }
        }
    }

    info!(port, peers = args.peers.len(), echo = args.echo, "backend starting");
    let state = AppState::with_options(BackendOptions {
        peers: args.peers,
        echo: args.echo,
    });
    if let Err(err) = serve(listener, state).await {
        warn!("backend server exited: {}", err);
    }
}
