//! ZTNA headend - authenticated multi-protocol proxy with traffic mirroring

use std::process::ExitCode;

use clap::Parser;
use headend_wire::{PortProtocol, PortRangeSet};
use tracing::{error, info};

use ztna_headend::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckPorts { ref tcp, ref udp }) => check_ports(tcp, udp),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Validate range expressions and print the expanded counts
fn check_ports(tcp: &str, udp: &str) -> ExitCode {
    match PortRangeSet::parse_validated(tcp, udp) {
        Ok(ranges) => {
            let ports = ranges.expand();
            let count = |protocol: PortProtocol| ports.iter().filter(|(p, _)| *p == protocol).count();
            println!("tcp: {} port(s)", count(PortProtocol::Tcp));
            println!("udp: {} port(s)", count(PortProtocol::Udp));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Invalid port ranges: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.http_port {
                config.server.http_port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        http_port = config.server.http_port,
        tcp_port = config.server.tcp_port,
        udp_port = config.server.udp_port,
        gateway_id = %config.server.gateway_id,
        "Starting ZTNA headend"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Headend shutdown complete");
    ExitCode::SUCCESS
}
