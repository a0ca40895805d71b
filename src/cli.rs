//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Zero-trust headend - authenticated HTTP/TCP/UDP proxy with traffic mirroring
#[derive(Parser, Debug)]
#[command(name = "ztna-headend")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "HEADEND_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// HTTP proxy port (overrides `server.http_port`)
    #[arg(long, env = "HEADEND_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Host to bind to (overrides `server.host`)
    #[arg(long, env = "HEADEND_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HEADEND_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "HEADEND_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the headend (default)
    Serve,

    /// Validate port-range expressions offline
    CheckPorts {
        /// TCP ranges, e.g. "8000-8010,9000"
        #[arg(long, default_value = "")]
        tcp: String,

        /// UDP ranges
        #[arg(long, default_value = "")]
        udp: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_check_ports() {
        let cli = Cli::parse_from(["ztna-headend", "check-ports", "--tcp", "9000-9002", "--udp", "53"]);
        match cli.command {
            Some(Command::CheckPorts { tcp, udp }) => {
                assert_eq!(tcp, "9000-9002");
                assert_eq!(udp, "53");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::parse_from(["ztna-headend", "--http-port", "9443"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.http_port, Some(9443));
        assert_eq!(cli.log_level, "info");
    }
}
