//! Command-line argument parsing

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "replicator")]
#[command(about = "Replicates repositories between container registries")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the replication job API
    Serve(ServeArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ServeArgs {
    /// JSON file holding the core configuration
    #[arg(long = "config", short = 'c', help = "Path to the JSON configuration file")]
    pub config: PathBuf,

    #[arg(
        long = "listen",
        short = 'l',
        default_value = "0.0.0.0:8080",
        help = "Address the job API listens on"
    )]
    pub listen: SocketAddr,

    /// Targets and policies registered at startup
    #[arg(long = "policies", short = 'p', help = "Path to a JSON file of targets and policies")]
    pub policies: Option<PathBuf>,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(long = "json-logs", help = "Emit logs as JSON lines")]
    pub json_logs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve() {
        let args = Args::try_parse_from([
            "replicator",
            "serve",
            "--config",
            "/etc/replicator.json",
            "--listen",
            "127.0.0.1:9000",
            "--json-logs",
        ])
        .unwrap();
        let Command::Serve(serve) = args.command;
        assert_eq!(serve.config, PathBuf::from("/etc/replicator.json"));
        assert_eq!(serve.listen, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert!(serve.json_logs);
        assert!(!serve.verbose);
        assert!(serve.policies.is_none());
    }

    #[test]
    fn config_is_required() {
        assert!(Args::try_parse_from(["replicator", "serve"]).is_err());
    }
}
