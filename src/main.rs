//! Registry replicator binary

use clap::Parser;
use registry_replicator::cli::{Args, Command, Runner};
use registry_replicator::logging;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let Command::Serve(serve) = args.command;

    if let Err(e) = logging::init(serve.verbose, serve.json_logs) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = Runner::new(serve).run().await {
        tracing::error!(error = %e, "replicator exited");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
