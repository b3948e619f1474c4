use clap::Parser;
use pcf_gatekeeper::{Cli, run_server};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_server(cli).await {
        // Logging may not be up yet if configuration failed
        eprintln!("pcf-gatekeeper failed: {:#}", e);
        std::process::exit(1);
    }
}
