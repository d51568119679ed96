use clap::Parser;
use mosaic_stack::app::{configure_process, handle_fatal_error, init_logging, run, AppConfig};
use mosaic_stack::cli::Cli;
use tracing::warn;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    init_logging(&AppConfig::new(verbose));
    if let Err(e) = configure_process() {
        warn!("Process setup incomplete: {}", e);
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => handle_fatal_error(e, verbose),
    }
}
