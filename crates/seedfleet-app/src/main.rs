//! Binary entrypoint: configure, bootstrap and run until interrupted.

use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(err) = seedfleet_app::run_app().await {
        error!(error = %err, "seedfleet terminated with an error");
        eprintln!("seedfleet: {err:#}");
        std::process::exit(1);
    }
}
