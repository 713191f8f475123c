//! stark CLI entry point.
//!
//! Exit codes: 0 success, 1 user error, 2 auth, 3 transient, 4 conflict.

mod app;
mod client;

use clap::Parser;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = app::Cli::parse();
    if let Err(e) = app::run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}
