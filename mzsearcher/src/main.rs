use std::io;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mzsearcher::{MZSearcher, MZSearcherError};

fn configure_log() {
    let subscriber = tracing_subscriber::registry().with(
        fmt::layer()
            .compact()
            .with_timer(fmt::time::ChronoLocal::rfc_3339())
            .with_writer(io::stderr)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(tracing::Level::INFO.into())
                    .from_env_lossy(),
            ),
    );
    subscriber.init();
}

fn main() -> Result<(), MZSearcherError> {
    configure_log();

    let args = MZSearcher::parse();
    args.main()?;
    Ok(())
}
