use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = cruxctl::Cli::parse();
    if let Err(error) = cruxctl::run(cli) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
