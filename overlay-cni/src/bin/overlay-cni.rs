use overlay_cni::commands::run_cni;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() {
    // stdout carries the CNI protocol, so logs go to stderr as JSON lines
    let subscriber = FmtSubscriber::builder()
        .json()
        .flatten_event(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    std::process::exit(run_cni());
}
