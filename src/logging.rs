//! Tracing setup for the CLI.
//!
//! Events go to stderr so stdout carries nothing but the outcome. `RUST_LOG`
//! wins over `--log-level`, which wins over the `info` default.

use std::io;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LEVEL: &str = "info";

fn build_filter(env_directives: Option<String>, cli_level: Option<&str>) -> EnvFilter {
    env_directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .or_else(|| cli_level.and_then(|l| EnvFilter::try_new(l).ok()))
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LEVEL))
}

pub fn init_logging(cli_level: Option<&str>) {
    let env_directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|d| !d.trim().is_empty());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(build_filter(env_directives, cli_level))
        .with(stderr_layer)
        .try_init();
}
