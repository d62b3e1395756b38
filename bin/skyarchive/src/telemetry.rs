//! Tracing subscriber setup. Logs go to stderr so stdout stays clean for
//! command output.

use std::io;

use anyhow::Context;
use sa_config::LogFormat;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Checked before `RUST_LOG`.
pub const LOG_ENV: &str = "SKYARCHIVE_LOG";

const DEFAULT_DIRECTIVES: &str = "info";

/// First non-empty value of `SKYARCHIVE_LOG`, then `RUST_LOG`, else `info`.
fn filter_directives(lookup: impl Fn(&str) -> Option<String>) -> String {
    [LOG_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(lookup)
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string())
}

pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let directives = filter_directives(|var| std::env::var(var).ok());
    let filter = EnvFilter::try_new(&directives).with_context(|| format!("invalid log filter '{directives}'"))?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false).with_writer(io::stderr))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false).with_writer(io::stderr)).try_init(),
    }
    .context("failed to install tracing subscriber")
}
