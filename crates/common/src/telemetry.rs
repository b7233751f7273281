use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the process-wide tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Install the global tracing subscriber.
///
/// Logs go to stderr so stdout stays free for decision output. `RUST_LOG`
/// overrides the default `info` filter. Returns an error if a subscriber is
/// already installed (tests calling this twice, for example).
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e)),
        LogFormat::Text => builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e)),
    }
}
