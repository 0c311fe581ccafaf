use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::forward::{ForwardingLayer, RecordSink};

/// Console output style for the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Text,
    Compact,
    Json,
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize console tracing on stderr
///
/// stdout stays free because worker processes use it for the control channel.
pub fn init_simple_tracing(log_level: &str, output: LogOutput) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(log_level))
        .with_writer(std::io::stderr);

    // Use try_init to avoid panic if global subscriber already set
    let result = match output {
        LogOutput::Text => builder.try_init(),
        LogOutput::Compact => builder.compact().try_init(),
        LogOutput::Json => builder.json().try_init(),
    };
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize tracing for a worker process
///
/// Records are not written locally; they are handed to `sink` and end up in
/// the controller's log output.
pub fn init_forwarding_tracing<K: RecordSink>(log_level: &str, sink: K) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(ForwardingLayer::new(sink))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install forwarding subscriber: {}", e))
}
