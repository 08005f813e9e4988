use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Level of a log line buffered by orchestration code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Install the default `tracing` subscriber, honoring `RUST_LOG`. Safe to
/// call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

/// Emit the lines an orchestration buffered during one turn.
pub fn flush_orchestration_logs(instance: &str, orchestration: &str, turn_index: u64, logs: Vec<(LogLevel, String)>) {
    for (level, message) in logs {
        match level {
            LogLevel::Debug => debug!(instance, orchestration, turn_index, "{message}"),
            LogLevel::Info => info!(instance, orchestration, turn_index, "{message}"),
            LogLevel::Warn => warn!(instance, orchestration, turn_index, "{message}"),
            LogLevel::Error => error!(instance, orchestration, turn_index, "{message}"),
        }
    }
}
