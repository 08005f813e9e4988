//! Runtime and pipeline configuration.
//!
//! Both structs are built once at startup and handed to the engine;
//! orchestration code only sees values captured at registration time.

use std::time::Duration;

use thiserror::Error;

use crate::retry::{RetryOn, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Tuning knobs for the runtime's dispatchers and instance drivers.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Max completions folded into history per orchestration turn.
    pub completion_batch_limit: usize,
    /// Pause after abandoning a message for an instance that is being rehydrated.
    pub poller_gate_delay_ms: u64,
    /// Sleep between polls of an empty queue.
    pub poller_idle_sleep_ms: u64,
    /// Idle time after which an instance without result waiters is dehydrated.
    pub idle_dehydrate_ms: u64,
    /// Activities executing concurrently on the worker dispatcher.
    pub worker_concurrency: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            completion_batch_limit: 128,
            poller_gate_delay_ms: 5,
            poller_idle_sleep_ms: 10,
            idle_dehydrate_ms: 1000,
            worker_concurrency: 16,
        }
    }
}

/// Settings for the transcription and summarization pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Model name sent with completion requests.
    pub completion_model: String,
    /// Characters per transcript chunk.
    pub chunk_size: usize,
    pub locale: String,
    /// Container receiving transcription results.
    pub destination_container: String,
    /// Lifetime of the write credential handed to the transcription service.
    pub destination_ttl: Duration,
    /// How long to wait for a completion signal between status checks.
    pub status_poll_interval: Duration,
    pub max_status_polls: u32,
    /// Applied to each status check; retries while the job is still running.
    pub status_retry: RetryPolicy,
    /// Applied while the transcript file is not listed yet.
    pub list_files_retry: RetryPolicy,
    /// Applied to summarization calls (throttling and transient errors).
    pub completion_retry: RetryPolicy,
    /// Bound on concurrent chunk summaries; `None` means all at once.
    pub summarize_max_in_flight: Option<usize>,
    pub chunk_prompt: String,
    pub combine_prompt: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            completion_model: "gpt-35-turbo".to_string(),
            chunk_size: 4000,
            locale: "en-US".to_string(),
            destination_container: "transcripts".to_string(),
            destination_ttl: Duration::from_secs(2 * 60 * 60),
            status_poll_interval: Duration::from_secs(5 * 60),
            max_status_polls: 12,
            status_retry: RetryPolicy::new(5, Duration::from_secs(2 * 60)).retry_on(RetryOn::InProgress),
            list_files_retry: RetryPolicy::new(10, Duration::from_secs(3)).retry_on(RetryOn::InProgress),
            completion_retry: RetryPolicy::new(5, Duration::from_secs(1))
                .with_backoff(2.0)
                .with_max_retry_delay(Duration::from_secs(60))
                .with_retry_timeout(Duration::from_secs(10 * 60)),
            summarize_max_in_flight: None,
            chunk_prompt: "Summarize this part of a meeting transcript in a few sentences. \
                           Keep names, commitments and decisions."
                .to_string(),
            combine_prompt: "You receive partial summaries of one meeting in order. Reply with a JSON object \
                             with the keys overview (string), attendees, keyPoints and decisions (arrays of strings)."
                .to_string(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

impl PipelineConfig {
    /// Load overrides from `SUMMZ_*` environment variables (and a `.env`
    /// file if present) on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Ok(model) = std::env::var("SUMMZ_COMPLETION_MODEL") {
            cfg.completion_model = model;
        }
        if let Some(size) = parse_var::<usize>("SUMMZ_CHUNK_SIZE")? {
            if size == 0 {
                return Err(ConfigError::Invalid {
                    key: "SUMMZ_CHUNK_SIZE",
                    value: "0".into(),
                    reason: "chunk size must be positive".into(),
                });
            }
            cfg.chunk_size = size;
        }
        if let Ok(locale) = std::env::var("SUMMZ_LOCALE") {
            cfg.locale = locale;
        }
        if let Ok(container) = std::env::var("SUMMZ_DESTINATION_CONTAINER") {
            cfg.destination_container = container;
        }
        if let Some(secs) = parse_var::<u64>("SUMMZ_STATUS_POLL_INTERVAL_SECS")? {
            cfg.status_poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>("SUMMZ_MAX_STATUS_POLLS")? {
            cfg.max_status_polls = n;
        }
        if let Some(n) = parse_var::<usize>("SUMMZ_SUMMARIZE_MAX_IN_FLIGHT")? {
            cfg.summarize_max_in_flight = Some(n);
        }
        Ok(cfg)
    }
}
