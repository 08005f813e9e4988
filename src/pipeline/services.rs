//! Boundaries to the external services the pipeline activities call.
//! Concrete HTTP clients live outside this crate.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::model::{CompletionRequest, CompletionResponse, ResultFile, TranscriptDocument, TranscriptionJob, TranscriptionRequest};
use crate::ActivityError;

/// Failure reported by a service client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("throttled: {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl From<ServiceError> for ActivityError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Throttled { message, retry_after } => ActivityError::throttled(message, retry_after),
            e @ (ServiceError::Unavailable(_) | ServiceError::Timeout(_)) => ActivityError::Transient(e.to_string()),
            e => ActivityError::Permanent(e.to_string()),
        }
    }
}

#[async_trait]
pub trait TranscriptionService: Send + Sync {
    async fn submit(&self, request: TranscriptionRequest) -> Result<TranscriptionJob, ServiceError>;
    async fn status(&self, job_id: &str) -> Result<TranscriptionJob, ServiceError>;
    async fn list_files(&self, job_id: &str) -> Result<Vec<ResultFile>, ServiceError>;
    async fn read_transcript(&self, content_url: &str) -> Result<TranscriptDocument, ServiceError>;
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ServiceError>;
}

#[async_trait]
pub trait StorageSigner: Send + Sync {
    /// URL of `container` carrying a write credential valid for `ttl`.
    async fn destination_with_write_access(&self, container: &str, ttl: Duration) -> Result<String, ServiceError>;
}

/// Service clients shared by the pipeline activities.
#[derive(Clone)]
pub struct PipelineServices {
    pub transcription: Arc<dyn TranscriptionService>,
    pub completion: Arc<dyn CompletionService>,
    pub signer: Arc<dyn StorageSigner>,
}
