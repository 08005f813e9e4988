#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use meeting_summz::config::PipelineConfig;
use meeting_summz::pipeline::model::{
    CompletionRequest, CompletionResponse, Choice, JobStatus, MeetingSummary, PromptMessage, RecognizedPhrase,
    ResultFile, ResultLinks, TranscriptDocument, TranscriptionJob, TranscriptionRequest,
};
use meeting_summz::pipeline::services::{
    CompletionService, PipelineServices, ServiceError, StorageSigner, TranscriptionService,
};
use meeting_summz::providers::HistoryStore;
use meeting_summz::providers::fs::FsHistoryStore;
use meeting_summz::runtime::{ActivityRegistry, InstanceOutcome, Runtime};
use meeting_summz::{Event, OrchestrationRegistry, RetryOn, RetryPolicy};
use tempfile::TempDir;

/// Runtime over a filesystem store in a fresh temp dir. The dir is removed
/// when the returned `TempDir` drops.
pub async fn fs_runtime(
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
) -> (TempDir, Arc<dyn HistoryStore>, Arc<Runtime>) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(dir.path(), true));
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    (dir, store, rt)
}

/// Start `orchestration` as `instance` and wait for its outcome.
pub async fn run(rt: &Arc<Runtime>, instance: &str, orchestration: &str, input: &str) -> InstanceOutcome {
    rt.clone()
        .start_orchestration(instance, orchestration, input)
        .await
        .unwrap()
        .await
        .unwrap()
}

/// Poll `instance`'s history until `pred` holds or `timeout_ms` elapses.
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await;
        if pred(&hist) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_subscription(store: Arc<dyn HistoryStore>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |h| {
            h.iter()
                .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name))
        },
        timeout_ms,
    )
    .await
}

pub const JOB_ID: &str = "job-1";

/// Transcription service whose job reports `Running` for the first
/// `running_polls` status calls, then `final_status`.
pub struct FakeTranscription {
    running_polls: u32,
    final_status: JobStatus,
    phrases: Vec<String>,
    pub status_calls: AtomicU32,
    pub submitted: Mutex<Vec<TranscriptionRequest>>,
}

impl FakeTranscription {
    pub fn new(running_polls: u32, phrases: &[&str]) -> Self {
        Self {
            running_polls,
            final_status: JobStatus::Succeeded,
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
            status_calls: AtomicU32::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(running_polls: u32) -> Self {
        Self {
            final_status: JobStatus::Failed,
            ..Self::new(running_polls, &[])
        }
    }

    fn job(&self, status: Option<JobStatus>) -> TranscriptionJob {
        TranscriptionJob {
            self_uri: format!("https://speech.test/transcriptions/{JOB_ID}"),
            status,
        }
    }
}

#[async_trait]
impl TranscriptionService for FakeTranscription {
    async fn submit(&self, request: TranscriptionRequest) -> Result<TranscriptionJob, ServiceError> {
        self.submitted.lock().unwrap().push(request);
        Ok(self.job(Some(JobStatus::NotStarted)))
    }

    async fn status(&self, job_id: &str) -> Result<TranscriptionJob, ServiceError> {
        if job_id != JOB_ID {
            return Err(ServiceError::NotFound(job_id.to_string()));
        }
        let n = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let status = if n <= self.running_polls {
            JobStatus::Running
        } else {
            self.final_status
        };
        Ok(self.job(Some(status)))
    }

    async fn list_files(&self, job_id: &str) -> Result<Vec<ResultFile>, ServiceError> {
        Ok(vec![
            ResultFile {
                self_uri: format!("https://speech.test/transcriptions/{job_id}/files/report"),
                name: Some("report.json".into()),
                kind: "TranscriptionReport".into(),
                links: ResultLinks {
                    content_url: "https://store.test/report.json".into(),
                },
            },
            ResultFile {
                self_uri: format!("https://speech.test/transcriptions/{job_id}/files/0"),
                name: Some("contenturl_0.json".into()),
                kind: "Transcription".into(),
                links: ResultLinks {
                    content_url: "https://store.test/contenturl_0.json".into(),
                },
            },
        ])
    }

    async fn read_transcript(&self, _content_url: &str) -> Result<TranscriptDocument, ServiceError> {
        Ok(TranscriptDocument {
            source: "https://store.test/meeting1.wav".into(),
            duration: Some("PT1M".into()),
            combined_recognized_phrases: self
                .phrases
                .iter()
                .map(|p| RecognizedPhrase {
                    channel: 0,
                    masked_itn: p.clone(),
                })
                .collect(),
        })
    }
}

/// Completion service that echoes chunk text and answers combine requests
/// with a JSON summary. Chunks containing `fail_marker` fail permanently.
pub struct FakeCompletion {
    pub calls: AtomicU32,
    fail_marker: Option<String>,
}

impl FakeCompletion {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_marker: None,
        }
    }

    pub fn failing_on(marker: &str) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_marker: Some(marker.to_string()),
        }
    }
}

#[async_trait]
impl CompletionService for FakeCompletion {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let user = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        if let Some(marker) = &self.fail_marker
            && user.contains(marker.as_str())
        {
            return Err(ServiceError::BadRequest("content filtered".into()));
        }
        let content = if user.starts_with("Part 1:") {
            let summary = MeetingSummary {
                overview: format!("{} part(s)", user.lines().count()),
                attendees: vec!["Ana".into()],
                key_points: user.lines().map(str::to_string).collect(),
                decisions: vec![],
            };
            serde_json::to_string(&summary).unwrap()
        } else {
            format!("summary of [{user}]")
        };
        Ok(CompletionResponse {
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: PromptMessage {
                    role: "assistant".into(),
                    content,
                },
            }],
            usage: None,
        })
    }
}

pub struct FixedSigner;

#[async_trait]
impl StorageSigner for FixedSigner {
    async fn destination_with_write_access(&self, container: &str, _ttl: Duration) -> Result<String, ServiceError> {
        Ok(format!("https://store.test/{container}?sig=test"))
    }
}

pub fn services(transcription: Arc<FakeTranscription>, completion: Arc<FakeCompletion>) -> PipelineServices {
    PipelineServices {
        transcription,
        completion,
        signer: Arc::new(FixedSigner),
    }
}

/// Pipeline settings scaled down to milliseconds.
pub fn fast_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        chunk_size: 16,
        status_poll_interval: Duration::from_millis(200),
        max_status_polls: 5,
        status_retry: RetryPolicy::new(2, Duration::from_millis(10)).retry_on(RetryOn::InProgress),
        list_files_retry: RetryPolicy::new(3, Duration::from_millis(10)).retry_on(RetryOn::InProgress),
        completion_retry: RetryPolicy::new(3, Duration::from_millis(10)).with_backoff(2.0),
        ..PipelineConfig::default()
    }
}
