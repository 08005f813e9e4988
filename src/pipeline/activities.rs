//! Pipeline activities. Each one performs a single side-effecting call
//! against a service boundary and reports classified failures, so the
//! retry policies attached by the orchestrations can tell a job that is
//! still running from a broken request.
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::chunking::chunk_text;
use super::model::{
    AudioInput, Chunk, ChunkSet, CompletionRequest, JobHandle, JobStatus, MeetingSummary, PromptMessage, ResultFile,
    SummaryParts, TranscriptFiles, TranscriptionRequest,
};
use super::services::PipelineServices;
use super::{CHECK_TRANSCRIPTION_STATUS, CHUNK_TRANSCRIPT, COMBINE_SUMMARIES, LIST_RESULT_FILES, SUMMARIZE_CHUNK, TRANSCRIBE};
use crate::ActivityError;
use crate::config::PipelineConfig;
use crate::runtime::registry::ActivityRegistryBuilder;

pub const STILL_IN_PROGRESS: &str = "The transcription is still in progress.";

/// Sign a destination for the results and submit the transcription job.
pub async fn transcribe(
    services: &PipelineServices,
    config: &PipelineConfig,
    audio: AudioInput,
) -> Result<JobHandle, ActivityError> {
    info!(audio = %audio.name, "submitting transcription job");
    let destination = services
        .signer
        .destination_with_write_access(&config.destination_container, config.destination_ttl)
        .await?;
    let request = TranscriptionRequest::for_audio(&audio, &config.locale, destination);
    let job = services.transcription.submit(request).await?;
    let Some(job_id) = job.job_id() else {
        return Err(ActivityError::Permanent(format!(
            "transcription job link has no id: {:?}",
            job.self_uri
        )));
    };
    info!(audio = %audio.name, job_id, "transcription job submitted");
    Ok(JobHandle {
        job_id: job_id.to_string(),
    })
}

/// Terminal job status; a job that has not finished yet is an in-progress failure.
pub async fn check_transcription_status(
    services: &PipelineServices,
    handle: JobHandle,
) -> Result<JobStatus, ActivityError> {
    let job = services.transcription.status(&handle.job_id).await?;
    match job.status {
        Some(status) if status.is_terminal() => {
            info!(job_id = %handle.job_id, ?status, "transcription job finished");
            Ok(status)
        }
        status => {
            debug!(job_id = %handle.job_id, ?status, "transcription job still running");
            Err(ActivityError::InProgress(STILL_IN_PROGRESS.to_string()))
        }
    }
}

/// Result files of a finished job. Until the transcript file is listed the
/// call fails as in progress.
pub async fn list_result_files(
    services: &PipelineServices,
    handle: JobHandle,
) -> Result<Vec<ResultFile>, ActivityError> {
    let files = services.transcription.list_files(&handle.job_id).await?;
    if !files.iter().any(ResultFile::is_transcript) {
        debug!(job_id = %handle.job_id, listed = files.len(), "transcript file not listed yet");
        return Err(ActivityError::InProgress(format!(
            "transcript file for job {} not listed yet",
            handle.job_id
        )));
    }
    Ok(files)
}

pub async fn chunk_transcript(
    services: &PipelineServices,
    config: &PipelineConfig,
    input: TranscriptFiles,
) -> Result<ChunkSet, ActivityError> {
    let mut parts = Vec::new();
    for file in input.files.iter().filter(|f| f.is_transcript()) {
        let doc = services.transcription.read_transcript(&file.links.content_url).await?;
        let text = doc.text();
        if !text.is_empty() {
            parts.push(text);
        }
    }
    let text = parts.join(" ");
    let set = chunk_text(&input.source, &text, config.chunk_size).map_err(|e| ActivityError::Permanent(e.to_string()))?;
    info!(source = %input.source, chars = text.chars().count(), chunks = set.chunks.len(), "transcript chunked");
    Ok(set)
}

pub async fn summarize_chunk(
    services: &PipelineServices,
    config: &PipelineConfig,
    chunk: Chunk,
) -> Result<String, ActivityError> {
    let request = CompletionRequest {
        model: config.completion_model.clone(),
        messages: vec![PromptMessage::system(&config.chunk_prompt), PromptMessage::user(&chunk.text)],
    };
    let response = services.completion.complete(request).await?;
    match response.first_content() {
        Some(content) if !content.trim().is_empty() => {
            debug!(source = %chunk.source, index = chunk.index, "chunk summarized");
            Ok(content.trim().to_string())
        }
        _ => Err(ActivityError::Transient(format!(
            "empty completion for chunk {} of {}",
            chunk.index, chunk.source
        ))),
    }
}

/// Fold the ordered chunk summaries into the final structured summary.
pub async fn combine_summaries(
    services: &PipelineServices,
    config: &PipelineConfig,
    parts: SummaryParts,
) -> Result<MeetingSummary, ActivityError> {
    let body = parts
        .summaries
        .iter()
        .enumerate()
        .map(|(i, s)| format!("Part {}: {s}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    let request = CompletionRequest {
        model: config.completion_model.clone(),
        messages: vec![PromptMessage::system(&config.combine_prompt), PromptMessage::user(body)],
    };
    let response = services.completion.complete(request).await?;
    let content = response
        .first_content()
        .ok_or_else(|| ActivityError::Transient(format!("empty completion combining {}", parts.source)))?;
    parse_summary(content).map_err(|e| {
        warn!(source = %parts.source, error = %e, "combined summary is not valid JSON");
        ActivityError::Permanent(format!("decode summary: {e}"))
    })
}

/// Parse the JSON object in a completion, ignoring any text around it.
fn parse_summary(content: &str) -> Result<MeetingSummary, serde_json::Error> {
    let json = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => content,
    };
    serde_json::from_str(json)
}

/// Register every pipeline activity on `builder`.
pub fn register_activities(
    builder: ActivityRegistryBuilder,
    services: PipelineServices,
    config: Arc<PipelineConfig>,
) -> ActivityRegistryBuilder {
    let (s, c) = (services.clone(), config.clone());
    let builder = builder.register_classified_typed(TRANSCRIBE, move |audio: AudioInput| {
        let (s, c) = (s.clone(), c.clone());
        async move { transcribe(&s, &c, audio).await }
    });
    let s = services.clone();
    let builder = builder.register_classified_typed(CHECK_TRANSCRIPTION_STATUS, move |handle: JobHandle| {
        let s = s.clone();
        async move { check_transcription_status(&s, handle).await }
    });
    let s = services.clone();
    let builder = builder.register_classified_typed(LIST_RESULT_FILES, move |handle: JobHandle| {
        let s = s.clone();
        async move { list_result_files(&s, handle).await }
    });
    let (s, c) = (services.clone(), config.clone());
    let builder = builder.register_classified_typed(CHUNK_TRANSCRIPT, move |input: TranscriptFiles| {
        let (s, c) = (s.clone(), c.clone());
        async move { chunk_transcript(&s, &c, input).await }
    });
    let (s, c) = (services.clone(), config.clone());
    let builder = builder.register_classified_typed(SUMMARIZE_CHUNK, move |chunk: Chunk| {
        let (s, c) = (s.clone(), c.clone());
        async move { summarize_chunk(&s, &c, chunk).await }
    });
    builder.register_classified_typed(COMBINE_SUMMARIES, move |parts: SummaryParts| {
        let (s, c) = (services.clone(), config.clone());
        async move { combine_summaries(&s, &c, parts).await }
    })
}
