//! Meeting summary pipeline built on the durable runtime.
//!
//! An uploaded recording starts a `MeetingSummary` instance
//! ([`trigger::on_audio_uploaded`]). The instance submits a transcription
//! job, waits for it in a `WaitForTranscription` child instance, chunks the
//! transcript, summarizes the chunks concurrently and folds the partial
//! summaries into a [`model::MeetingSummaryResult`].
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::runtime::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder, Runtime};
use crate::{Event, OrchestrationContext};

pub mod activities;
pub mod chunking;
pub mod model;
pub mod orchestrations;
pub mod services;
pub mod trigger;

pub const MEETING_SUMMARY: &str = "MeetingSummary";
pub const WAIT_FOR_TRANSCRIPTION: &str = "WaitForTranscription";

pub const TRANSCRIBE: &str = "Transcribe";
pub const CHECK_TRANSCRIPTION_STATUS: &str = "CheckTranscriptionStatus";
pub const LIST_RESULT_FILES: &str = "ListResultFiles";
pub const CHUNK_TRANSCRIPT: &str = "ChunkTranscript";
pub const SUMMARIZE_CHUNK: &str = "SummarizeChunk";
pub const COMBINE_SUMMARIES: &str = "CombineSummaries";

/// External event that cuts a status poll interval short.
pub const TRANSCRIPTION_COMPLETED_EVENT: &str = "TranscriptionCompleted";

/// Activity registry with the built-in system activities and every
/// pipeline activity.
pub fn activity_registry(services: services::PipelineServices, config: Arc<PipelineConfig>) -> ActivityRegistry {
    activities::register_activities(ActivityRegistry::builder(), services, config).build()
}

pub fn register_orchestrations(
    builder: OrchestrationRegistryBuilder,
    config: Arc<PipelineConfig>,
) -> OrchestrationRegistryBuilder {
    let c = config.clone();
    builder
        .register_typed(MEETING_SUMMARY, move |ctx: OrchestrationContext, audio: model::AudioInput| {
            orchestrations::meeting_summary(ctx, c.clone(), audio)
        })
        .register_typed(WAIT_FOR_TRANSCRIPTION, move |ctx: OrchestrationContext, handle: model::JobHandle| {
            orchestrations::wait_for_transcription(ctx, config.clone(), handle)
        })
}

pub fn orchestration_registry(config: Arc<PipelineConfig>) -> OrchestrationRegistry {
    register_orchestrations(OrchestrationRegistry::builder(), config).build()
}

/// Signal the transcription wait of a `MeetingSummary` instance that its job
/// finished, so the next status check runs without waiting out the poll
/// interval. Returns the id of the signalled child instance, or an error if
/// the child is not subscribed yet and the signal was dropped.
pub async fn notify_transcription_completed(rt: &Runtime, instance: &str) -> Result<String, String> {
    let history = rt.get_history(instance).await;
    let child = history
        .iter()
        .rev()
        .find_map(|e| match e {
            Event::SubOrchestrationScheduled { name, instance: suffix, .. } if name == WAIT_FOR_TRANSCRIPTION => {
                Some(format!("{instance}::{suffix}"))
            }
            _ => None,
        })
        .ok_or_else(|| format!("instance {instance} is not waiting for a transcription"))?;
    if !rt.raise_event(&child, TRANSCRIPTION_COMPLETED_EVENT, "completed").await {
        return Err(format!("transcription wait {child} is not subscribed yet; signal dropped"));
    }
    Ok(child)
}
