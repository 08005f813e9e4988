use std::sync::Arc;

use super::model::{
    AudioInput, ChunkSet, JobHandle, JobStatus, MeetingSummary, MeetingSummaryResult, ResultFile, SummaryParts,
    TranscriptFiles,
};
use super::{
    CHECK_TRANSCRIPTION_STATUS, CHUNK_TRANSCRIPT, COMBINE_SUMMARIES, LIST_RESULT_FILES, SUMMARIZE_CHUNK, TRANSCRIBE,
    TRANSCRIPTION_COMPLETED_EVENT, WAIT_FOR_TRANSCRIPTION,
};
use crate::codec::{Codec, Json};
use crate::config::PipelineConfig;
use crate::{FailureKind, FanOutOptions, OrchestrationContext, RaceOutcome};

/// Audio to summary: transcribe, wait for the job, chunk the transcript,
/// summarize the chunks concurrently and combine the partial summaries.
pub async fn meeting_summary(
    ctx: OrchestrationContext,
    config: Arc<PipelineConfig>,
    audio: AudioInput,
) -> Result<MeetingSummaryResult, String> {
    ctx.log_info(format!("meeting summary started for {}", audio.name));

    let handle: JobHandle = ctx
        .schedule_activity_typed(TRANSCRIBE, &audio)?
        .into_activity_typed()
        .await?;
    ctx.log_info(format!("transcription job {} submitted", handle.job_id));

    let status: JobStatus = ctx
        .schedule_sub_orchestration_typed(WAIT_FOR_TRANSCRIPTION, &handle)?
        .into_sub_orchestration_typed()
        .await?;
    if status != JobStatus::Succeeded {
        return Err(format!("transcription job {} ended as {status:?}", handle.job_id));
    }

    let files: Vec<ResultFile> = ctx
        .schedule_activity_typed_with_retry(LIST_RESULT_FILES, &handle, config.list_files_retry.clone())?
        .into_activity_typed()
        .await?;
    let set: ChunkSet = ctx
        .schedule_activity_typed(
            CHUNK_TRANSCRIPT,
            &TranscriptFiles {
                source: audio.name.clone(),
                files,
            },
        )?
        .into_activity_typed()
        .await?;

    if set.chunks.is_empty() {
        ctx.log_warn(format!("no speech recognized in {}", audio.name));
        return Ok(MeetingSummaryResult {
            source: audio.name,
            chunk_count: 0,
            summary: MeetingSummary::no_speech(),
        });
    }

    let chunk_count = set.chunks.len();
    let inputs = set
        .chunks
        .iter()
        .map(|c| Json::encode(c))
        .collect::<Result<Vec<_>, _>>()?;
    let mut options = FanOutOptions::default().with_retry(config.completion_retry.clone());
    if let Some(max) = config.summarize_max_in_flight {
        options = options.with_max_in_flight(max);
    }
    let summaries = ctx
        .fan_out(SUMMARIZE_CHUNK, inputs, options)
        .await
        .into_result()
        .map_err(|e| {
            let detail = e
                .failed
                .iter()
                .map(|(i, err)| format!("chunk {i}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            format!("{e}: {detail}")
        })?;
    ctx.log_info(format!("{chunk_count} chunk(s) summarized"));

    let summary: MeetingSummary = ctx
        .schedule_activity_typed_with_retry(
            COMBINE_SUMMARIES,
            &SummaryParts {
                source: audio.name.clone(),
                summaries,
            },
            config.completion_retry.clone(),
        )?
        .into_activity_typed()
        .await?;

    ctx.log_info(format!("meeting summary completed for {}", audio.name));
    Ok(MeetingSummaryResult {
        source: audio.name,
        chunk_count,
        summary,
    })
}

/// Poll the job until it reaches a terminal status. Each round runs the
/// status check under the status retry policy; while the job is still
/// running the round waits for a completion signal or the poll interval.
pub async fn wait_for_transcription(
    ctx: OrchestrationContext,
    config: Arc<PipelineConfig>,
    handle: JobHandle,
) -> Result<JobStatus, String> {
    let rounds = config.max_status_polls.max(1);
    for round in 1..=rounds {
        let checked = ctx
            .schedule_activity_typed_with_retry(CHECK_TRANSCRIPTION_STATUS, &handle, config.status_retry.clone())?
            .into_activity_typed::<JobStatus>()
            .await;
        match checked {
            Ok(status) => return Ok(status),
            Err(e) if FailureKind::of(&e) == FailureKind::InProgress => {
                ctx.log_info(format!("job {} still running after round {round}", handle.job_id));
            }
            Err(e) => return Err(e),
        }
        if round == rounds {
            break;
        }
        if let RaceOutcome::Event(_) = ctx
            .wait_for_event_or_timer(TRANSCRIPTION_COMPLETED_EVENT, config.status_poll_interval)
            .await
        {
            ctx.log_info(format!("completion signal received for job {}", handle.job_id));
        }
    }
    Err(format!(
        "transcription job {} still running after {rounds} status round(s)",
        handle.job_id
    ))
}
