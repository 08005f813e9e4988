//! Payloads exchanged with the transcription and completion services, and
//! the pipeline's own inputs and outputs. Field names follow the services'
//! camelCase JSON.
use serde::{Deserialize, Serialize};

/// Kind of the result file that holds the recognized transcript.
pub const TRANSCRIPTION_FILE_KIND: &str = "Transcription";

/// Overview used when the transcript contains no recognized speech.
pub const NO_SPEECH_OVERVIEW: &str = "No speech could be recognized.";

/// Uploaded recording to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInput {
    pub name: String,
    #[serde(alias = "uri")]
    pub data_uri: String,
    #[serde(default)]
    pub is_batch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionProperties {
    pub diarization_enabled: bool,
    pub word_level_timestamps_enabled: bool,
    pub punctuation_mode: String,
    pub profanity_filter_mode: String,
    pub channels: Vec<u32>,
    pub destination_container_url: String,
}

/// Batch transcription job submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionRequest {
    pub content_urls: Vec<String>,
    pub properties: TranscriptionProperties,
    pub locale: String,
    pub display_name: String,
}

impl TranscriptionRequest {
    pub fn for_audio(audio: &AudioInput, locale: &str, destination_container_url: String) -> Self {
        Self {
            content_urls: vec![audio.data_uri.clone()],
            properties: TranscriptionProperties {
                diarization_enabled: false,
                word_level_timestamps_enabled: false,
                punctuation_mode: "DictatedAndAutomatic".to_string(),
                profanity_filter_mode: "Masked".to_string(),
                channels: vec![0],
                destination_container_url,
            },
            locale: locale.to_string(),
            display_name: format!("Transcription - meeting:{}", audio.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Job resource as returned by the transcription service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionJob {
    #[serde(rename = "self")]
    pub self_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

impl TranscriptionJob {
    /// Job id: the last path segment of the job's `self` link.
    pub fn job_id(&self) -> Option<&str> {
        self.self_uri
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }
}

/// Reference to a submitted job, passed between pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultLinks {
    pub content_url: String,
}

/// One entry of a job's result file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFile {
    #[serde(rename = "self")]
    pub self_uri: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: String,
    pub links: ResultLinks,
}

impl ResultFile {
    pub fn is_transcript(&self) -> bool {
        self.kind == TRANSCRIPTION_FILE_KIND
    }
}

/// Result files of one recording, handed to the chunking stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptFiles {
    pub source: String,
    pub files: Vec<ResultFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizedPhrase {
    #[serde(default)]
    pub channel: u32,
    #[serde(rename = "maskedITN")]
    pub masked_itn: String,
}

/// Recognized transcript file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptDocument {
    pub source: String,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub combined_recognized_phrases: Vec<RecognizedPhrase>,
}

impl TranscriptDocument {
    /// Non-empty phrases joined by single spaces.
    pub fn text(&self) -> String {
        self.combined_recognized_phrases
            .iter()
            .map(|p| p.masked_itn.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub source: String,
    pub index: usize,
    pub text: String,
    /// Length of `text` in chars.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSet {
    pub source: String,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: PromptMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .iter()
            .min_by_key(|c| c.index)
            .map(|c| c.message.content.as_str())
    }
}

/// Chunk summaries of one recording, in chunk order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryParts {
    pub source: String,
    pub summaries: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingSummary {
    pub overview: String,
    #[serde(default)]
    pub attendees: Vec<String>,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
}

impl MeetingSummary {
    pub fn no_speech() -> Self {
        Self {
            overview: NO_SPEECH_OVERVIEW.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingSummaryResult {
    pub source: String,
    pub chunk_count: usize,
    pub summary: MeetingSummary,
}
