use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::MEETING_SUMMARY;
use super::model::AudioInput;
use crate::runtime::Runtime;

/// Notification that a recording landed in the upload container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobUploaded {
    pub name: String,
    pub content_uri: String,
    #[serde(default)]
    pub is_batch: bool,
}

impl BlobUploaded {
    /// Upload of `name` into `container` of a storage account.
    pub fn in_account(account: &str, container: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            content_uri: format!("https://{account}.blob.core.windows.net/{container}/{name}"),
            is_batch: false,
        }
    }
}

/// Start a meeting summary instance for an uploaded recording and return
/// its instance id.
pub async fn on_audio_uploaded(rt: &Arc<Runtime>, blob: BlobUploaded) -> Result<String, String> {
    if blob.name.trim().is_empty() || blob.content_uri.trim().is_empty() {
        return Err("upload notification without blob name or uri".to_string());
    }
    let audio = AudioInput {
        name: blob.name.clone(),
        data_uri: blob.content_uri,
        is_batch: blob.is_batch,
    };
    match rt.schedule_new_orchestration_typed(MEETING_SUMMARY, &audio).await {
        Ok(instance) => {
            info!(instance, blob = %blob.name, "meeting summary pipeline started");
            Ok(instance)
        }
        Err(e) => {
            error!(blob = %blob.name, error = %e, "failed to start meeting summary pipeline");
            Err(e)
        }
    }
}
