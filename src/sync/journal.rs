use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::remote::{self, METADATA_FILE, RemoteFile, RemoteStore};

const JOURNAL_VERSION: &str = "20250101";

/// A deletion another device should learn about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionOnRemote {
    pub key: String,
    pub action_when: i64,
}

/// The journal document stored at the remote root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataOnRemote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_when: Option<i64>,
    #[serde(default)]
    pub deletions: Vec<DeletionOnRemote>,
}

impl MetadataOnRemote {
    pub fn new(deletions: Vec<DeletionOnRemote>) -> Self {
        Self {
            version: Some(JOURNAL_VERSION.to_string()),
            generated_when: Some(chrono::Utc::now().timestamp_millis()),
            deletions,
        }
    }

    /// Only the deletions list matters; order included.
    pub fn same_deletions(&self, other: &Self) -> bool {
        self.deletions == other.deletions
    }
}

/// The journal as read at the start of a run.
#[derive(Debug, Clone, Default)]
pub struct JournalSnapshot {
    pub file: Option<RemoteFile>,
    pub content: MetadataOnRemote,
}

pub fn parse(bytes: &[u8]) -> Result<MetadataOnRemote> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(MetadataOnRemote::default());
    }
    serde_json::from_slice(bytes).context("Failed to parse remote metadata journal")
}

/// Download and parse the journal; an absent file is an empty journal.
pub async fn fetch(store: &dyn RemoteStore, file: Option<&RemoteFile>) -> Result<MetadataOnRemote> {
    let Some(file) = file else {
        tracing::debug!("no remote metadata journal yet");
        return Ok(MetadataOnRemote::default());
    };

    let bytes = remote::retry_read("download metadata journal", || store.download(&file.id))
        .await
        .with_context(|| format!("Failed to fetch {METADATA_FILE}"))?;
    parse(&bytes)
}

/// Write `deletions` to the journal unless they equal what was read this
/// run. Returns whether a remote write happened.
pub async fn upload_if_changed(
    store: &dyn RemoteStore,
    root_id: &str,
    snapshot: &JournalSnapshot,
    deletions: &[DeletionOnRemote],
) -> Result<bool> {
    let next = MetadataOnRemote::new(deletions.to_vec());
    if next.same_deletions(&snapshot.content) {
        tracing::debug!("metadata journal unchanged, not uploading");
        return Ok(false);
    }

    let body = serde_json::to_vec_pretty(&next)?;
    match &snapshot.file {
        Some(file) => {
            store
                .update_file(&file.id, body)
                .await
                .with_context(|| format!("Failed to update {METADATA_FILE}"))?;
        }
        None => {
            store
                .create_file(METADATA_FILE, root_id, body)
                .await
                .with_context(|| format!("Failed to create {METADATA_FILE}"))?;
        }
    }

    tracing::info!(deletions = deletions.len(), "metadata journal uploaded");
    Ok(true)
}
