use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConsistencyError;
use crate::util::path as key_path;

use super::assembler::{PathRecord, RecordMap};
use super::plan;

/// The single outcome assigned to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    /// Both sides already hold the same content.
    SkipUploading,
    /// Deleted locally last: delete the remote copy.
    UploadLocalDelHistToRemote,
    /// Deleted elsewhere last: drop the local copy.
    KeepRemoteDelHist,
    UploadLocalToRemote,
    DownloadRemoteToLocal,
    /// Folder alive on one side only.
    CreateFolder,
    UploadLocalDelHistToRemoteFolder,
    KeepRemoteDelHistFolder,
    /// Folder alive on both sides.
    SkipFolder,
}

impl Decision {
    /// Decisions that remove the path and belong in the deletion journal.
    pub fn is_deletion(self) -> bool {
        matches!(
            self,
            Self::UploadLocalDelHistToRemote
                | Self::KeepRemoteDelHist
                | Self::UploadLocalDelHistToRemoteFolder
                | Self::KeepRemoteDelHistFolder
        )
    }

    pub fn is_skip(self) -> bool {
        matches!(self, Self::SkipUploading | Self::SkipFolder)
    }
}

/// The four instants a decision compares, with a missing side or field
/// counted as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Times {
    mtime_local: i64,
    mtime_remote: i64,
    deltime_local: i64,
    deltime_remote: i64,
}

impl Times {
    fn of(r: &PathRecord) -> Self {
        Self {
            mtime_local: r.local.as_ref().and_then(|l| l.mtime).unwrap_or(0),
            mtime_remote: r.remote.as_ref().and_then(|s| s.mtime).unwrap_or(0),
            deltime_local: r.deltime_local.unwrap_or(0),
            deltime_remote: r.deltime_remote.unwrap_or(0),
        }
    }
}

fn abnormal(key: &str, field: &'static str, value: Option<i64>) -> ConsistencyError {
    ConsistencyError::AbnormalTime {
        key: key.to_string(),
        field,
        value,
    }
}

/// A present time must be positive.
fn check_positive(key: &str, field: &'static str, value: Option<i64>) -> Result<(), ConsistencyError> {
    match value {
        Some(v) if v <= 0 => Err(abnormal(key, field, value)),
        _ => Ok(()),
    }
}

fn check_deletion_times(r: &PathRecord) -> Result<(), ConsistencyError> {
    check_positive(&r.key, "deltime_local", r.deltime_local)?;
    check_positive(&r.key, "deltime_remote", r.deltime_remote)
}

/// Assign a decision to every record, deepest path first so that a kept
/// child protects its parent folders.
pub fn decide_all(records: &mut RecordMap) -> Result<(), ConsistencyError> {
    let mut kept_folder: HashSet<String> = HashSet::new();
    for key in plan::keys_deepest_first(records) {
        let Some(record) = records.get_mut(&key) else {
            continue;
        };
        let decision = if record.is_folder() {
            assign_folder_decision(record, &mut kept_folder)?
        } else {
            assign_file_decision(record, &mut kept_folder)?
        };
        tracing::trace!(path = %key, ?decision, "decided");
    }
    Ok(())
}

/// Decide a folder's fate.
///
/// A folder survives when something under it survived, when it has no
/// deletion record at all, or when it was touched (live stat or a rename
/// into place) after its newest deletion. Otherwise the newer deletion wins.
pub fn assign_folder_decision(
    r: &mut PathRecord,
    kept_folder: &mut HashSet<String>,
) -> Result<Decision, ConsistencyError> {
    check_deletion_times(r)?;
    if let Some(local) = &r.local {
        check_positive(&r.key, "mtime_local", local.mtime)?;
    }

    let deltime_local = r.deltime_local.unwrap_or(0);
    let deltime_remote = r.deltime_remote.unwrap_or(0);

    let kept = if kept_folder.contains(&r.key) {
        true
    } else if r.deltime_local.is_none() && r.deltime_remote.is_none() {
        true
    } else if let Some(stat) = r.local.as_ref().and_then(|l| l.stat_time)
        && stat > 0
        && stat >= deltime_local
        && stat >= deltime_remote
    {
        true
    } else {
        let mapped = r.local.as_ref().and_then(|l| l.mtime).unwrap_or(0);
        r.changed_local_mtime_using_mapping && mapped > deltime_local && mapped > deltime_remote
    };

    let decision = if kept {
        kept_folder.insert(key_path::parent_folder(&r.key));
        match (&r.local, &r.remote) {
            (Some(_), Some(_)) => Decision::SkipFolder,
            (Some(_), None) | (None, Some(_)) => Decision::CreateFolder,
            (None, None) => {
                return Err(ConsistencyError::KeptFolderMissing { key: r.key.clone() });
            }
        }
    } else if deltime_local > deltime_remote {
        Decision::UploadLocalDelHistToRemoteFolder
    } else {
        Decision::KeepRemoteDelHistFolder
    };

    r.decision = Some(decision);
    Ok(decision)
}

/// Decide a file's fate: the side (or deletion) with the newest instant
/// wins, and identical content on both sides is never transferred.
pub fn assign_file_decision(
    r: &mut PathRecord,
    kept_folder: &mut HashSet<String>,
) -> Result<Decision, ConsistencyError> {
    if let Some(local) = &r.local
        && !local.mtime.is_some_and(|m| m > 0)
    {
        return Err(abnormal(&r.key, "mtime_local", local.mtime));
    }
    if let Some(remote) = &r.remote
        && !remote.mtime.is_some_and(|m| m > 0)
    {
        return Err(abnormal(&r.key, "mtime_remote", remote.mtime));
    }
    check_deletion_times(r)?;

    let t = Times::of(r);
    let local_hash = r.local.as_ref().and_then(|l| l.hash.as_deref());
    let remote_hash = r.remote.as_ref().and_then(|s| s.hash.as_deref());
    let same_content = local_hash.is_some() && local_hash == remote_hash;

    let decision = if r.local.is_some()
        && t.mtime_local >= t.mtime_remote
        && t.mtime_local >= t.deltime_local
        && t.mtime_local >= t.deltime_remote
    {
        kept_folder.insert(key_path::parent_folder(&r.key));
        if same_content {
            Decision::SkipUploading
        } else {
            Decision::UploadLocalToRemote
        }
    } else if r.remote.is_some()
        && t.mtime_remote > t.mtime_local
        && t.mtime_remote >= t.deltime_local
        && t.mtime_remote >= t.deltime_remote
    {
        kept_folder.insert(key_path::parent_folder(&r.key));
        if same_content {
            Decision::SkipUploading
        } else {
            Decision::DownloadRemoteToLocal
        }
    } else if t.deltime_local != 0
        && t.deltime_local >= t.mtime_local
        && t.deltime_local >= t.mtime_remote
        && t.deltime_local >= t.deltime_remote
    {
        Decision::UploadLocalDelHistToRemote
    } else if t.deltime_remote != 0
        && t.deltime_remote >= t.mtime_local
        && t.deltime_remote >= t.mtime_remote
        && t.deltime_remote >= t.deltime_local
    {
        Decision::KeepRemoteDelHist
    } else {
        return Err(ConsistencyError::NoDecision { key: r.key.clone() });
    };

    r.decision = Some(decision);
    Ok(decision)
}
