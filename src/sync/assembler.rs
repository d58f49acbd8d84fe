//! Merges the four observations of a run into one record per path.
//!
//! Layering order matters: the live remote listing seeds the map, the local
//! listing overlays it, then remote tombstones and finally the local history
//! fill in deletion and rename times. Later layers merge field by field and
//! never clear the existence of a side observed by an earlier one.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::ConsistencyError;
use crate::util::path::{self as key_path, ROOT_KEY};

use super::history::{HistoryAction, HistoryRecord, KeyType};
use super::journal::DeletionOnRemote;
use super::local::LocalEntry;
use super::reconciler::Decision;
use super::remote::{METADATA_FILE, RemoteEntry};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalState {
    /// `max(mtime, ctime)` for files. For folders only set from a
    /// rename-destination history entry.
    pub mtime: Option<i64>,
    /// Live stat of a folder, `max(mtime, ctime)`.
    pub stat_time: Option<i64>,
    pub size: u64,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteState {
    pub id: String,
    pub mtime: Option<i64>,
    pub size: u64,
    pub hash: Option<String>,
}

/// Everything known about one path during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathRecord {
    pub key: String,
    pub local: Option<LocalState>,
    pub remote: Option<RemoteState>,
    pub deltime_local: Option<i64>,
    pub deltime_remote: Option<i64>,
    /// The local mtime came from a rename-destination entry.
    pub changed_local_mtime_using_mapping: bool,
    pub decision: Option<Decision>,
}

impl PathRecord {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            local: None,
            remote: None,
            deltime_local: None,
            deltime_remote: None,
            changed_local_mtime_using_mapping: false,
            decision: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        key_path::is_folder_key(&self.key)
    }

    pub fn exists_anywhere(&self) -> bool {
        self.local.is_some() || self.remote.is_some()
    }
}

pub type RecordMap = BTreeMap<String, PathRecord>;

fn entry<'a>(map: &'a mut RecordMap, key: &str) -> &'a mut PathRecord {
    map.entry(key.to_string())
        .or_insert_with(|| PathRecord::new(key))
}

/// Build the per-path map for one run.
///
/// Fails only on a history entry with an action kind it doesn't know.
pub fn assemble(
    remote: Vec<RemoteEntry>,
    local: Vec<LocalEntry>,
    tombstones: &[DeletionOnRemote],
    history: &[HistoryRecord],
) -> Result<RecordMap, ConsistencyError> {
    let mut map = RecordMap::new();

    // 1. remote listing
    for r in remote {
        if r.key == METADATA_FILE {
            continue;
        }
        let record = entry(&mut map, &r.key);
        if record.remote.is_some() {
            tracing::warn!(path = %r.key, id = %r.id, "duplicate remote path, later object wins");
        }
        record.remote = Some(RemoteState {
            id: r.id,
            mtime: r.mtime,
            size: r.size,
            hash: r.hash,
        });
    }

    // 2. local listing
    for l in local {
        let key = if l.is_dir {
            key_path::folder_key(&l.key)
        } else {
            l.key.clone()
        };
        if key == METADATA_FILE || key == ROOT_KEY {
            continue;
        }

        let state = if l.is_dir {
            LocalState {
                mtime: None,
                stat_time: l.mtime.max(l.ctime),
                size: 0,
                hash: None,
            }
        } else {
            LocalState {
                mtime: l.mtime.max(l.ctime),
                stat_time: None,
                size: l.size,
                hash: l.hash,
            }
        };
        entry(&mut map, &key).local = Some(state);
    }

    // 3. remote tombstones
    for t in tombstones {
        if t.key == METADATA_FILE {
            continue;
        }
        entry(&mut map, &t.key).deltime_remote = Some(t.action_when);
    }

    // 4. local history, oldest first
    let mut history: Vec<&HistoryRecord> = history.iter().collect();
    history.sort_by_key(|h| h.action_when);
    for h in history {
        let key = match h.key_type {
            KeyType::Folder => key_path::folder_key(&h.key),
            KeyType::File => h.key.clone(),
        };
        match &h.action {
            HistoryAction::Delete | HistoryAction::Rename => {
                entry(&mut map, &key).deltime_local = Some(h.action_when);
            }
            HistoryAction::RenameDestination => {
                let Some(record) = map.get_mut(&key) else {
                    continue;
                };
                if let Some(local) = record.local.as_mut() {
                    let existing = local.mtime.filter(|m| *m > 0);
                    local.mtime = Some(existing.map_or(h.action_when, |m| m.max(h.action_when)));
                }
                record.changed_local_mtime_using_mapping = true;
            }
            HistoryAction::Unknown(action) => {
                return Err(ConsistencyError::UnknownAction {
                    key,
                    action: action.clone(),
                });
            }
        }
    }

    // 5. tombstones with no live side
    map.retain(|_, r| r.exists_anywhere());
    Ok(map)
}
