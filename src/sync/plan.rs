use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

use crate::util::path as key_path;

use super::assembler::{PathRecord, RecordMap};
use super::journal::DeletionOnRemote;
use super::reconciler::Decision;

/// What started a run. Recorded in the plan only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Auto,
    AutoOnceInit,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::AutoOnceInit => "auto_once_init",
        })
    }
}

/// A fully decided run, ready for the executor.
#[derive(Debug, Clone, Serialize)]
pub struct SyncPlan {
    pub ts: i64,
    pub trigger: TriggerSource,
    pub records: BTreeMap<String, PathRecord>,
    /// Shallowest first; the execution order.
    pub sorted_keys: Vec<String>,
    pub deletions: Vec<DeletionOnRemote>,
}

impl SyncPlan {
    pub fn new(ts: i64, trigger: TriggerSource, records: RecordMap) -> Self {
        let sorted_keys = keys_shallowest_first(&records);
        let deletions = collect_deletions(&records, &sorted_keys);
        Self {
            ts,
            trigger,
            records,
            sorted_keys,
            deletions,
        }
    }

    /// Number of records per decision.
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for r in self.records.values() {
            let name = r
                .decision
                .and_then(|d| serde_json::to_value(d).ok())
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "undecided".to_string());
            *counts.entry(name).or_insert(0) += 1;
        }
        counts
    }

    /// True when every record is a skip.
    pub fn is_noop(&self) -> bool {
        self.records
            .values()
            .all(|r| r.decision.is_some_and(Decision::is_skip))
    }
}

fn by_length(records: &RecordMap) -> Vec<String> {
    let mut keys: Vec<String> = records.keys().cloned().collect();
    keys.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    keys
}

/// Keys ordered by path length, longest first. Used for deciding.
pub fn keys_deepest_first(records: &RecordMap) -> Vec<String> {
    let mut keys = by_length(records);
    keys.reverse();
    keys
}

/// Keys ordered by path length, shortest first. Used for execution.
pub fn keys_shallowest_first(records: &RecordMap) -> Vec<String> {
    by_length(records)
}

/// One journal entry per record whose decision removes it, carrying the
/// deletion time that won.
pub fn collect_deletions(records: &RecordMap, order: &[String]) -> Vec<DeletionOnRemote> {
    order
        .iter()
        .filter_map(|key| {
            let r = records.get(key)?;
            let action_when = match r.decision? {
                Decision::UploadLocalDelHistToRemote | Decision::UploadLocalDelHistToRemoteFolder => {
                    r.deltime_local
                }
                Decision::KeepRemoteDelHist | Decision::KeepRemoteDelHistFolder => r.deltime_remote,
                _ => return None,
            };
            Some(DeletionOnRemote {
                key: key.clone(),
                action_when: action_when.unwrap_or(0),
            })
        })
        .collect()
}

/// Parent → children edges of the execution graph.
///
/// A key depends on its immediate parent folder when that folder is itself
/// part of the plan; otherwise it is a root and can start right away.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    pub roots: Vec<String>,
    pub children: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn build(sorted_keys: &[String], records: &RecordMap) -> Self {
        let mut graph = Self::default();
        for key in sorted_keys {
            match key_path::parent_path(key) {
                Some(parent) if records.contains_key(&parent) => {
                    graph.children.entry(parent).or_default().push(key.clone());
                }
                _ => graph.roots.push(key.clone()),
            }
        }
        graph
    }

    pub fn children_of(&self, key: &str) -> &[String] {
        self.children.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every key below `key` in the graph.
    pub fn descendants(&self, key: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&str> = vec![key];
        while let Some(k) = stack.pop() {
            for child in self.children_of(k) {
                out.push(child.clone());
                stack.push(child);
            }
        }
        out
    }
}
