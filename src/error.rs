use thiserror::Error;

/// Violations of the reconciliation invariants.
///
/// Any of these aborts the current run before the executor touches either
/// side. They travel inside `anyhow::Error`; use `downcast_ref` to tell them
/// apart from I/O or API failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("abnormal {field} for {key}: {value:?}")]
    AbnormalTime {
        key: String,
        field: &'static str,
        value: Option<i64>,
    },

    #[error("folder {key} doesn't exist locally or remotely but is marked must be kept")]
    KeptFolderMissing { key: String },

    #[error("unknown history action type {action:?} for {key}")]
    UnknownAction { key: String, action: String },

    #[error("no decision reachable for {key}")]
    NoDecision { key: String },

    #[error("record {key} reached the executor without a decision")]
    Undecided { key: String },
}
