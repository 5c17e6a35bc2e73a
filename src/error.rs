//! Load failures and aggregation diagnostics.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::state::{LocaleID, TaskID, Timestamp};

/// Fatal to a load: no model is produced.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no trace files named {stem}-<n> in {}", .dir.display())]
    NoTraceFiles { dir: PathBuf, stem: String },

    #[error("trace file for locale {locale} is missing ({})", .path.display())]
    MissingLocale { locale: LocaleID, path: PathBuf },

    #[error("{}: file is truncated", .path.display())]
    Truncated { path: PathBuf },

    #[error("{}:{line}: {message}", .path.display())]
    Decode {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{}: header names locale {found}, file name says {expected}", .path.display())]
    LocaleMismatch {
        path: PathBuf,
        expected: LocaleID,
        found: LocaleID,
    },

    #[error("{}: locale {locale} is outside a run of {nodes} locales", .path.display())]
    LocaleOutOfRange {
        path: PathBuf,
        locale: LocaleID,
        nodes: u32,
    },

    #[error("{}: header says the run has {found} locales, expected {expected}", .path.display())]
    NodeCountMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error(
        "{}:{line}: timestamp {time} is earlier than the preceding {previous}",
        .path.display()
    )]
    NonMonotonic {
        path: PathBuf,
        line: usize,
        time: Timestamp,
        previous: Timestamp,
    },

    #[error("{}: trace is from run {found}, expected run {expected}", .path.display())]
    RunMismatch {
        path: PathBuf,
        expected: Timestamp,
        found: Timestamp,
    },
}

/// A malformed event skipped during aggregation. Collected on the model
/// rather than aborting the pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationWarning {
    #[error(
        "{time}: locale {locale} recorded a communication with locale {remote}, \
         but the run has {num_locales} locales"
    )]
    LocaleOutOfRange {
        time: Timestamp,
        locale: LocaleID,
        remote: LocaleID,
        num_locales: usize,
    },

    #[error("{time}: locale {locale} began task {task} twice")]
    DuplicateTaskBegin {
        time: Timestamp,
        locale: LocaleID,
        task: TaskID,
    },

    #[error("{time}: locale {locale} ended task {task} twice")]
    DuplicateTaskEnd {
        time: Timestamp,
        locale: LocaleID,
        task: TaskID,
    },

    #[error("{time}: task {task} on locale {locale} has unknown kind {kind}")]
    BadTaskKind {
        time: Timestamp,
        locale: LocaleID,
        task: TaskID,
        kind: u8,
    },

    #[error("{time}: locale {locale} started tag {tag_no} a second time")]
    DuplicateTagStart {
        time: Timestamp,
        locale: LocaleID,
        tag_no: u32,
    },

    #[error("{time}: locale {locale} paused tag {tag_no}, which is not open there")]
    UnmatchedPause {
        time: Timestamp,
        locale: LocaleID,
        tag_no: u32,
    },

    #[error("{time}: locale {locale} names tag {tag_no} {found:?}, previously {expected:?}")]
    TagNameMismatch {
        time: Timestamp,
        locale: LocaleID,
        tag_no: u32,
        expected: String,
        found: String,
    },
}

impl AggregationWarning {
    pub fn locale(&self) -> LocaleID {
        match self {
            AggregationWarning::LocaleOutOfRange { locale, .. }
            | AggregationWarning::DuplicateTaskBegin { locale, .. }
            | AggregationWarning::DuplicateTaskEnd { locale, .. }
            | AggregationWarning::BadTaskKind { locale, .. }
            | AggregationWarning::DuplicateTagStart { locale, .. }
            | AggregationWarning::UnmatchedPause { locale, .. }
            | AggregationWarning::TagNameMismatch { locale, .. } => *locale,
        }
    }
}
