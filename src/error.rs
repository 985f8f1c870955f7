//! Error types with error codes and fix suggestions
//!
//! Error code ranges:
//! - PT-001-009: Configuration errors
//! - PT-010-019: Identifier/validation errors
//! - PT-020-029: Storage errors
//! - PT-030-039: IO/serialization errors
//! - PT-040-049: Background task errors
//!
//! Step failures are never wrapped in this type: the engine hands the
//! body's own error back to the caller untouched.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipetraceError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum PipetraceError {
    // ═══════════════════════════════════════════
    // CONFIG ERRORS (001-009)
    // ═══════════════════════════════════════════
    #[error("[PT-001] Configuration error: {reason}")]
    ConfigError { reason: String },

    #[error("[PT-002] Invalid value for {var}: '{value}'")]
    InvalidEnvValue { var: String, value: String },

    // ═══════════════════════════════════════════
    // VALIDATION ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[PT-010] Invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("[PT-011] Pipeline '{name}' has not run yet")]
    PipelineNotStarted { name: String },

    // ═══════════════════════════════════════════
    // STORAGE ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[PT-020] Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("[PT-021] Step '{key}' (occurrence {occurrence}) not found in run '{run_id}'")]
    StepNotFound {
        run_id: String,
        key: String,
        occurrence: usize,
    },

    #[error("[PT-022] Corrupt index at {path}: {details}")]
    CorruptIndex { path: String, details: String },

    #[error("[PT-023] Storage not connected: {reason}")]
    NotConnected { reason: String },

    // ═══════════════════════════════════════════
    // IO / SERIALIZATION (030-039)
    // ═══════════════════════════════════════════
    #[error("[PT-030] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[PT-031] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ═══════════════════════════════════════════
    // BACKGROUND TASKS (040-049)
    // ═══════════════════════════════════════════
    #[error("[PT-040] Background writer failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PipetraceError {
    /// Stable error code (e.g. `PT-020`)
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError { .. } => "PT-001",
            Self::InvalidEnvValue { .. } => "PT-002",
            Self::InvalidIdentifier { .. } => "PT-010",
            Self::PipelineNotStarted { .. } => "PT-011",
            Self::RunNotFound { .. } => "PT-020",
            Self::StepNotFound { .. } => "PT-021",
            Self::CorruptIndex { .. } => "PT-022",
            Self::NotConnected { .. } => "PT-023",
            Self::Io(_) => "PT-030",
            Self::Json(_) => "PT-031",
            Self::Join(_) => "PT-040",
        }
    }
}

impl FixSuggestion for PipetraceError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            Self::ConfigError { .. } => Some("Check ~/.config/pipetrace/config.toml syntax"),
            Self::InvalidEnvValue { .. } => {
                Some("PIPETRACE_RETENTION_DAYS must be a non-negative integer")
            }
            Self::InvalidIdentifier { .. } => Some("Use a non-empty name without path separators"),
            Self::PipelineNotStarted { .. } => Some("Call Pipeline::run before reading its tree"),
            Self::RunNotFound { .. } => Some("List runs with `pipetrace runs <pipeline>`"),
            Self::StepNotFound { .. } => {
                Some("Check the step key; repeated keys are addressed by occurrence index")
            }
            Self::CorruptIndex { .. } => {
                Some("Remove or repair the index file; it is rebuilt on the next run")
            }
            Self::NotConnected { .. } => {
                Some("Point PIPETRACE_DIR (or --dir) at a writable directory")
            }
            Self::Io(_) => Some("Check the storage directory exists and is writable"),
            Self::Json(_) => None,
            Self::Join(_) => None,
        }
    }
}
