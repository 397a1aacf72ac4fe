//! Error taxonomy for dataset loading, spec expansion and model fitting.
//!
//! Loader- and spec-level errors are raised eagerly, before any sampling
//! resources exist. Sampling failures carry whatever diagnostics the engine
//! managed to produce. Missing strata in derived split columns are *not*
//! errors; they surface as unset cells in the trial table.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Partial state reported by a sampling engine that could not finish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialDiagnostics {
    /// Draws completed before the failure (burn-in included).
    pub draws_completed: usize,
    /// Last finite log-posterior observed, if any.
    pub last_logp: Option<f64>,
    /// Node whose update produced the failure, if known.
    pub node: Option<String>,
    /// Human-readable reason.
    pub reason: String,
}

impl std::fmt::Display for PartialDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} after {} draws", self.reason, self.draws_completed)?;
        if let Some(node) = &self.node {
            write!(f, " (node {node})")?;
        }
        if let Some(logp) = self.last_logp {
            write!(f, ", last logp {logp:.3}")?;
        }
        Ok(())
    }
}

/// Top-level error type for ddmgrid.
#[derive(Debug, Error)]
pub enum DdmError {
    /// A normalization batch had zero variance.
    #[error("cannot z-score column '{column}' in batch {batch}: standard deviation is zero")]
    DegenerateScale { column: String, batch: String },

    /// Strict relabeling met a code that is not in the lookup table.
    #[error("unknown code '{code}' in column '{column}'")]
    UnknownCode { column: String, code: String },

    /// A model spec references a missing covariate, excludes a mandatory
    /// parameter, or is otherwise malformed.
    #[error("invalid model spec: {0}")]
    InvalidSpec(String),

    /// The sampling engine could not produce a valid posterior.
    #[error("sampling failed for model '{model}': {diagnostics}")]
    SamplingFailed {
        model: String,
        diagnostics: PartialDiagnostics,
    },

    /// A column is missing or has the wrong kind for the requested access.
    #[error("column error: {0}")]
    Column(String),

    /// A delimited source could not be parsed.
    #[error("{source_name}:{line}: {message}")]
    Parse {
        source_name: String,
        line: usize,
        message: String,
    },

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Job transport between coordinator and workers broke down.
    #[error("dispatch error: {0}")]
    Dispatch(String),
}

impl DdmError {
    /// Create an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// I/O error attached to a path.
    pub fn io_at(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::io(PathBuf::from(path).display().to_string(), source)
    }

    /// Shorthand for [`DdmError::InvalidSpec`].
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    /// Whether the error was detected before any sampling work started.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::DegenerateScale { .. }
                | Self::UnknownCode { .. }
                | Self::InvalidSpec(_)
                | Self::Parse { .. }
                | Self::Column(_)
        )
    }
}

/// Result type alias for ddmgrid.
pub type Result<T> = std::result::Result<T, DdmError>;
