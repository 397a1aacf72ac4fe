//! The sampling-engine boundary.
//!
//! The core hands an engine an [`ExpandedModel`], the trial table it was
//! expanded from and a [`SamplingPlan`]; the engine streams every draw into
//! a [`DrawSink`] and reports how far it got. Engines must poll the
//! [`CancelToken`] between draws.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::expand::ExpandedModel;
use crate::proposals::ProposalPlan;
use crate::table::TrialTable;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared cancellation flag with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also fires once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Child token sharing this token's flag, with its own deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: match (self.deadline, timeout.map(|t| Instant::now() + t)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Why the token fired, if it has.
    pub fn reason(&self) -> Option<&'static str> {
        if self.flag.load(Ordering::SeqCst) {
            Some("cancelled")
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some("deadline exceeded")
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Draws
// ---------------------------------------------------------------------------

/// One state of the chain, burn-in included.
#[derive(Debug, Clone, Copy)]
pub struct Draw<'a> {
    /// Zero-based iteration number across resumed runs.
    pub iter: usize,
    pub logp: f64,
    /// −2 × log-likelihood at this state.
    pub deviance: f64,
    /// Node values aligned with `ExpandedModel::nodes`.
    pub values: &'a [f64],
}

/// Receiver of streamed draws.
pub trait DrawSink {
    fn record(&mut self, draw: &Draw<'_>) -> Result<()>;
}

/// Owned copy of a recorded draw.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRow {
    pub iter: usize,
    pub logp: f64,
    pub deviance: f64,
    pub values: Vec<f64>,
}

impl From<&Draw<'_>> for TraceRow {
    fn from(d: &Draw<'_>) -> Self {
        Self {
            iter: d.iter,
            logp: d.logp,
            deviance: d.deviance,
            values: d.values.to_vec(),
        }
    }
}

/// Sink that keeps every draw in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub rows: Vec<TraceRow>,
}

impl DrawSink for MemorySink {
    fn record(&mut self, draw: &Draw<'_>) -> Result<()> {
        self.rows.push(draw.into());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plan and engine trait
// ---------------------------------------------------------------------------

/// How many draws to take and where to start.
#[derive(Debug, Clone)]
pub struct SamplingPlan {
    /// Total iterations, burn-in included.
    pub samples: usize,
    pub burn: usize,
    pub seed: u64,
    /// First iteration number; non-zero when resuming.
    pub start_iter: usize,
    /// Starting node values; engine defaults when absent.
    pub initial: Option<Vec<f64>>,
    pub proposals: ProposalPlan,
}

impl Default for SamplingPlan {
    fn default() -> Self {
        Self {
            samples: 10_000,
            burn: 5_000,
            seed: 0,
            start_iter: 0,
            initial: None,
            proposals: ProposalPlan::default(),
        }
    }
}

impl SamplingPlan {
    /// Iterations still to run.
    pub fn remaining(&self) -> usize {
        self.samples.saturating_sub(self.start_iter)
    }
}

/// What an engine reports after a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub draws_completed: usize,
    /// Log-posterior at the final state.
    pub final_logp: f64,
    /// Acceptance rate per node.
    pub acceptance: Vec<f64>,
}

/// A posterior sampler for expanded models.
///
/// Failures to produce a valid posterior are reported as
/// [`DdmError::SamplingFailed`](crate::DdmError::SamplingFailed) carrying
/// partial diagnostics; sink errors propagate unchanged.
pub trait SamplingEngine: Send + Sync {
    fn name(&self) -> &str;

    fn sample(
        &self,
        model: &ExpandedModel,
        table: &TrialTable,
        plan: &SamplingPlan,
        sink: &mut dyn DrawSink,
        cancel: &CancelToken,
    ) -> Result<EngineOutput>;

    /// −2 × log-likelihood of the data at `values`.
    fn deviance(&self, model: &ExpandedModel, table: &TrialTable, values: &[f64]) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_flag_shared() {
        let token = CancelToken::new();
        let child = token.child(None);
        assert!(!child.is_cancelled());
        token.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some("cancelled"));
    }

    #[test]
    fn test_cancel_token_deadline() {
        let token = CancelToken::with_timeout(Duration::ZERO);
        assert_eq!(token.reason(), Some("deadline exceeded"));
        let parent = CancelToken::new();
        let child = parent.child(Some(Duration::from_secs(3600)));
        assert!(!child.is_cancelled());
    }

    #[test]
    fn test_memory_sink_records() {
        let mut sink = MemorySink::default();
        let values = [1.0, 2.0];
        sink.record(&Draw {
            iter: 3,
            logp: -1.0,
            deviance: 2.0,
            values: &values,
        })
        .unwrap();
        assert_eq!(sink.rows[0].iter, 3);
        assert_eq!(sink.rows[0].values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_plan_remaining() {
        let plan = SamplingPlan {
            samples: 100,
            start_iter: 40,
            ..Default::default()
        };
        assert_eq!(plan.remaining(), 60);
    }
}
