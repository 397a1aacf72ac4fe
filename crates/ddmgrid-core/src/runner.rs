//! Single-model fitting.
//!
//! [`ModelRunner::run`] expands a spec, opens the model's trace, assigns
//! proposals, hands everything to the engine and reduces the kept draws to
//! a [`ModelResult`]. The raw trace stays on disk; the result carries only
//! summaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::engine::{CancelToken, Draw, DrawSink, SamplingEngine, SamplingPlan, TraceRow};
use crate::error::{DdmError, PartialDiagnostics, Result};
use crate::expand::expand;
use crate::proposals::{ProposalTuning, plan_proposals};
use crate::spec::ModelSpec;
use crate::summary::{NodeStat, dic, summarize};
use crate::trace::{TraceStore, TraceWriter};

/// Configuration shared by every run of a runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub trace_root: PathBuf,
    pub tuning: ProposalTuning,
    pub seed: u64,
    /// Per-model wall-clock limit.
    pub timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            trace_root: PathBuf::from("traces"),
            tuning: ProposalTuning::Off,
            seed: 0,
            timeout: None,
        }
    }
}

/// Summary of one fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub name: String,
    pub dataset: String,
    pub engine: String,
    pub stats: Vec<NodeStat>,
    pub dic: f64,
    /// Log-posterior at the final state.
    pub logp: f64,
    pub n_trials: usize,
    pub excluded_trials: usize,
    pub kept_draws: usize,
    pub resumed_from: Option<usize>,
    pub elapsed_ms: u64,
}

impl ModelResult {
    pub fn stat(&self, id: &str) -> Option<&NodeStat> {
        self.stats.iter().find(|s| s.id == id)
    }
}

/// Writes every draw to the trace and keeps the post-burn-in ones.
struct CollectingSink {
    writer: TraceWriter,
    burn: usize,
    kept: Vec<TraceRow>,
    last: Option<TraceRow>,
}

impl DrawSink for CollectingSink {
    fn record(&mut self, draw: &Draw<'_>) -> Result<()> {
        self.writer.record(draw)?;
        let row = TraceRow::from(draw);
        if draw.iter >= self.burn {
            self.kept.push(row.clone());
        }
        self.last = Some(row);
        Ok(())
    }
}

/// Fits models one at a time against a shared engine and trace store.
#[derive(Clone)]
pub struct ModelRunner {
    engine: Arc<dyn SamplingEngine>,
    store: TraceStore,
    config: RunnerConfig,
}

impl ModelRunner {
    pub fn new(engine: Arc<dyn SamplingEngine>, config: RunnerConfig) -> Self {
        Self {
            engine,
            store: TraceStore::new(config.trace_root.clone()),
            config,
        }
    }

    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Fit `spec` for `samples` total iterations, discarding the first
    /// `burn`.
    ///
    /// Without `resume` any previous trace for the model is cleared first.
    /// Engine failures surface as [`DdmError::SamplingFailed`] and are not
    /// retried.
    pub fn run(
        &self,
        spec: &ModelSpec,
        samples: usize,
        burn: usize,
        resume: bool,
        cancel: &CancelToken,
    ) -> Result<ModelResult> {
        if burn >= samples {
            return Err(DdmError::invalid_spec(format!(
                "burn-in {burn} must be smaller than sample count {samples}"
            )));
        }
        let started = Instant::now();
        let model = expand(spec)?;
        let table = spec.dataset.as_ref();
        let node_ids: Vec<String> = model.nodes.iter().map(|n| n.id.clone()).collect();

        let (writer, resumed) = self.store.open(spec, &node_ids, samples, burn, resume)?;
        let start_iter = resumed.next_iter();
        let resumed_from = (start_iter > 0).then_some(start_iter);

        let plan = SamplingPlan {
            samples,
            burn,
            seed: self.config.seed.wrapping_add(start_iter as u64),
            start_iter,
            initial: resumed.rows.last().map(|r| r.values.clone()),
            proposals: plan_proposals(&model, &self.config.tuning),
        };
        let mut sink = CollectingSink {
            writer,
            burn,
            kept: resumed.rows.iter().filter(|r| r.iter >= burn).cloned().collect(),
            last: resumed.rows.last().cloned(),
        };

        log::info!(
            "{}: {} nodes, {} trials, iterations {start_iter}..{samples} ({} engine)",
            spec.name,
            model.nodes.len(),
            model.trials.len(),
            self.engine.name()
        );

        let cancel = cancel.child(self.config.timeout);
        if plan.remaining() > 0 {
            let output = self
                .engine
                .sample(&model, table, &plan, &mut sink, &cancel)?;
            log::debug!(
                "{}: {} draws, mean acceptance {:.3}",
                spec.name,
                output.draws_completed,
                mean(&output.acceptance)
            );
        }
        let CollectingSink {
            writer, kept, last, ..
        } = sink;
        writer.finish()?;

        let failed = |reason: &str| DdmError::SamplingFailed {
            model: spec.name.clone(),
            diagnostics: PartialDiagnostics {
                draws_completed: last.as_ref().map_or(0, |r| r.iter + 1),
                last_logp: last.as_ref().map(|r| r.logp).filter(|l| l.is_finite()),
                node: None,
                reason: reason.to_string(),
            },
        };
        if kept.is_empty() {
            return Err(failed("no draws kept after burn-in"));
        }

        let mut stats = Vec::with_capacity(model.nodes.len());
        let mut means = Vec::with_capacity(model.nodes.len());
        for (i, node) in model.nodes.iter().enumerate() {
            let column: Vec<f64> = kept.iter().map(|r| r.values[i]).collect();
            let summary = summarize(&column).ok_or_else(|| failed("empty chain"))?;
            means.push(summary.mean);
            stats.push(NodeStat {
                id: node.id.clone(),
                param: node.param.clone(),
                summary,
            });
        }

        let deviances: Vec<f64> = kept.iter().map(|r| r.deviance).collect();
        let dhat = self.engine.deviance(&model, table, &means)?;
        let logp = last.as_ref().map_or(f64::NAN, |r| r.logp);
        if !logp.is_finite() {
            return Err(failed("non-finite final log-posterior"));
        }

        let result = ModelResult {
            name: spec.name.clone(),
            dataset: spec.dataset_name.clone(),
            engine: self.engine.name().to_string(),
            stats,
            dic: dic(&deviances, dhat),
            logp,
            n_trials: model.trials.len(),
            excluded_trials: model.excluded_trials,
            kept_draws: kept.len(),
            resumed_from,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.store.write_summary(&spec.name, &result)?;
        log::info!(
            "{}: DIC {:.3}, logp {:.3} ({} kept draws, {:.1}s)",
            spec.name,
            result.dic,
            result.logp,
            result.kept_draws,
            started.elapsed().as_secs_f64()
        );
        Ok(result)
    }
}

fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    x.iter().sum::<f64>() / x.len() as f64
}
