//! Random-walk Metropolis over an expanded model.
//!
//! Every sweep updates nodes one at a time with a Gaussian step, then each
//! adaptive block jointly. Only the terms a proposal touches are
//! re-evaluated: the node's own prior, the priors of its subject children
//! and the likelihood of the trials it governs. Step sizes are tuned during
//! burn-in; block covariances adapt from the chain history, also only
//! during burn-in.

use std::collections::BTreeSet;

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use ddmgrid_core::{
    CancelToken, DdmError, Draw, DrawSink, EngineOutput, ExpandedModel, NodeLevel, ParamKind,
    ParamSymbol, PartialDiagnostics, Result, SamplingEngine, SamplingPlan, TrialTable,
};

use crate::priors::{NodePrior, PriorSet};
use crate::wfpt::{DdmParams, Integration, log_density};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct MetropolisConfig {
    /// Step for nodes without an assigned proposal scale.
    pub default_step: f64,
    /// Iterations between step-size and covariance updates.
    pub tune_interval: usize,
    /// Iterations of history before a block's covariance replaces its
    /// initial proposal.
    pub adapt_delay: usize,
    pub integration: Integration,
    pub priors: PriorSet,
}

impl Default for MetropolisConfig {
    fn default() -> Self {
        Self {
            default_step: 0.1,
            tune_interval: 100,
            adapt_delay: 500,
            integration: Integration::default(),
            priors: PriorSet::default(),
        }
    }
}

/// Component-wise random-walk Metropolis engine.
#[derive(Debug, Clone, Default)]
pub struct MetropolisEngine {
    config: MetropolisConfig,
}

impl MetropolisEngine {
    pub fn new(config: MetropolisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MetropolisConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Posterior density
// ---------------------------------------------------------------------------

/// Terms touched by a proposal on a set of nodes.
#[derive(Debug, Clone, Default)]
struct Neighborhood {
    /// Nodes whose prior must be re-evaluated (the moved nodes and their
    /// subject children).
    priors: Vec<usize>,
    trials: Vec<usize>,
}

/// Log-posterior of one expanded model against its data.
struct Density<'m> {
    model: &'m ExpandedModel,
    priors: Vec<NodePrior>,
    /// Signed reaction time per retained trial.
    x: Vec<f64>,
    children: Vec<Vec<usize>>,
    trials_of: Vec<Vec<usize>>,
    integration: Integration,
}

impl<'m> Density<'m> {
    fn new(model: &'m ExpandedModel, table: &TrialTable, config: &MetropolisConfig) -> Result<Self> {
        let rts = table.rts()?;
        let responses = table.responses()?;
        let n = model.nodes.len();

        let mut children = vec![Vec::new(); n];
        for (i, node) in model.nodes.iter().enumerate() {
            if let Some(parent) = node.parent {
                children[parent.mean].push(i);
                children[parent.scale].push(i);
            }
        }

        let mut trials_of = vec![Vec::new(); n];
        let mut x = Vec::with_capacity(model.trials.len());
        for (j, design) in model.trials.iter().enumerate() {
            let rt = rts[design.row];
            x.push(if responses[design.row] == 1 { rt } else { -rt });
            let mut touched: BTreeSet<usize> = design.base.iter().flatten().copied().collect();
            touched.extend(design.effects.iter().map(|e| e.node));
            for node in touched {
                trials_of[node].push(j);
            }
        }

        Ok(Self {
            model,
            priors: model
                .nodes
                .iter()
                .map(|n| NodePrior::for_node(n, &config.priors))
                .collect(),
            x,
            children,
            trials_of,
            integration: config.integration,
        })
    }

    fn neighborhood(&self, nodes: &[usize]) -> Neighborhood {
        let mut priors = BTreeSet::new();
        let mut trials = BTreeSet::new();
        for &i in nodes {
            priors.insert(i);
            priors.extend(self.children[i].iter().copied());
            trials.extend(self.trials_of[i].iter().copied());
        }
        Neighborhood {
            priors: priors.into_iter().collect(),
            trials: trials.into_iter().collect(),
        }
    }

    fn trial_params(&self, values: &[f64], j: usize) -> DdmParams {
        let design = &self.model.trials[j];
        let mut p = [0.0; 6];
        for sym in ParamSymbol::ALL {
            if let Some(node) = design.base[sym.index()] {
                p[sym.index()] = values[node];
            }
        }
        for link in &design.effects {
            p[link.target.index()] += values[link.node] * link.x;
        }
        let at = |s: ParamSymbol| p[s.index()];
        DdmParams {
            a: at(ParamSymbol::Boundary),
            v: at(ParamSymbol::Drift),
            t: at(ParamSymbol::NonDecision),
            z: 0.5,
            sv: at(ParamSymbol::DriftVar),
            sz: at(ParamSymbol::StartVar),
            st: at(ParamSymbol::NonDecisionVar),
        }
    }

    fn trial_loglik(&self, values: &[f64], j: usize) -> f64 {
        log_density(self.x[j], &self.trial_params(values, j), &self.integration)
    }

    fn loglik(&self, values: &[f64]) -> f64 {
        (0..self.x.len()).map(|j| self.trial_loglik(values, j)).sum()
    }

    fn prior(&self, values: &[f64], i: usize) -> f64 {
        self.priors[i].ln_pdf(values[i], values)
    }

    fn log_prior(&self, values: &[f64]) -> f64 {
        (0..values.len()).map(|i| self.prior(values, i)).sum()
    }

    fn local(&self, values: &[f64], hood: &Neighborhood) -> f64 {
        let prior: f64 = hood.priors.iter().map(|&i| self.prior(values, i)).sum();
        if prior == f64::NEG_INFINITY {
            return prior;
        }
        prior
            + hood
                .trials
                .iter()
                .map(|&j| self.trial_loglik(values, j))
                .sum::<f64>()
    }

    /// First node whose prior rules out the current state.
    fn worst_node(&self, values: &[f64]) -> Option<String> {
        (0..values.len())
            .find(|&i| !self.prior(values, i).is_finite())
            .map(|i| self.model.nodes[i].id.clone())
    }
}

// ---------------------------------------------------------------------------
// Starting values
// ---------------------------------------------------------------------------

fn starting_values(model: &ExpandedModel, table: &TrialTable) -> Result<Vec<f64>> {
    let rts = table.rts()?;
    let min_rt = model
        .trials
        .iter()
        .map(|d| rts[d.row])
        .fold(f64::INFINITY, f64::min);
    let t0 = (0.5 * min_rt).clamp(0.01, 0.3);

    Ok(model
        .nodes
        .iter()
        .map(|node| match (&node.kind, node.level) {
            (ParamKind::Base(ParamSymbol::NonDecision), NodeLevel::Scale) => 0.05,
            (_, NodeLevel::Scale) => 0.3,
            (ParamKind::Effect { .. }, _) => 0.0,
            (ParamKind::Base(p), _) => match p {
                ParamSymbol::Boundary => 1.5,
                ParamSymbol::Drift => 0.5,
                ParamSymbol::NonDecision => t0,
                ParamSymbol::DriftVar => 0.3,
                ParamSymbol::StartVar => 0.1,
                ParamSymbol::NonDecisionVar => (0.2 * min_rt).min(0.05),
            },
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Proposals
// ---------------------------------------------------------------------------

fn std_normal(rng: &mut StdRng) -> f64 {
    rng.sample(StandardNormal)
}

/// Step-size update from the acceptance rate of the last window.
fn tune_step(step: f64, rate: f64) -> f64 {
    let factor = if rate < 0.001 {
        0.1
    } else if rate < 0.05 {
        0.5
    } else if rate < 0.2 {
        0.9
    } else if rate > 0.95 {
        10.0
    } else if rate > 0.75 {
        2.0
    } else if rate > 0.5 {
        1.1
    } else {
        1.0
    };
    step * factor
}

/// Lower Cholesky factor of a block proposal covariance.
fn proposal_factor(model: &str, cov: DMatrix<f64>) -> Result<DMatrix<f64>> {
    Cholesky::new(cov)
        .map(|c| c.l())
        .ok_or_else(|| DdmError::SamplingFailed {
            model: model.to_string(),
            diagnostics: PartialDiagnostics {
                reason: "block covariance is not positive definite".to_string(),
                ..Default::default()
            },
        })
}

/// Joint proposal over a block of effect nodes with running moments.
struct BlockState {
    nodes: Vec<usize>,
    hood: Neighborhood,
    initial_sd: f64,
    chol: Option<DMatrix<f64>>,
    count: usize,
    mean: DVector<f64>,
    /// Sum of outer products of deviations.
    m2: DMatrix<f64>,
    accepted: usize,
    proposed: usize,
}

impl BlockState {
    fn new(nodes: Vec<usize>, hood: Neighborhood, initial_sd: f64) -> Self {
        let d = nodes.len();
        Self {
            nodes,
            hood,
            initial_sd,
            chol: None,
            count: 0,
            mean: DVector::zeros(d),
            m2: DMatrix::zeros(d, d),
            accepted: 0,
            proposed: 0,
        }
    }

    fn observe(&mut self, values: &[f64]) {
        self.count += 1;
        let x = DVector::from_iterator(self.nodes.len(), self.nodes.iter().map(|&i| values[i]));
        let delta = &x - &self.mean;
        self.mean += &delta / self.count as f64;
        self.m2 += &delta * (&x - &self.mean).transpose();
    }

    /// Refresh the proposal from the chain history; a covariance that
    /// cannot be factored leaves the previous proposal in place.
    fn adapt(&mut self, model: &str) {
        let d = self.nodes.len();
        if self.count < 2 {
            return;
        }
        let scale = 2.38 * 2.38 / d as f64;
        let mut cov = &self.m2 * (scale / (self.count - 1) as f64);
        for i in 0..d {
            cov[(i, i)] += 1e-8;
        }
        match proposal_factor(model, cov) {
            Ok(l) => self.chol = Some(l),
            Err(e) => log::debug!("{e}; keeping previous proposal"),
        }
    }

    fn propose(&self, rng: &mut StdRng) -> DVector<f64> {
        let e = DVector::from_fn(self.nodes.len(), |_, _| std_normal(rng));
        match &self.chol {
            Some(l) => l * e,
            None => e * self.initial_sd,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

impl SamplingEngine for MetropolisEngine {
    fn name(&self) -> &str {
        "metropolis"
    }

    fn sample(
        &self,
        model: &ExpandedModel,
        table: &TrialTable,
        plan: &SamplingPlan,
        sink: &mut dyn DrawSink,
        cancel: &CancelToken,
    ) -> Result<EngineOutput> {
        let cfg = &self.config;
        let density = Density::new(model, table, cfg)?;
        let n = model.nodes.len();
        let mut rng = StdRng::seed_from_u64(plan.seed);

        let mut values = match &plan.initial {
            Some(v) if v.len() == n => v.clone(),
            Some(v) => {
                return Err(DdmError::invalid_spec(format!(
                    "{}: {} starting values for {n} nodes",
                    model.name,
                    v.len()
                )));
            }
            None => starting_values(model, table)?,
        };

        let fail = |iter: usize, logp: f64, node: Option<String>, reason: &str| {
            DdmError::SamplingFailed {
                model: model.name.clone(),
                diagnostics: PartialDiagnostics {
                    draws_completed: iter,
                    last_logp: logp.is_finite().then_some(logp),
                    node,
                    reason: reason.to_string(),
                },
            }
        };

        let mut loglik = density.loglik(&values);
        let mut logp = density.log_prior(&values) + loglik;
        if !logp.is_finite() {
            return Err(fail(
                plan.start_iter,
                logp,
                density.worst_node(&values),
                "non-finite log-posterior at starting values",
            ));
        }

        let mut blocks: Vec<BlockState> = plan
            .proposals
            .blocks
            .iter()
            .map(|b| BlockState::new(b.nodes.clone(), density.neighborhood(&b.nodes), b.initial_sd))
            .collect();
        let singles: Vec<usize> = (0..n).filter(|&i| !plan.proposals.in_block(i)).collect();
        let hoods: Vec<Neighborhood> = (0..n)
            .map(|i| {
                if plan.proposals.in_block(i) {
                    Neighborhood::default()
                } else {
                    density.neighborhood(&[i])
                }
            })
            .collect();
        let mut steps: Vec<f64> = (0..n)
            .map(|i| plan.proposals.step(i).unwrap_or(cfg.default_step))
            .collect();
        let mut accepted = vec![0usize; n];
        let mut proposed = vec![0usize; n];
        let mut window = vec![0usize; n];

        log::debug!(
            "{}: {} single-node updates, {} blocks, starting logp {logp:.3}",
            model.name,
            singles.len(),
            blocks.len()
        );

        for iter in plan.start_iter..plan.samples {
            if let Some(reason) = cancel.reason() {
                return Err(fail(iter, logp, None, reason));
            }

            for &i in &singles {
                let hood = &hoods[i];
                let before = density.local(&values, hood);
                let old = values[i];
                values[i] = old + steps[i] * std_normal(&mut rng);
                let after = density.local(&values, hood);
                proposed[i] += 1;
                if after.is_finite() && rng.random::<f64>().ln() < after - before {
                    accepted[i] += 1;
                    window[i] += 1;
                } else {
                    values[i] = old;
                }
            }

            for block in &mut blocks {
                let before = density.local(&values, &block.hood);
                let old: Vec<f64> = block.nodes.iter().map(|&i| values[i]).collect();
                let step = block.propose(&mut rng);
                for (k, &i) in block.nodes.iter().enumerate() {
                    values[i] += step[k];
                }
                let after = density.local(&values, &block.hood);
                block.proposed += 1;
                if after.is_finite() && rng.random::<f64>().ln() < after - before {
                    block.accepted += 1;
                } else {
                    for (k, &i) in block.nodes.iter().enumerate() {
                        values[i] = old[k];
                    }
                }
                if iter < plan.burn {
                    block.observe(&values);
                }
            }

            if iter < plan.burn && (iter + 1) % cfg.tune_interval == 0 {
                for &i in &singles {
                    let rate = window[i] as f64 / cfg.tune_interval as f64;
                    steps[i] = tune_step(steps[i], rate);
                    window[i] = 0;
                }
                for block in blocks.iter_mut().filter(|b| b.count >= cfg.adapt_delay) {
                    block.adapt(&model.name);
                }
            }

            loglik = density.loglik(&values);
            logp = density.log_prior(&values) + loglik;
            if !logp.is_finite() {
                return Err(fail(
                    iter,
                    logp,
                    density.worst_node(&values),
                    "non-finite log-posterior",
                ));
            }
            sink.record(&Draw {
                iter,
                logp,
                deviance: -2.0 * loglik,
                values: &values,
            })?;
        }

        let mut acceptance: Vec<f64> = (0..n)
            .map(|i| {
                if proposed[i] == 0 {
                    0.0
                } else {
                    accepted[i] as f64 / proposed[i] as f64
                }
            })
            .collect();
        for block in &blocks {
            let rate = if block.proposed == 0 {
                0.0
            } else {
                block.accepted as f64 / block.proposed as f64
            };
            for &i in &block.nodes {
                acceptance[i] = rate;
            }
        }

        Ok(EngineOutput {
            draws_completed: plan.remaining(),
            final_logp: logp,
            acceptance,
        })
    }

    fn deviance(&self, model: &ExpandedModel, table: &TrialTable, values: &[f64]) -> Result<f64> {
        if values.len() != model.nodes.len() {
            return Err(DdmError::invalid_spec(format!(
                "{}: {} values for {} nodes",
                model.name,
                values.len(),
                model.nodes.len()
            )));
        }
        let density = Density::new(model, table, &self.config)?;
        Ok(-2.0 * density.loglik(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddmgrid_core::{
        Column, MemorySink, ModelSpec, ProposalTuning, expand, plan_proposals,
    };
    use std::sync::Arc;

    /// Two subjects, twelve trials each, reaction times well above 0.3 s.
    fn table() -> TrialTable {
        let mut subj = Vec::new();
        let mut rt = Vec::new();
        let mut resp = Vec::new();
        let mut stim = Vec::new();
        let mut theta = Vec::new();
        for s in 0..2 {
            for k in 0..12 {
                subj.push(s);
                rt.push(0.45 + 0.07 * k as f64 + 0.03 * s as f64);
                resp.push(i64::from(k % 3 != 0));
                stim.push(Some(if k % 2 == 0 { "WW" } else { "LL" }.to_string()));
                theta.push((k as f64 - 5.5) / 3.5);
            }
        }
        TrialTable::from_columns(vec![
            ("subj_idx".into(), Column::Int(subj)),
            ("rt".into(), Column::Float(rt)),
            ("response".into(), Column::Int(resp)),
            ("stim".into(), Column::Label(stim)),
            ("theta".into(), Column::Float(theta)),
        ])
        .unwrap()
    }

    fn spec() -> ModelSpec {
        ModelSpec::new("m", Arc::new(table()))
            .effects("a", &["theta"])
            .depends("v", &["stim"])
    }

    fn plan(model: &ExpandedModel, samples: usize, tuning: ProposalTuning) -> SamplingPlan {
        SamplingPlan {
            samples,
            burn: samples / 2,
            seed: 7,
            proposals: plan_proposals(model, &tuning),
            ..Default::default()
        }
    }

    #[test]
    fn test_sampler_records_every_iteration() {
        let spec = spec();
        let model = expand(&spec).unwrap();
        let engine = MetropolisEngine::default();
        let mut sink = MemorySink::default();
        let out = engine
            .sample(
                &model,
                &spec.dataset,
                &plan(&model, 60, ProposalTuning::Off),
                &mut sink,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(sink.rows.len(), 60);
        assert_eq!(out.draws_completed, 60);
        assert!(sink.rows.iter().all(|r| r.logp.is_finite()));
        assert!(sink.rows.iter().all(|r| r.values.len() == model.nodes.len()));
        assert_eq!(out.final_logp, sink.rows[59].logp);
        assert!(out.acceptance.iter().any(|&a| a > 0.0));
    }

    #[test]
    fn test_same_seed_same_chain() {
        let spec = spec();
        let model = expand(&spec).unwrap();
        let engine = MetropolisEngine::default();
        let run = || {
            let mut sink = MemorySink::default();
            engine
                .sample(
                    &model,
                    &spec.dataset,
                    &plan(&model, 20, ProposalTuning::Off),
                    &mut sink,
                    &CancelToken::new(),
                )
                .unwrap();
            sink.rows
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_adaptive_blocks_accept() {
        let spec = spec();
        let model = expand(&spec).unwrap();
        let engine = MetropolisEngine::new(MetropolisConfig {
            tune_interval: 10,
            adapt_delay: 20,
            ..Default::default()
        });
        let plan = plan(&model, 80, ProposalTuning::Adaptive { initial_sd: 0.05 });
        assert_eq!(plan.proposals.blocks.len(), 1);
        let mut sink = MemorySink::default();
        let out = engine
            .sample(&model, &spec.dataset, &plan, &mut sink, &CancelToken::new())
            .unwrap();
        let block = &plan.proposals.blocks[0];
        let rate = out.acceptance[block.nodes[0]];
        assert!(block.nodes.iter().all(|&i| out.acceptance[i] == rate));
    }

    #[test]
    fn test_cancel_reports_partial_state() {
        let spec = spec();
        let model = expand(&spec).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = MetropolisEngine::default()
            .sample(
                &model,
                &spec.dataset,
                &plan(&model, 10, ProposalTuning::Off),
                &mut MemorySink::default(),
                &token,
            )
            .unwrap_err();
        match err {
            DdmError::SamplingFailed { diagnostics, .. } => {
                assert_eq!(diagnostics.draws_completed, 0);
                assert!(diagnostics.last_logp.is_some());
                assert_eq!(diagnostics.reason, "cancelled");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_impossible_start_fails() {
        let spec = spec();
        let model = expand(&spec).unwrap();
        // Non-decision time longer than every reaction time.
        let mut initial = starting_values(&model, &spec.dataset).unwrap();
        for (i, node) in model.nodes.iter().enumerate() {
            if node.param == "t" && node.level != NodeLevel::Scale {
                initial[i] = 5.0;
            }
        }
        let plan = SamplingPlan {
            initial: Some(initial),
            ..plan(&model, 10, ProposalTuning::Off)
        };
        let err = MetropolisEngine::default()
            .sample(
                &model,
                &spec.dataset,
                &plan,
                &mut MemorySink::default(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, DdmError::SamplingFailed { .. }));
    }

    #[test]
    fn test_deviance_matches_recorded() {
        let spec = spec();
        let model = expand(&spec).unwrap();
        let engine = MetropolisEngine::default();
        let mut sink = MemorySink::default();
        engine
            .sample(
                &model,
                &spec.dataset,
                &plan(&model, 5, ProposalTuning::Off),
                &mut sink,
                &CancelToken::new(),
            )
            .unwrap();
        let last = &sink.rows[4];
        let d = engine.deviance(&model, &spec.dataset, &last.values).unwrap();
        assert!((d - last.deviance).abs() < 1e-9);
        assert!(engine.deviance(&model, &spec.dataset, &[1.0]).is_err());
    }

    #[test]
    #[ignore] // slow: a few thousand full-likelihood sweeps
    fn test_long_chain_stays_in_support() {
        let spec = spec();
        let model = expand(&spec).unwrap();
        let engine = MetropolisEngine::default();
        let plan = plan(&model, 3000, ProposalTuning::Fixed(Default::default()));
        let mut sink = MemorySink::default();
        engine
            .sample(&model, &spec.dataset, &plan, &mut sink, &CancelToken::new())
            .unwrap();
        let kept = &sink.rows[plan.burn..];
        let column = |id: &str| {
            let i = model.nodes.iter().position(|n| n.id == id).unwrap();
            kept.iter().map(|r| r.values[i]).collect::<Vec<_>>()
        };
        let a = column("a");
        assert!(a.iter().all(|&x| x > 0.0));
        // Non-decision time can never pass a subject's fastest response.
        for (id, fastest) in [("t_subj.0", 0.45), ("t_subj.1", 0.48)] {
            assert!(column(id).iter().all(|&x| x > 0.0 && x < fastest));
        }
        let mean_a = a.iter().sum::<f64>() / a.len() as f64;
        assert!(mean_a.is_finite());
    }

    #[test]
    fn test_tune_step_rules() {
        assert_eq!(tune_step(1.0, 0.0), 0.1);
        assert_eq!(tune_step(1.0, 0.3), 1.0);
        assert_eq!(tune_step(1.0, 0.99), 10.0);
    }

    #[test]
    fn test_proposal_factor() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let l = proposal_factor("m", m).unwrap();
        assert!((l[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((l[(1, 0)] - 1.0).abs() < 1e-12);
        assert!((l[(1, 1)] - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(l[(0, 1)], 0.0);

        let err = proposal_factor("m", DMatrix::from_element(1, 1, -1.0)).unwrap_err();
        assert!(matches!(err, DdmError::SamplingFailed { .. }));
    }

    #[test]
    fn test_block_adapts_to_history() {
        let mut block = BlockState::new(vec![0, 1], Neighborhood::default(), 0.05);
        for k in 0..50 {
            let x = k as f64 * 0.1;
            block.observe(&[x, 0.5 * x + (k % 3) as f64]);
        }
        block.adapt("m");
        let l = block.chol.as_ref().unwrap();
        assert_eq!(l.shape(), (2, 2));
        assert!(l[(0, 0)] > 0.0 && l[(1, 1)] > 0.0);

        // A constant history only carries the jitter, which still factors.
        let mut flat = BlockState::new(vec![0], Neighborhood::default(), 0.05);
        for _ in 0..10 {
            flat.observe(&[1.0]);
        }
        flat.adapt("m");
        assert!(flat.chol.is_some());
    }
}
