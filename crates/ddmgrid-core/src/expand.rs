//! Expansion of a [`ModelSpec`] into a concrete hierarchical parameter graph.
//!
//! Every parameter (a base DDM symbol or a regression coefficient) is split
//! into one *cell* per combination of its `depends_on` levels that actually
//! occurs in the data. Within a cell:
//!
//! - `a`, `v`, `t` get a group mean, a group scale (`_tau`) and one node per
//!   subject present in the cell;
//! - optional `V`, `Z`, `T` get a single group node;
//! - effect coefficients get a single group node when effects are
//!   root-scoped, otherwise the same mean/scale/subject triple as `a`.
//!
//! Node ids follow `p`, `p(l1.l2)`, `p_tau(l1.l2)` and `p_subj(l1.l2).<s>`.
//! Alongside the nodes the expansion records, for every retained trial,
//! which node supplies each base parameter and which effect terms add onto
//! it, so a sampling engine never has to interpret names.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DdmError, Result};
use crate::spec::{ModelSpec, ModelType, ParamSymbol, effect_param, interaction_param};
use crate::table::{Column, TrialTable};

// ---------------------------------------------------------------------------
// Node model
// ---------------------------------------------------------------------------

/// Proposal-tuning family, fixed at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeFamily {
    Scale,
    Effect,
    Boundary,
    Drift,
    Other,
}

/// Position of a node in the subject hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLevel {
    /// Population mean (or the only node of a non-hierarchical parameter).
    Group,
    /// Population spread of the subject nodes below a group mean.
    Scale,
    Subject(i64),
}

/// Regression term an effect coefficient multiplies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectTerm {
    Main(String),
    Interaction(String, String),
}

impl EffectTerm {
    /// Covariate value of the term at `row`; the product for interactions.
    pub fn value(&self, table: &TrialTable, row: usize) -> Option<f64> {
        let get = |c: &str| table.column(c).and_then(|col| col.value_f64(row));
        match self {
            Self::Main(c) => get(c),
            Self::Interaction(a, b) => Some(get(a)? * get(b)?),
        }
    }

    fn covariates(&self) -> Vec<&str> {
        match self {
            Self::Main(c) => vec![c.as_str()],
            Self::Interaction(a, b) => vec![a.as_str(), b.as_str()],
        }
    }
}

/// What a node parameterizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Base(ParamSymbol),
    Effect {
        target: ParamSymbol,
        term: EffectTerm,
    },
}

/// Group mean and scale a subject node is drawn around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parent {
    pub mean: usize,
    pub scale: usize,
}

/// One stochastic node of the expanded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Parameter name without level decoration (`a`, `e_theta_a`).
    pub param: String,
    pub kind: ParamKind,
    pub level: NodeLevel,
    pub family: NodeFamily,
    /// `(covariate, level)` pairs identifying the cell.
    pub condition: Vec<(String, String)>,
    pub parent: Option<Parent>,
    /// Trials governed by this node.
    pub n_trials: usize,
    pub instantaneous: bool,
}

impl Node {
    pub fn is_effect(&self) -> bool {
        matches!(self.kind, ParamKind::Effect { .. })
    }
}

/// An effect contribution to one trial's base parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectLink {
    pub target: ParamSymbol,
    pub node: usize,
    pub x: f64,
}

/// Node wiring of one retained trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialDesign {
    /// Row in the spec's trial table.
    pub row: usize,
    /// Node supplying each base parameter, indexed like [`ParamSymbol::ALL`].
    pub base: [Option<usize>; 6],
    pub effects: Vec<EffectLink>,
}

/// The fully materialized parameter graph of one model.
#[derive(Debug, Clone)]
pub struct ExpandedModel {
    pub name: String,
    /// Instantiated base parameters in vocabulary order.
    pub params: Vec<ParamSymbol>,
    pub nodes: Vec<Node>,
    pub trials: Vec<TrialDesign>,
    /// Trials dropped because a consumed covariate was unset.
    pub excluded_trials: usize,
    pub n_subjects: usize,
}

impl ExpandedModel {
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn find(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Group-level effect nodes modulating `target`.
    pub fn effect_nodes(&self, target: ParamSymbol) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| {
                n.level == NodeLevel::Group
                    && matches!(n.kind, ParamKind::Effect { target: t, .. } if t == target)
            })
            .collect()
    }

    pub fn nodes_in_family(&self, family: NodeFamily) -> impl Iterator<Item = (usize, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.family == family)
    }
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// Sortable level value: integers order numerically, labels lexically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum LevelKey {
    Int(i64),
    Label(String),
}

impl fmt::Display for LevelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Label(s) => f.write_str(s),
        }
    }
}

fn level_key(col: &Column, row: usize) -> Option<LevelKey> {
    match col {
        Column::Int(v) => Some(LevelKey::Int(v[row])),
        Column::Label(v) => v[row].clone().map(LevelKey::Label),
        Column::Float(_) => None,
    }
}

/// A parameter to materialize, before cells are known.
struct ParamPlan {
    name: String,
    kind: ParamKind,
    family: NodeFamily,
    hierarchical: bool,
    instantaneous: bool,
}

fn base_family(p: ParamSymbol) -> NodeFamily {
    match p {
        ParamSymbol::Boundary => NodeFamily::Boundary,
        ParamSymbol::Drift => NodeFamily::Drift,
        _ => NodeFamily::Other,
    }
}

fn parse_excludes(spec: &ModelSpec) -> Result<BTreeSet<ParamSymbol>> {
    let mut out = BTreeSet::new();
    for raw in &spec.exclude {
        let p: ParamSymbol = raw.parse()?;
        if p.is_mandatory() {
            return Err(DdmError::invalid_spec(format!(
                "parameter '{p}' is mandatory and cannot be excluded"
            )));
        }
        out.insert(p);
    }
    Ok(out)
}

fn check_covariate(table: &TrialTable, name: &str, numeric: bool, usage: &str) -> Result<()> {
    let col = table.column(name).ok_or_else(|| {
        DdmError::invalid_spec(format!("{usage} covariate '{name}' is not a dataset column"))
    })?;
    let ok = if numeric {
        col.is_numeric()
    } else {
        !matches!(col, Column::Float(_))
    };
    if !ok {
        return Err(DdmError::invalid_spec(format!(
            "{usage} covariate '{name}' has unusable kind {}",
            col.kind()
        )));
    }
    Ok(())
}

fn effect_plans(
    spec: &ModelSpec,
    params: &[ParamSymbol],
    plans: &mut Vec<ParamPlan>,
) -> Result<()> {
    for (target, covs) in &spec.effects_on {
        let target_sym: ParamSymbol = target.parse()?;
        if !params.contains(&target_sym) {
            return Err(DdmError::invalid_spec(format!(
                "effect target '{target}' is not instantiated by this model"
            )));
        }
        let terms = match covs.as_slice() {
            [c] => vec![EffectTerm::Main(c.clone())],
            [c1, c2] if c1 == c2 => {
                return Err(DdmError::invalid_spec(format!(
                    "effects on '{target}' name covariate '{c1}' twice"
                )));
            }
            [c1, c2] => vec![
                EffectTerm::Main(c1.clone()),
                EffectTerm::Main(c2.clone()),
                EffectTerm::Interaction(c1.clone(), c2.clone()),
            ],
            _ => {
                return Err(DdmError::invalid_spec(format!(
                    "effects on '{target}' need one or two covariates, got {}",
                    covs.len()
                )));
            }
        };
        for c in covs {
            check_covariate(&spec.dataset, c, true, "effect")?;
        }
        for term in terms {
            let name = match &term {
                EffectTerm::Main(c) => effect_param(c, target),
                EffectTerm::Interaction(a, b) => interaction_param(a, b, target),
            };
            let instantaneous = term
                .covariates()
                .iter()
                .any(|c| spec.instantaneous.contains(*c));
            plans.push(ParamPlan {
                name,
                kind: ParamKind::Effect {
                    target: target_sym,
                    term,
                },
                family: NodeFamily::Effect,
                hierarchical: !spec.use_root_for_effects,
                instantaneous,
            });
        }
    }
    Ok(())
}

fn check_depends_keys(spec: &ModelSpec, plans: &[ParamPlan]) -> Result<()> {
    for (key, covs) in &spec.depends_on {
        if !plans.iter().any(|p| &p.name == key) {
            let msg = match key.parse::<ParamSymbol>() {
                Ok(p) => format!("depends_on names '{p}', which this model does not instantiate"),
                Err(_) => format!("depends_on key '{key}' is neither a parameter nor an effect"),
            };
            return Err(DdmError::invalid_spec(msg));
        }
        let mut seen = BTreeSet::new();
        for c in covs {
            if !seen.insert(c) {
                return Err(DdmError::invalid_spec(format!(
                    "depends_on '{key}' names covariate '{c}' twice"
                )));
            }
            check_covariate(&spec.dataset, c, false, "depends_on")?;
            check_level_labels(&spec.dataset, c)?;
        }
    }
    Ok(())
}

/// Level labels become part of node ids, so they may not contain the id
/// punctuation.
fn check_level_labels(table: &TrialTable, name: &str) -> Result<()> {
    if let Some(Column::Label(_)) = table.column(name) {
        for level in table.levels(name)? {
            if level.contains(['.', '(', ')']) {
                return Err(DdmError::invalid_spec(format!(
                    "level '{level}' of depends_on covariate '{name}' contains '.', '(' or ')'"
                )));
            }
        }
    }
    Ok(())
}

/// Expand a spec into its node graph.
///
/// All validation happens before any node is built, so an invalid spec
/// fails without side effects.
pub fn expand(spec: &ModelSpec) -> Result<ExpandedModel> {
    let table = spec.dataset.as_ref();
    let excluded = parse_excludes(spec)?;

    let params: Vec<ParamSymbol> = ParamSymbol::ALL
        .into_iter()
        .filter(|p| {
            p.is_mandatory() || (spec.model_type == ModelType::Full && !excluded.contains(p))
        })
        .collect();

    let mut plans: Vec<ParamPlan> = params
        .iter()
        .map(|&p| ParamPlan {
            name: p.symbol().to_string(),
            kind: ParamKind::Base(p),
            family: base_family(p),
            hierarchical: p.is_mandatory(),
            instantaneous: false,
        })
        .collect();
    effect_plans(spec, &params, &mut plans)?;
    check_depends_keys(spec, &plans)?;

    let subjects = table.subjects()?;
    table.rts()?;
    table.responses()?;

    // Trials with an unset consumed covariate drop out of the model.
    let consumed: Vec<&Column> = spec
        .covariates()
        .into_iter()
        .map(|c| table.require(c))
        .collect::<Result<_>>()?;
    let rows: Vec<usize> = (0..table.len())
        .filter(|&i| consumed.iter().all(|c| c.is_set(i)))
        .collect();
    let excluded_trials = table.len() - rows.len();
    if rows.is_empty() {
        return Err(DdmError::invalid_spec(format!(
            "model '{}' retains no trials",
            spec.name
        )));
    }
    if excluded_trials > 0 {
        log::debug!(
            "{}: excluding {excluded_trials} trials with unset covariates",
            spec.name
        );
    }

    let mut nodes: Vec<Node> = Vec::new();
    // assign[plan][row] = node whose value the trial reads for that plan.
    let mut assign: Vec<Vec<Option<usize>>> = vec![vec![None; table.len()]; plans.len()];

    for (pi, plan) in plans.iter().enumerate() {
        let covs: Vec<&str> = spec
            .depends_on
            .get(&plan.name)
            .map(|v| v.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let cols: Vec<&Column> = covs
            .iter()
            .map(|c| table.require(c))
            .collect::<Result<_>>()?;

        let mut cells: BTreeMap<Vec<LevelKey>, Vec<usize>> = BTreeMap::new();
        for &i in &rows {
            let key: Option<Vec<LevelKey>> = cols.iter().map(|c| level_key(c, i)).collect();
            if let Some(key) = key {
                cells.entry(key).or_default().push(i);
            }
        }

        for (key, cell_rows) in &cells {
            let condition: Vec<(String, String)> = covs
                .iter()
                .zip(key)
                .map(|(c, k)| (c.to_string(), k.to_string()))
                .collect();
            let suffix = if key.is_empty() {
                String::new()
            } else {
                let parts: Vec<String> = key.iter().map(ToString::to_string).collect();
                format!("({})", parts.join("."))
            };
            let make = |id: String,
                        level: NodeLevel,
                        family: NodeFamily,
                        parent: Option<Parent>,
                        n_trials: usize| Node {
                id,
                param: plan.name.clone(),
                kind: plan.kind.clone(),
                level,
                family,
                condition: condition.clone(),
                parent,
                n_trials,
                instantaneous: plan.instantaneous,
            };

            let group = nodes.len();
            nodes.push(make(
                format!("{}{suffix}", plan.name),
                NodeLevel::Group,
                plan.family,
                None,
                cell_rows.len(),
            ));
            if !plan.hierarchical {
                for &i in cell_rows {
                    assign[pi][i] = Some(group);
                }
                continue;
            }

            let scale = nodes.len();
            nodes.push(make(
                format!("{}_tau{suffix}", plan.name),
                NodeLevel::Scale,
                NodeFamily::Scale,
                None,
                cell_rows.len(),
            ));
            let mut by_subject: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
            for &i in cell_rows {
                by_subject.entry(subjects[i]).or_default().push(i);
            }
            for (s, subj_rows) in by_subject {
                let idx = nodes.len();
                nodes.push(make(
                    format!("{}_subj{suffix}.{s}", plan.name),
                    NodeLevel::Subject(s),
                    plan.family,
                    Some(Parent { mean: group, scale }),
                    subj_rows.len(),
                ));
                for i in subj_rows {
                    assign[pi][i] = Some(idx);
                }
            }
        }
    }

    let mut trials = Vec::with_capacity(rows.len());
    for &i in &rows {
        let mut design = TrialDesign {
            row: i,
            base: [None; 6],
            effects: Vec::new(),
        };
        for (pi, plan) in plans.iter().enumerate() {
            let Some(node) = assign[pi][i] else {
                continue;
            };
            match &plan.kind {
                ParamKind::Base(p) => design.base[p.index()] = Some(node),
                ParamKind::Effect { target, term } => {
                    if let Some(x) = term.value(table, i) {
                        design.effects.push(EffectLink {
                            target: *target,
                            node,
                            x,
                        });
                    }
                }
            }
        }
        trials.push(design);
    }

    let n_subjects = rows
        .iter()
        .map(|&i| subjects[i])
        .collect::<BTreeSet<_>>()
        .len();
    log::debug!(
        "expanded {} into {} nodes over {} trials",
        spec.name,
        nodes.len(),
        trials.len()
    );

    Ok(ExpandedModel {
        name: spec.name.clone(),
        params,
        nodes,
        trials,
        excluded_trials,
        n_subjects,
    })
}
