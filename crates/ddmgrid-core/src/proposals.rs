//! Proposal-scale tuning by node family.
//!
//! Families are assigned during expansion, so tuning is a lookup on
//! [`Node::family`](crate::expand::Node) rather than a match on node names.

use std::collections::BTreeMap;

use crate::error::DdmError;
use crate::expand::{ExpandedModel, NodeFamily};

/// Random-walk step sizes per family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyScales {
    pub tau: f64,
    pub effect: f64,
    pub a: f64,
    pub v: f64,
}

impl Default for FamilyScales {
    fn default() -> Self {
        Self {
            tau: 0.1,
            effect: 0.01,
            a: 0.5,
            v: 0.5,
        }
    }
}

impl FamilyScales {
    pub fn step_for(&self, family: NodeFamily) -> Option<f64> {
        match family {
            NodeFamily::Scale => Some(self.tau),
            NodeFamily::Effect => Some(self.effect),
            NodeFamily::Boundary => Some(self.a),
            NodeFamily::Drift => Some(self.v),
            NodeFamily::Other => None,
        }
    }
}

/// Proposal tuning mode.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ProposalTuning {
    /// Engine defaults for every node.
    #[default]
    Off,
    Fixed(FamilyScales),
    /// Joint adaptive proposals over each effect parameter's nodes.
    Adaptive { initial_sd: f64 },
}

impl std::str::FromStr for ProposalTuning {
    type Err = DdmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(Self::Off),
            "fixed" => Ok(Self::Fixed(FamilyScales::default())),
            "adaptive" => Ok(Self::Adaptive { initial_sd: 0.5 }),
            other => Err(DdmError::invalid_spec(format!(
                "unknown proposal tuning '{other}'"
            ))),
        }
    }
}

/// Nodes updated together by one adaptive proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveBlock {
    pub param: String,
    pub nodes: Vec<usize>,
    pub initial_sd: f64,
}

/// Per-node proposal assignment handed to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProposalPlan {
    /// Step size per node; `None` (or a missing entry) means engine default.
    pub steps: Vec<Option<f64>>,
    pub blocks: Vec<AdaptiveBlock>,
}

impl ProposalPlan {
    pub fn step(&self, node: usize) -> Option<f64> {
        self.steps.get(node).copied().flatten()
    }

    /// Whether `node` belongs to an adaptive block.
    pub fn in_block(&self, node: usize) -> bool {
        self.blocks.iter().any(|b| b.nodes.contains(&node))
    }
}

/// Assign proposals to every node of `model`.
pub fn plan_proposals(model: &ExpandedModel, tuning: &ProposalTuning) -> ProposalPlan {
    match tuning {
        ProposalTuning::Off => ProposalPlan::default(),
        ProposalTuning::Fixed(scales) => ProposalPlan {
            steps: model.nodes.iter().map(|n| scales.step_for(n.family)).collect(),
            blocks: Vec::new(),
        },
        ProposalTuning::Adaptive { initial_sd } => {
            let mut by_param: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
            for (i, node) in model.nodes_in_family(NodeFamily::Effect) {
                if node.instantaneous {
                    continue;
                }
                by_param.entry(node.param.as_str()).or_default().push(i);
            }
            let blocks: Vec<AdaptiveBlock> = by_param
                .into_iter()
                .map(|(param, nodes)| AdaptiveBlock {
                    param: param.to_string(),
                    nodes,
                    initial_sd: *initial_sd,
                })
                .collect();
            log::debug!("{}: {} adaptive effect blocks", model.name, blocks.len());
            ProposalPlan {
                steps: Vec::new(),
                blocks,
            }
        }
    }
}
