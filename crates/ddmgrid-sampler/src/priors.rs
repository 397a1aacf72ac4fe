//! Prior densities for every node kind.
//!
//! Group means and variability parameters get fixed informative priors;
//! subject nodes are normal around their group mean with the group scale as
//! standard deviation, truncated at zero for boundary separation and
//! non-decision time.

use statrs::distribution::{Beta, Continuous, Gamma, Normal, Uniform};
use statrs::function::erf::erfc;
use std::f64::consts::{LN_2, SQRT_2};

use ddmgrid_core::{Node, NodeLevel, ParamKind, ParamSymbol, Parent};

/// A fixed prior distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    Normal { mean: f64, sd: f64 },
    HalfNormal { sd: f64 },
    /// Gamma parameterized by its mean and standard deviation.
    Gamma { mean: f64, sd: f64 },
    Beta { alpha: f64, beta: f64 },
    Uniform { lo: f64, hi: f64 },
}

impl Prior {
    /// Log density at `x`; `-inf` outside the support or for a malformed
    /// distribution.
    pub fn ln_pdf(&self, x: f64) -> f64 {
        let lp = match *self {
            Prior::Normal { mean, sd } => Normal::new(mean, sd).ok().map(|d| d.ln_pdf(x)),
            Prior::HalfNormal { sd } => {
                if x < 0.0 {
                    return f64::NEG_INFINITY;
                }
                Normal::new(0.0, sd).ok().map(|d| LN_2 + d.ln_pdf(x))
            }
            Prior::Gamma { mean, sd } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let shape = (mean / sd).powi(2);
                let rate = mean / (sd * sd);
                Gamma::new(shape, rate).ok().map(|d| d.ln_pdf(x))
            }
            Prior::Beta { alpha, beta } => {
                if x <= 0.0 || x >= 1.0 {
                    return f64::NEG_INFINITY;
                }
                Beta::new(alpha, beta).ok().map(|d| d.ln_pdf(x))
            }
            Prior::Uniform { lo, hi } => Uniform::new(lo, hi).ok().map(|d| d.ln_pdf(x)),
        };
        lp.filter(|v| !v.is_nan()).unwrap_or(f64::NEG_INFINITY)
    }
}

/// Priors used for each node kind.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorSet {
    pub a: Prior,
    pub v: Prior,
    pub t: Prior,
    pub sv: Prior,
    pub sz: Prior,
    pub st: Prior,
    pub a_tau: Prior,
    pub v_tau: Prior,
    pub t_tau: Prior,
    pub effect: Prior,
    pub effect_tau: Prior,
}

impl Default for PriorSet {
    fn default() -> Self {
        Self {
            a: Prior::Gamma { mean: 1.5, sd: 0.75 },
            v: Prior::Normal { mean: 2.0, sd: 3.0 },
            t: Prior::Gamma { mean: 0.4, sd: 0.2 },
            sv: Prior::HalfNormal { sd: 2.0 },
            sz: Prior::Beta {
                alpha: 1.0,
                beta: 3.0,
            },
            st: Prior::HalfNormal { sd: 0.3 },
            a_tau: Prior::HalfNormal { sd: 0.1 },
            v_tau: Prior::HalfNormal { sd: 2.0 },
            t_tau: Prior::HalfNormal { sd: 1.0 },
            effect: Prior::Normal { mean: 0.0, sd: 1.0 },
            effect_tau: Prior::HalfNormal { sd: 1.0 },
        }
    }
}

impl PriorSet {
    fn group(&self, p: ParamSymbol) -> Prior {
        match p {
            ParamSymbol::Boundary => self.a,
            ParamSymbol::Drift => self.v,
            ParamSymbol::NonDecision => self.t,
            ParamSymbol::DriftVar => self.sv,
            ParamSymbol::StartVar => self.sz,
            ParamSymbol::NonDecisionVar => self.st,
        }
    }

    fn scale(&self, p: ParamSymbol) -> Prior {
        match p {
            ParamSymbol::Boundary => self.a_tau,
            ParamSymbol::NonDecision => self.t_tau,
            _ => self.v_tau,
        }
    }
}

/// Prior attached to one node of an expanded model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodePrior {
    Fixed(Prior),
    /// Normal around the parent's mean and scale nodes, optionally
    /// truncated below.
    Subject { parent: Parent, lower: Option<f64> },
}

impl NodePrior {
    pub fn for_node(node: &Node, priors: &PriorSet) -> Self {
        if let Some(parent) = node.parent {
            let lower = match node.kind {
                ParamKind::Base(ParamSymbol::Boundary | ParamSymbol::NonDecision) => Some(0.0),
                _ => None,
            };
            return Self::Subject { parent, lower };
        }
        let prior = match (&node.kind, node.level) {
            (ParamKind::Base(p), NodeLevel::Scale) => priors.scale(*p),
            (ParamKind::Effect { .. }, NodeLevel::Scale) => priors.effect_tau,
            (ParamKind::Base(p), _) => priors.group(*p),
            (ParamKind::Effect { .. }, _) => priors.effect,
        };
        Self::Fixed(prior)
    }

    /// Log density of `values[node]` given the current state.
    pub fn ln_pdf(&self, x: f64, values: &[f64]) -> f64 {
        match *self {
            NodePrior::Fixed(p) => p.ln_pdf(x),
            NodePrior::Subject { parent, lower } => {
                truncated_normal_ln_pdf(x, values[parent.mean], values[parent.scale], lower)
            }
        }
    }
}

/// Standard normal CDF.
fn phi(z: f64) -> f64 {
    0.5 * erfc(-z / SQRT_2)
}

/// Log density of a normal truncated to `[lower, inf)`.
pub fn truncated_normal_ln_pdf(x: f64, mean: f64, sd: f64, lower: Option<f64>) -> f64 {
    if sd.is_nan() || sd <= 0.0 || sd.is_infinite() {
        return f64::NEG_INFINITY;
    }
    let Ok(normal) = Normal::new(mean, sd) else {
        return f64::NEG_INFINITY;
    };
    match lower {
        None => normal.ln_pdf(x),
        Some(lo) if x < lo => f64::NEG_INFINITY,
        Some(lo) => {
            let mass = 1.0 - phi((lo - mean) / sd);
            if mass <= 0.0 {
                f64::NEG_INFINITY
            } else {
                normal.ln_pdf(x) - mass.ln()
            }
        }
    }
}
