//! Declarative model specifications.
//!
//! A [`ModelSpec`] names a dataset, which DDM parameters are split over
//! which categorical covariates (`depends_on`), which parameters are
//! regressed on continuous covariates (`effects_on`), and which optional
//! latent parameters are left out. Specs are cheap to clone: the trial table
//! is shared behind an `Arc`.
//!
//! The spec's `name` is derived from its content, so two specs share a name
//! exactly when they describe the same model on the same dataset label.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DdmError;
use crate::table::TrialTable;

/// The fixed DDM parameter vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParamSymbol {
    /// Boundary separation `a`.
    #[serde(rename = "a")]
    Boundary,
    /// Drift rate `v`.
    #[serde(rename = "v")]
    Drift,
    /// Non-decision time `t`.
    #[serde(rename = "t")]
    NonDecision,
    /// Inter-trial drift variability `V`.
    #[serde(rename = "V")]
    DriftVar,
    /// Inter-trial starting-point variability `Z`.
    #[serde(rename = "Z")]
    StartVar,
    /// Inter-trial non-decision variability `T`.
    #[serde(rename = "T")]
    NonDecisionVar,
}

impl ParamSymbol {
    pub const ALL: [ParamSymbol; 6] = [
        Self::Boundary,
        Self::Drift,
        Self::NonDecision,
        Self::DriftVar,
        Self::StartVar,
        Self::NonDecisionVar,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Boundary => "a",
            Self::Drift => "v",
            Self::NonDecision => "t",
            Self::DriftVar => "V",
            Self::StartVar => "Z",
            Self::NonDecisionVar => "T",
        }
    }

    /// Position in [`ParamSymbol::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// `a`, `v` and `t` cannot be excluded.
    pub fn is_mandatory(self) -> bool {
        matches!(self, Self::Boundary | Self::Drift | Self::NonDecision)
    }
}

impl fmt::Display for ParamSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for ParamSymbol {
    type Err = DdmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.symbol() == s)
            .ok_or_else(|| DdmError::invalid_spec(format!("unknown parameter symbol '{s}'")))
    }
}

/// Whether the optional latent parameters are instantiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[default]
    Simple,
    Full,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => f.write_str("simple"),
            Self::Full => f.write_str("full"),
        }
    }
}

/// Name of the effect coefficient of `covariate` on `target`.
pub fn effect_param(covariate: &str, target: &str) -> String {
    format!("e_{covariate}_{target}")
}

/// Name of the interaction coefficient of two covariates on `target`.
pub fn interaction_param(first: &str, second: &str, target: &str) -> String {
    format!("e_inter_{first}_{second}_{target}")
}

/// A declarative hierarchical DDM description bound to one dataset.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Unique, content-derived identifier.
    pub name: String,
    /// Short label of the dataset (e.g. `combined`).
    pub dataset_name: String,
    pub dataset: Arc<TrialTable>,
    /// Target parameter → covariates regressed onto it (one or two).
    pub effects_on: BTreeMap<String, Vec<String>>,
    /// Parameter or effect node → categorical covariates it is split over.
    pub depends_on: BTreeMap<String, Vec<String>>,
    pub model_type: ModelType,
    /// Optional parameter symbols to omit. Kept as raw strings so unknown
    /// symbols can be reported at expansion time.
    pub exclude: BTreeSet<String>,
    pub use_root_for_effects: bool,
    /// Effect covariates whose coefficients are left out of joint
    /// adaptive proposals.
    pub instantaneous: BTreeSet<String>,
}

impl ModelSpec {
    pub fn new(dataset_name: &str, dataset: Arc<TrialTable>) -> Self {
        let mut spec = Self {
            name: String::new(),
            dataset_name: dataset_name.to_string(),
            dataset,
            effects_on: BTreeMap::new(),
            depends_on: BTreeMap::new(),
            model_type: ModelType::Simple,
            exclude: BTreeSet::new(),
            use_root_for_effects: false,
            instantaneous: BTreeSet::new(),
        };
        spec.refresh_name();
        spec
    }

    pub fn effects(mut self, target: &str, covariates: &[&str]) -> Self {
        self.effects_on
            .insert(target.to_string(), covariates.iter().map(|s| s.to_string()).collect());
        self.refresh_name();
        self
    }

    pub fn depends(mut self, key: &str, covariates: &[&str]) -> Self {
        self.depends_on
            .insert(key.to_string(), covariates.iter().map(|s| s.to_string()).collect());
        self.refresh_name();
        self
    }

    pub fn full(mut self) -> Self {
        self.model_type = ModelType::Full;
        self.refresh_name();
        self
    }

    pub fn exclude(mut self, symbols: &[&str]) -> Self {
        self.exclude.extend(symbols.iter().map(|s| s.to_string()));
        self.refresh_name();
        self
    }

    pub fn root_effects(mut self, on: bool) -> Self {
        self.use_root_for_effects = on;
        self.refresh_name();
        self
    }

    pub fn instantaneous(mut self, covariate: &str) -> Self {
        self.instantaneous.insert(covariate.to_string());
        self.refresh_name();
        self
    }

    /// Replace the dataset while keeping every other setting.
    pub fn with_dataset(mut self, dataset_name: &str, dataset: Arc<TrialTable>) -> Self {
        self.dataset_name = dataset_name.to_string();
        self.dataset = dataset;
        self.refresh_name();
        self
    }

    fn refresh_name(&mut self) {
        self.name = self.canonical_name();
    }

    /// Deterministic name built from every field that shapes the model:
    /// `<dataset>__<type>__eff-<..>__dep-<..>__ex-<..>__<root|subj>[__inst-<..>]`.
    pub fn canonical_name(&self) -> String {
        let mapping = |m: &BTreeMap<String, Vec<String>>| {
            if m.is_empty() {
                "none".to_string()
            } else {
                m.iter()
                    .map(|(k, v)| format!("{k}={}", v.join("+")))
                    .collect::<Vec<_>>()
                    .join(",")
            }
        };
        let set = |s: &BTreeSet<String>| {
            if s.is_empty() {
                "none".to_string()
            } else {
                s.iter().cloned().collect::<Vec<_>>().join("+")
            }
        };
        let mut name = format!(
            "{}__{}__eff-{}__dep-{}__ex-{}__{}",
            self.dataset_name,
            self.model_type,
            mapping(&self.effects_on),
            mapping(&self.depends_on),
            set(&self.exclude),
            if self.use_root_for_effects { "root" } else { "subj" },
        );
        if !self.instantaneous.is_empty() {
            name.push_str("__inst-");
            name.push_str(&set(&self.instantaneous));
        }
        name
    }

    /// Every covariate column the model reads besides the behavioral ones.
    pub fn covariates(&self) -> BTreeSet<&str> {
        self.effects_on
            .values()
            .chain(self.depends_on.values())
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Serializable description without the trial data.
    pub fn summary(&self) -> SpecSummary {
        SpecSummary {
            name: self.name.clone(),
            dataset: self.dataset_name.clone(),
            n_trials: self.dataset.len(),
            effects_on: self.effects_on.clone(),
            depends_on: self.depends_on.clone(),
            model_type: self.model_type,
            exclude: self.exclude.clone(),
            use_root_for_effects: self.use_root_for_effects,
            instantaneous: self.instantaneous.clone(),
        }
    }
}

/// Data-free view of a [`ModelSpec`], persisted next to its trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecSummary {
    pub name: String,
    pub dataset: String,
    pub n_trials: usize,
    pub effects_on: BTreeMap<String, Vec<String>>,
    pub depends_on: BTreeMap<String, Vec<String>>,
    pub model_type: ModelType,
    pub exclude: BTreeSet<String>,
    pub use_root_for_effects: bool,
    #[serde(default)]
    pub instantaneous: BTreeSet<String>,
}
