//! Batch model grids.
//!
//! Each builder is a pure function from datasets to an ordered `Vec` of
//! specs. Enumeration order is fixed by nested loops over the option
//! vectors, in the order documented on each builder, so re-running a builder
//! reproduces the same grid. Names are content-derived; exact duplicates are
//! dropped, which makes every returned name unique.

use std::collections::HashSet;
use std::sync::Arc;

use crate::catalog::{Catalog, GROUP, PD};
use crate::error::Result;
use crate::spec::{ModelSpec, effect_param, interaction_param};
use crate::table::{CONF, STIM, THETA, TrialTable};

/// Axes of the exploratory grid.
///
/// The default is the subject-scoped grid; [`GridOptions::rooted`] is the
/// root-scoped one, which also splits `a` by stimulus in the covariate-pair
/// models.
#[derive(Debug, Clone)]
pub struct GridOptions {
    /// Also enumerate full models over `excludes`.
    pub full: bool,
    pub use_root_for_effects: bool,
    /// Add the `a`-by-stimulus variant to the covariate-pair models too.
    pub pair_stim_variants: bool,
    /// Continuous covariate every model regresses on.
    pub covariate: String,
    /// Parameters receiving the covariate effect.
    pub effect_targets: Vec<String>,
    /// Categorical covariates drift is split over.
    pub drift_covariates: Vec<String>,
    /// Splits of the covariate's effect coefficient.
    pub effect_splits: Vec<Vec<String>>,
    /// Second covariates paired with the main one.
    pub pair_covariates: Vec<String>,
    pub excludes: Vec<Vec<String>>,
    /// 0/1 treatment flag whose derived indicators the treatment grid
    /// crosses with the covariate.
    pub treatment_flag: String,
}

impl Default for GridOptions {
    fn default() -> Self {
        let strings = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            full: false,
            use_root_for_effects: false,
            pair_stim_variants: false,
            covariate: THETA.to_string(),
            effect_targets: strings(&["a"]),
            drift_covariates: strings(&["conf"]),
            effect_splits: vec![strings(&[STIM]), strings(&["conf"])],
            pair_covariates: strings(&["conf_effect", "LL_effect", "WW_effect"]),
            excludes: vec![
                strings(&["T"]),
                strings(&["Z"]),
                strings(&["T", "Z"]),
                Vec::new(),
            ],
            treatment_flag: "dbs".to_string(),
        }
    }
}

impl GridOptions {
    /// Root-scoped effect coefficients with stimulus variants on every
    /// model.
    pub fn rooted() -> Self {
        Self {
            use_root_for_effects: true,
            pair_stim_variants: true,
            ..Default::default()
        }
    }
}

fn strs(v: &[String]) -> Vec<&str> {
    v.iter().map(String::as_str).collect()
}

/// Drop specs whose name was already produced, keeping the first.
fn dedup(specs: Vec<ModelSpec>) -> Vec<ModelSpec> {
    let mut seen = HashSet::new();
    let before = specs.len();
    let out: Vec<ModelSpec> = specs
        .into_iter()
        .filter(|s| seen.insert(s.name.clone()))
        .collect();
    if out.len() < before {
        log::debug!("grid: dropped {} duplicate specs", before - out.len());
    }
    out
}

/// The exploratory grid over every dataset.
///
/// Axis order: dataset → effect target → (effect split → drift covariate →
/// {plain, `a` split by stimulus}) → (drift covariate → pair covariate →
/// pair variants) → when `full`: exclusion set → (pair covariate → pair
/// variants) → (effect split, full single-covariate model). Pair variants
/// are {plain} or, with `pair_stim_variants`, {plain, `a` split by
/// stimulus}.
pub fn build_grid(datasets: &[(String, Arc<TrialTable>)], options: &GridOptions) -> Vec<ModelSpec> {
    let cov = options.covariate.as_str();
    let mut specs = Vec::new();

    for (name, data) in datasets {
        let base = ModelSpec::new(name, Arc::clone(data)).root_effects(options.use_root_for_effects);
        for target in &options.effect_targets {
            let e_cov = effect_param(cov, target);
            let stim_variants = |s: ModelSpec| vec![s.clone(), s.depends("a", &[STIM])];
            let pair_variants = |s: ModelSpec| {
                if options.pair_stim_variants {
                    stim_variants(s)
                } else {
                    vec![s]
                }
            };

            for split in &options.effect_splits {
                for v_on in &options.drift_covariates {
                    let s = base
                        .clone()
                        .effects(target, &[cov])
                        .depends("v", &[v_on.as_str()])
                        .depends(&e_cov, &strs(split));
                    specs.extend(stim_variants(s));
                }
            }

            for v_on in &options.drift_covariates {
                for pair in &options.pair_covariates {
                    let s = base
                        .clone()
                        .effects(target, &[cov, pair.as_str()])
                        .depends("v", &[v_on.as_str()]);
                    specs.extend(pair_variants(s));
                }
            }

            if !options.full {
                continue;
            }
            for exclude in &options.excludes {
                let full = base.clone().full().exclude(&strs(exclude));
                for v_on in &options.drift_covariates {
                    for pair in &options.pair_covariates {
                        let s = full
                            .clone()
                            .effects(target, &[cov, pair.as_str()])
                            .depends("v", &[v_on.as_str()]);
                        specs.extend(pair_variants(s));
                    }
                }
                for split in &options.effect_splits {
                    specs.push(
                        full.clone()
                            .effects(target, &[cov])
                            .depends(&e_cov, &strs(split)),
                    );
                }
            }
        }
    }
    dedup(specs)
}

/// The four-model grid run from the command line: two combined-study
/// models (without and with a group-split interaction coefficient) and one
/// model per stimulation state of the Parkinson's dataset.
pub fn combined_grid(catalog: &Catalog) -> Result<Vec<ModelSpec>> {
    let main = effect_param(THETA, "a");
    let conf = effect_param("conf_effect", "a");
    let inter = interaction_param(THETA, "conf_effect", "a");

    let template = |name: &str, data: Arc<TrialTable>| {
        ModelSpec::new(name, data)
            .effects("a", &[THETA, "conf_effect"])
            .root_effects(true)
            .full()
            .exclude(&["Z", "T"])
    };

    let combined = template("combined", catalog.get("combined")?)
        .depends("v", &[STIM, GROUP])
        .depends("a", &[GROUP])
        .depends("t", &[GROUP])
        .depends(&main, &[GROUP])
        .depends(&conf, &[GROUP])
        .depends("V", &[GROUP]);
    let with_inter = combined.clone().depends(&inter, &[GROUP]);

    let specs = vec![
        combined,
        with_inter,
        template("dbs_on", catalog.get("pd_dbs_on")?).depends("v", &[STIM]),
        template("dbs_off", catalog.get("pd_dbs_off")?).depends("v", &[STIM]),
    ];
    Ok(dedup(specs))
}

/// One full model per non-combined dataset, for correlating the covariate
/// effect across studies.
pub fn correlation_grid(catalog: &Catalog) -> Vec<ModelSpec> {
    let specs = catalog
        .entries()
        .iter()
        .filter(|(name, _)| name != "combined" && name != PD)
        .map(|(name, data)| {
            ModelSpec::new(name, Arc::clone(data))
                .effects("a", &[THETA, "conf_effect"])
                .depends("v", &[STIM])
                .full()
                .exclude(&["T", "Z"])
        })
        .collect();
    dedup(specs)
}

/// Treatment models on the Parkinson's dataset.
///
/// For each indicator derived from `flag` (raw, signed, inverted, signed
/// inverted) the covariate effect on `a` is paired with the indicator and
/// both the main and interaction coefficients are split by confidence,
/// first with drift split by stimulus, then without. Two single-covariate
/// models on the off and on subsets follow.
pub fn pd_grid(catalog: &Catalog, flag: &str) -> Result<Vec<ModelSpec>> {
    let pd = catalog.get(PD)?;
    let main = effect_param(THETA, "a");
    let indicators = [
        flag.to_string(),
        format!("{flag}_effect"),
        format!("{flag}_inv"),
        format!("{flag}_effect_inv"),
    ];

    let mut specs = Vec::new();
    for indicator in &indicators {
        let inter = interaction_param(THETA, indicator, "a");
        let s = ModelSpec::new(PD, Arc::clone(&pd))
            .effects("a", &[THETA, indicator.as_str()])
            .depends(&main, &[CONF])
            .depends(&inter, &[CONF]);
        specs.push(s.clone().depends("v", &[STIM]));
        specs.push(s);
    }
    for state in ["off", "on"] {
        let name = format!("{PD}_{flag}_{state}");
        specs.push(
            ModelSpec::new(&name, catalog.get(&name)?)
                .effects("a", &[THETA])
                .depends("v", &[STIM])
                .depends(&main, &[CONF]),
        );
    }
    Ok(dedup(specs))
}

/// Which grid to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridKind {
    #[default]
    Combined,
    /// Exploratory grid with subject-scoped effects.
    Nodbs,
    /// Exploratory grid with root-scoped effects.
    Rooted,
    Correlation,
    Pd,
}

impl GridKind {
    /// Build the grid. The exploratory kinds take their axes from
    /// `options`; `Rooted` switches on root scoping and pair variants.
    pub fn build(self, catalog: &Catalog, options: &GridOptions) -> Result<Vec<ModelSpec>> {
        match self {
            Self::Combined => combined_grid(catalog),
            Self::Nodbs => Ok(build_grid(&catalog.grid_entries(), options)),
            Self::Rooted => {
                let rooted = GridOptions {
                    use_root_for_effects: true,
                    pair_stim_variants: true,
                    ..options.clone()
                };
                Ok(build_grid(&catalog.grid_entries(), &rooted))
            }
            Self::Correlation => Ok(correlation_grid(catalog)),
            Self::Pd => pd_grid(catalog, &options.treatment_flag),
        }
    }
}

impl std::str::FromStr for GridKind {
    type Err = crate::error::DdmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "combined" => Ok(Self::Combined),
            "nodbs" => Ok(Self::Nodbs),
            "rooted" => Ok(Self::Rooted),
            "correlation" | "corr" => Ok(Self::Correlation),
            "pd" => Ok(Self::Pd),
            other => Err(crate::error::DdmError::invalid_spec(format!(
                "unknown grid '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::write_catalog_dir;
    use crate::catalog::{CatalogConfig, load_catalog};
    use crate::expand::expand;

    fn catalog() -> Catalog {
        let dir = tempfile::tempdir().unwrap();
        write_catalog_dir(dir.path());
        load_catalog(dir.path(), &CatalogConfig::default()).unwrap()
    }

    fn assert_unique(specs: &[ModelSpec]) {
        let names: HashSet<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), specs.len());
    }

    #[test]
    fn test_build_grid_counts() {
        let c = catalog();
        let datasets = c.grid_entries();
        assert_eq!(datasets.len(), 6);

        let simple = build_grid(&datasets, &GridOptions::default());
        // Per dataset: 2 splits × 2 variants + 3 pairs.
        assert_eq!(simple.len(), 6 * 7);
        assert_unique(&simple);
        assert!(simple.iter().all(|s| !s.use_root_for_effects));

        let full = build_grid(
            &datasets,
            &GridOptions {
                full: true,
                ..Default::default()
            },
        );
        // Plus 4 exclusion sets × (3 pairs + 2 splits).
        assert_eq!(full.len(), 6 * (7 + 4 * 5));
        assert_unique(&full);
    }

    #[test]
    fn test_rooted_grid_counts() {
        let c = catalog();
        let datasets = c.grid_entries();
        let simple = build_grid(&datasets, &GridOptions::rooted());
        // Per dataset: 2 splits × 2 variants + 3 pairs × 2 variants.
        assert_eq!(simple.len(), 6 * 10);
        assert_unique(&simple);
        assert!(simple.iter().all(|s| s.use_root_for_effects));

        let full = build_grid(
            &datasets,
            &GridOptions {
                full: true,
                ..GridOptions::rooted()
            },
        );
        // Plus 4 exclusion sets × (3 pairs × 2 variants + 2 splits).
        assert_eq!(full.len(), 6 * (10 + 4 * 8));
        assert_unique(&full);

        let via_kind = GridKind::Rooted.build(&c, &GridOptions::default()).unwrap();
        assert_eq!(via_kind.len(), 6 * 10);
    }

    #[test]
    fn test_pd_grid() {
        let c = catalog();
        let specs = pd_grid(&c, "dbs").unwrap();
        assert_eq!(specs.len(), 10);
        assert_unique(&specs);
        for indicator in ["dbs", "dbs_effect", "dbs_inv", "dbs_effect_inv"] {
            let inter = interaction_param(THETA, indicator, "a");
            let uses: Vec<_> = specs
                .iter()
                .filter(|s| s.depends_on.contains_key(&inter))
                .collect();
            assert_eq!(uses.len(), 2, "{indicator}");
            assert!(uses.iter().all(|s| s.dataset_name == PD));
        }
        assert_eq!(specs[8].dataset_name, "pd_dbs_off");
        assert_eq!(specs[9].dataset_name, "pd_dbs_on");
        for spec in &specs {
            let m = expand(spec).unwrap_or_else(|e| panic!("{}: {e}", spec.name));
            assert!(m.nodes.iter().any(|n| n.param == "e_theta_a"));
        }
        assert!(pd_grid(&c, "stim_flag").is_err());
    }

    #[test]
    fn test_build_grid_deterministic() {
        let c = catalog();
        let opts = GridOptions {
            full: true,
            ..Default::default()
        };
        let one: Vec<_> = build_grid(&c.grid_entries(), &opts).into_iter().map(|s| s.name).collect();
        let two: Vec<_> = build_grid(&c.grid_entries(), &opts).into_iter().map(|s| s.name).collect();
        assert_eq!(one, two);
        assert!(one[0].starts_with("diss__"));
    }

    #[test]
    fn test_duplicate_axes_collapse() {
        let c = catalog();
        let opts = GridOptions {
            drift_covariates: vec!["conf".into(), "conf".into()],
            ..Default::default()
        };
        let specs = build_grid(&c.grid_entries(), &opts);
        assert_eq!(specs.len(), 6 * 7);
    }

    #[test]
    fn test_grid_specs_expand() {
        let c = catalog();
        let opts = GridOptions {
            full: true,
            ..Default::default()
        };
        for spec in build_grid(&c.grid_entries()[..1], &opts) {
            expand(&spec).unwrap_or_else(|e| panic!("{}: {e}", spec.name));
        }
    }

    #[test]
    fn test_combined_grid() {
        let c = catalog();
        let specs = combined_grid(&c).unwrap();
        assert_eq!(specs.len(), 4);
        assert_unique(&specs);
        assert_eq!(specs[0].dataset_name, "combined");
        assert!(specs[1].depends_on.contains_key("e_inter_theta_conf_effect_a"));
        for spec in &specs {
            let m = expand(spec).unwrap();
            assert!(m.find("T").is_none());
            assert!(m.find("Z").is_none());
        }
        let m = expand(&specs[0]).unwrap();
        assert!(m.find("V(0)").is_some());
        assert!(m.find("e_theta_a(1)").is_some());
    }

    #[test]
    fn test_correlation_grid_skips_combined() {
        let c = catalog();
        let specs = correlation_grid(&c);
        assert_eq!(specs.len(), 5);
        assert!(specs.iter().all(|s| s.dataset_name != "combined"));
    }

    #[test]
    fn test_grid_kind_parse() {
        assert_eq!("nodbs".parse::<GridKind>().unwrap(), GridKind::Nodbs);
        assert_eq!("rooted".parse::<GridKind>().unwrap(), GridKind::Rooted);
        assert_eq!("pd".parse::<GridKind>().unwrap(), GridKind::Pd);
        assert!("x".parse::<GridKind>().is_err());
    }
}
