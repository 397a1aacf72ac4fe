//! Named datasets used by the model grids.
//!
//! The catalog loads the confidence-annotated studies, the Parkinson's
//! dataset (whole, with signed treatment flags, and split by stimulation
//! state), and a combined two-study table with a `group` column.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::derived::{DerivedConfig, add_derived_fields};
use crate::error::{DdmError, Result};
use crate::loader::{Layout, LoaderConfig, load_file, remove_outliers};
use crate::table::TrialTable;

/// Column added to the combined dataset (0 = first study, 1 = second).
pub const GROUP: &str = "group";

/// The unsplit Parkinson's dataset. Only the treatment grid uses it.
pub const PD: &str = "pd";

/// File names of the catalog sources, relative to the data directory.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub diss: PathBuf,
    pub sen: PathBuf,
    pub easy: PathBuf,
    pub pd: PathBuf,
    /// Treatment flag used to split the Parkinson's dataset.
    pub pd_flag: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            diss: "DissData_P01.csv".into(),
            sen: "DBSC_N15_P03.csv".into(),
            easy: "DBSC_N15_EASY.csv".into(),
            pd: "PD_PS.csv".into(),
            pd_flag: "dbs".to_string(),
        }
    }
}

/// Ordered collection of named trial tables.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<(String, Arc<TrialTable>)>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a dataset, keeping first-insertion order.
    pub fn insert(&mut self, name: &str, table: TrialTable) {
        let table = Arc::new(table);
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = table,
            None => self.entries.push((name.to_string(), table)),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<TrialTable>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| Arc::clone(t))
            .ok_or_else(|| DdmError::invalid_spec(format!("unknown dataset '{name}'")))
    }

    pub fn entries(&self) -> &[(String, Arc<TrialTable>)] {
        &self.entries
    }

    /// Datasets the exploratory grids enumerate: every entry except the
    /// unsplit Parkinson's table.
    pub fn grid_entries(&self) -> Vec<(String, Arc<TrialTable>)> {
        self.entries
            .iter()
            .filter(|(n, _)| n != PD)
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Median splits are taken over every trial; the reaction-time floor
/// applies afterwards.
fn load_confidence(path: &Path, derived: &DerivedConfig) -> Result<TrialTable> {
    let config = LoaderConfig::confidence();
    let unfiltered = LoaderConfig {
        outlier_floor: None,
        ..config.clone()
    };
    let table = load_file(path, &Layout::confidence(), &unfiltered)?;
    let table = add_derived_fields(table, derived)?;
    match config.outlier_floor {
        Some(floor) => remove_outliers(&table, floor),
        None => Ok(table),
    }
}

/// Subset of `table` where `flag == value`, with subjects renumbered.
pub fn split_by_flag(table: &TrialTable, flag: &str, value: i64) -> Result<TrialTable> {
    let mut part = table.filter_eq(flag, value)?;
    part.reindex_subjects()?;
    Ok(part)
}

/// Load every catalog dataset from `dir`.
///
/// Order: `diss`, `sen`, `easy`, `pd`, `pd_dbs_off`, `pd_dbs_on`,
/// `combined`.
pub fn load_catalog(dir: &Path, config: &CatalogConfig) -> Result<Catalog> {
    let derived = DerivedConfig::default();
    let diss = load_confidence(&dir.join(&config.diss), &derived)?;
    let sen = load_confidence(&dir.join(&config.sen), &derived)?;
    let easy = load_confidence(&dir.join(&config.easy), &derived)?;

    let pd = load_file(
        &dir.join(&config.pd),
        &Layout::from_header(),
        &LoaderConfig {
            treatment_flag: Some(config.pd_flag.clone()),
            ..LoaderConfig::passthrough()
        },
    )?;
    let pd = add_derived_fields(pd, &derived)?;
    let pd_off = split_by_flag(&pd, &config.pd_flag, 0)?;
    let pd_on = split_by_flag(&pd, &config.pd_flag, 1)?;

    let combined = TrialTable::stack_groups(&[diss.clone(), sen.clone()], GROUP)?;

    let mut catalog = Catalog::new();
    catalog.insert("diss", diss);
    catalog.insert("sen", sen);
    catalog.insert("easy", easy);
    catalog.insert(PD, pd);
    catalog.insert(&format!("pd_{}_off", config.pd_flag), pd_off);
    catalog.insert(&format!("pd_{}_on", config.pd_flag), pd_on);
    catalog.insert("combined", combined);

    for (name, table) in catalog.entries() {
        log::info!(
            "dataset {name}: {} trials, {} subjects",
            table.len(),
            table.subject_ids()?.len()
        );
    }
    Ok(catalog)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::derived::RT_SPLIT;
    use std::fs;

    /// Confidence-family csv: two subjects, codes for stim and conf.
    pub(crate) const CONF_CSV: &str = "\
subj_idx,stim,rt,response,theta,conf
0,1,0.55,1,0.2,1
0,2,0.81,0,-0.4,2
0,3,0.62,1,1.3,1
0,1,0.30,1,0.9,2
0,2,1.40,1,-1.1,1
1,1,0.72,1,0.5,1
1,3,0.95,0,-0.2,2
1,2,0.66,1,0.8,1
1,1,1.10,1,-0.7,2
";

    pub(crate) const PD_CSV: &str = "\
subj_idx,stim,rt,response,theta,conf,dbs
0,WW,0.61,1,0.1,HC,0
0,LL,0.92,0,0.4,LC,1
0,WL,0.75,1,-0.3,HC,0
0,WW,0.84,1,0.2,LC,1
1,LL,0.66,1,-0.5,HC,0
1,WL,1.05,0,0.7,LC,1
1,WW,0.71,1,0.3,HC,1
1,LL,0.58,0,-0.1,LC,0
";

    pub(crate) fn write_catalog_dir(dir: &Path) {
        let config = CatalogConfig::default();
        for f in [&config.diss, &config.sen, &config.easy] {
            fs::write(dir.join(f), CONF_CSV).unwrap();
        }
        fs::write(dir.join(&config.pd), PD_CSV).unwrap();
    }

    #[test]
    fn test_load_catalog_order_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog_dir(dir.path());
        let catalog = load_catalog(dir.path(), &CatalogConfig::default()).unwrap();
        assert_eq!(
            catalog.names(),
            vec!["diss", "sen", "easy", "pd", "pd_dbs_off", "pd_dbs_on", "combined"]
        );
        let grid_names: Vec<String> = catalog.grid_entries().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            grid_names,
            vec!["diss", "sen", "easy", "pd_dbs_off", "pd_dbs_on", "combined"]
        );

        let diss = catalog.get("diss").unwrap();
        // One trial at 0.30 s falls under the default floor.
        assert_eq!(diss.len(), 8);
        assert_eq!(diss.levels("stim").unwrap(), vec!["LL", "WL", "WW"]);
        assert_eq!(diss.levels("conf").unwrap(), vec!["HC", "LC"]);
        assert!(diss.has_column("conf_effect"));
        assert!(diss.has_column("theta_split"));
    }

    #[test]
    fn test_combined_has_disjoint_subjects() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog_dir(dir.path());
        let catalog = load_catalog(dir.path(), &CatalogConfig::default()).unwrap();
        let combined = catalog.get("combined").unwrap();
        assert_eq!(combined.len(), 16);
        assert_eq!(combined.subject_ids().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(combined.levels(GROUP).unwrap(), vec!["0", "1"]);
        combined.validate(Some(0.4)).unwrap();
    }

    #[test]
    fn test_pd_split_by_flag() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog_dir(dir.path());
        let catalog = load_catalog(dir.path(), &CatalogConfig::default()).unwrap();
        let off = catalog.get("pd_dbs_off").unwrap();
        let on = catalog.get("pd_dbs_on").unwrap();
        assert_eq!(off.len() + on.len(), 8);
        assert!(off.ints("dbs").unwrap().iter().all(|&d| d == 0));
        assert!(on.ints("dbs").unwrap().iter().all(|&d| d == 1));

        let pd = catalog.get(PD).unwrap();
        assert_eq!(pd.len(), 8);
        assert_eq!(pd.ints("dbs_effect").unwrap()[..2], [-1, 1]);
        assert_eq!(pd.ints("dbs_effect_inv").unwrap()[..2], [1, -1]);
        assert_eq!(pd.ints("dbs_inv").unwrap()[..2], [1, 0]);
    }

    #[test]
    fn test_splits_use_trials_below_floor() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog_dir(dir.path());
        let catalog = load_catalog(dir.path(), &CatalogConfig::default()).unwrap();
        let diss = catalog.get("diss").unwrap();
        assert!(diss.rts().unwrap().iter().all(|&rt| rt > 0.4));
        // Subject 0's median rt over all five trials is 0.62, so the 0.62
        // trial is slow. Without the 0.30 trial the median would be 0.715.
        let rts = diss.rts().unwrap();
        let row = rts.iter().position(|&rt| rt == 0.62).unwrap();
        assert_eq!(
            diss.labels(RT_SPLIT).unwrap()[row].as_deref(),
            Some("slow")
        );
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_catalog(dir.path(), &CatalogConfig::default()).unwrap_err();
        assert!(matches!(err, DdmError::Io { .. }));
    }

    #[test]
    fn test_unknown_dataset() {
        assert!(Catalog::new().get("nope").is_err());
    }
}
