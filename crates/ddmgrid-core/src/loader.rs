//! Dataset loading and normalization.
//!
//! Raw trial records arrive in per-subject (and optionally per-treatment)
//! batches of delimited text. Loading stamps dense subject ids, z-scores the
//! physiological covariates within each batch, optionally lags them by one
//! trial, derives signed treatment flags, drops reaction-time outliers and
//! recodes numeric condition codes into labels.
//!
//! # Pipeline
//!
//! ```text
//! batch → stamp subject → drop invalid → z-score → (shift) ─┐
//! batch → ...                                                ├→ concat → flags → outliers → relabel
//! batch → ...                                               ─┘
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{DdmError, Result};
use crate::table::{Column, ColumnKind, RESPONSE, RT, STIM, SUBJECT, THETA, TrialTable};

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

/// Field separator of a delimited source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Whitespace,
    Comma,
}

/// Name and storage kind of one positional column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Fixed column order of a dataset family.
///
/// An empty `columns` list means the header row names the columns and kinds
/// are inferred from the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub columns: Vec<ColumnSpec>,
    pub delimiter: Delimiter,
    pub header: bool,
}

impl Layout {
    /// Behavioral + scalp EEG files: one per subject and stimulation state.
    pub fn scalp() -> Self {
        use ColumnKind::*;
        Self {
            columns: [
                (SUBJECT, Int),
                (STIM, Label),
                (RT, Float),
                (RESPONSE, Float),
                ("prer1", Float),
                ("prer2", Float),
                (THETA, Float),
                ("cue2", Float),
                ("dbs", Int),
            ]
            .iter()
            .map(|&(n, k)| ColumnSpec::new(n, k))
            .collect(),
            delimiter: Delimiter::Whitespace,
            header: false,
        }
    }

    /// Behavioral + intra-operative STN recordings at three depths.
    pub fn intraop() -> Self {
        use ColumnKind::*;
        Self {
            columns: [
                (SUBJECT, Int),
                (STIM, Label),
                (RT, Float),
                (RESPONSE, Float),
                ("vent", Float),
                ("mid", Float),
                ("dors", Float),
            ]
            .iter()
            .map(|&(n, k)| ColumnSpec::new(n, k))
            .collect(),
            delimiter: Delimiter::Whitespace,
            header: false,
        }
    }

    /// Behavioral + confidence + theta, comma-separated with a header row.
    pub fn confidence() -> Self {
        use ColumnKind::*;
        Self {
            columns: [
                (SUBJECT, Int),
                (STIM, Label),
                (RT, Float),
                (RESPONSE, Int),
                (THETA, Float),
                ("conf", Label),
            ]
            .iter()
            .map(|&(n, k)| ColumnSpec::new(n, k))
            .collect(),
            delimiter: Delimiter::Comma,
            header: true,
        }
    }

    /// Comma-separated file whose header names the columns.
    pub fn from_header() -> Self {
        Self {
            columns: Vec::new(),
            delimiter: Delimiter::Comma,
            header: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn split_fields(line: &str, delimiter: Delimiter) -> Vec<String> {
    let strip = |s: &str| s.trim().trim_matches('"').to_string();
    match delimiter {
        Delimiter::Whitespace => line.split_whitespace().map(strip).collect(),
        Delimiter::Comma => line.split(',').map(strip).collect(),
    }
}

fn parse_int(field: &str) -> Option<i64> {
    field.parse::<i64>().ok().or_else(|| {
        let f = field.parse::<f64>().ok()?;
        (f.fract() == 0.0 && f.is_finite()).then_some(f as i64)
    })
}

fn infer_kind(values: &[&str]) -> ColumnKind {
    let present: Vec<&&str> = values.iter().filter(|v| !v.is_empty()).collect();
    if !present.is_empty() && present.iter().all(|v| v.parse::<i64>().is_ok()) {
        ColumnKind::Int
    } else if present.iter().all(|v| v.parse::<f64>().is_ok()) {
        ColumnKind::Float
    } else {
        ColumnKind::Label
    }
}

/// Parse delimited text into a table according to `layout`.
///
/// Blank lines and lines starting with `#` are skipped. Empty label cells
/// become unset; empty float cells become NaN.
pub fn parse_delimited(text: &str, source_name: &str, layout: &Layout) -> Result<TrialTable> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l))
        .filter(|(_, l)| !l.trim().is_empty() && !l.trim_start().starts_with('#'));

    let header: Option<Vec<String>> = if layout.header {
        lines.next().map(|(_, l)| split_fields(l, layout.delimiter))
    } else {
        None
    };

    let rows: Vec<(usize, Vec<String>)> = lines
        .map(|(n, l)| (n, split_fields(l, layout.delimiter)))
        .collect();

    let specs: Vec<ColumnSpec> = if layout.columns.is_empty() {
        let names = header.ok_or_else(|| DdmError::Parse {
            source_name: source_name.to_string(),
            line: 1,
            message: "layout without columns requires a header row".to_string(),
        })?;
        names
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let values: Vec<&str> = rows
                    .iter()
                    .map(|(_, r)| r.get(j).map_or("", String::as_str))
                    .collect();
                ColumnSpec::new(&name.to_lowercase(), infer_kind(&values))
            })
            .collect()
    } else {
        layout.columns.clone()
    };

    let mut columns: Vec<Column> = specs
        .iter()
        .map(|s| match s.kind {
            ColumnKind::Int => Column::Int(Vec::with_capacity(rows.len())),
            ColumnKind::Float => Column::Float(Vec::with_capacity(rows.len())),
            ColumnKind::Label => Column::Label(Vec::with_capacity(rows.len())),
        })
        .collect();

    for (line, fields) in &rows {
        if fields.len() < specs.len() {
            return Err(DdmError::Parse {
                source_name: source_name.to_string(),
                line: *line,
                message: format!("expected {} fields, found {}", specs.len(), fields.len()),
            });
        }
        for ((spec, col), field) in specs.iter().zip(columns.iter_mut()).zip(fields) {
            let bad = |what: &str| DdmError::Parse {
                source_name: source_name.to_string(),
                line: *line,
                message: format!("column '{}': cannot parse '{field}' as {what}", spec.name),
            };
            match col {
                Column::Int(v) => v.push(parse_int(field).ok_or_else(|| bad("int"))?),
                Column::Float(v) if field.is_empty() => v.push(f64::NAN),
                Column::Float(v) => v.push(field.parse().map_err(|_| bad("float"))?),
                Column::Label(v) => v.push((!field.is_empty()).then(|| field.clone())),
            }
        }
    }

    TrialTable::from_columns(
        specs
            .into_iter()
            .map(|s| s.name)
            .zip(columns)
            .collect(),
    )
}

/// Read and parse one delimited file.
pub fn read_table(path: &Path, layout: &Layout) -> Result<TrialTable> {
    let text = std::fs::read_to_string(path).map_err(|e| DdmError::io_at(path, e))?;
    parse_delimited(&text, &path.display().to_string(), layout)
}

/// Bring the behavioral columns to their canonical kinds: integer subject
/// and response, float reaction time, label stimulus.
pub fn coerce_behavioral(table: &mut TrialTable) -> Result<()> {
    if let Column::Float(v) = table.require(RESPONSE)? {
        let ints = v.iter().map(|x| x.round() as i64).collect();
        table.insert_column(RESPONSE, Column::Int(ints))?;
    }
    if let Column::Int(v) = table.require(RT)? {
        let floats = v.iter().map(|&x| x as f64).collect();
        table.insert_column(RT, Column::Float(floats))?;
    }
    if let Column::Int(v) = table.require(STIM)? {
        let labels = v.iter().map(|x| Some(x.to_string())).collect();
        table.insert_column(STIM, Column::Label(labels))?;
    }
    table.subjects()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Relabeling
// ---------------------------------------------------------------------------

/// Recode the raw codes of `source` into labels stored in `target`.
///
/// When `target` does not exist yet it is created as a copy of `source`, so
/// unmapped codes survive unchanged in non-strict mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRule {
    pub target: String,
    pub source: String,
    pub codes: BTreeMap<String, String>,
}

impl LabelRule {
    pub fn new(target: &str, source: &str, codes: &[(&str, &str)]) -> Self {
        Self {
            target: target.to_string(),
            source: source.to_string(),
            codes: codes
                .iter()
                .map(|&(c, l)| (c.to_string(), l.to_string()))
                .collect(),
        }
    }

    /// Stimulus codes shared by every dataset family with numeric stimuli.
    pub fn stimulus() -> Self {
        Self::new(STIM, STIM, &[("1", "WW"), ("2", "LL"), ("3", "WL")])
    }
}

/// Relabel rules for scalp recordings: confidence is derived from the
/// stimulus code before the stimulus itself is renamed.
pub fn scalp_rules() -> Vec<LabelRule> {
    vec![
        LabelRule::new("conf", STIM, &[("1", "HC"), ("2", "HC"), ("3", "LC")]),
        LabelRule::stimulus(),
    ]
}

/// Relabel rules for confidence-annotated behavioral files.
pub fn confidence_rules() -> Vec<LabelRule> {
    vec![
        LabelRule::stimulus(),
        LabelRule::new("conf", "conf", &[("1", "HC"), ("2", "LC")]),
    ]
}

/// Relabel rules for intra-operative recordings.
pub fn intraop_rules() -> Vec<LabelRule> {
    vec![
        LabelRule::new("conf", STIM, &[("3", "HC"), ("4", "LC"), ("5", "HC")]),
        LabelRule::new(STIM, STIM, &[("3", "WW"), ("4", "WL"), ("5", "LL")]),
    ]
}

/// Apply relabel rules in order.
pub fn relabel(table: &mut TrialTable, rules: &[LabelRule], strict: bool) -> Result<()> {
    for rule in rules {
        let source = table.require(&rule.source)?;
        let codes: Vec<Option<String>> = (0..table.len()).map(|i| source.level(i)).collect();
        if !table.has_column(&rule.target) {
            table.insert_column(&rule.target, Column::Label(codes.clone()))?;
        }
        let target = table.labels_mut(&rule.target)?;
        for (cell, code) in target.iter_mut().zip(&codes) {
            let Some(code) = code else { continue };
            match rule.codes.get(code) {
                Some(label) => *cell = Some(label.clone()),
                None if strict => {
                    return Err(DdmError::UnknownCode {
                        column: rule.source.clone(),
                        code: code.clone(),
                    });
                }
                None => {}
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Z-score `values` in place using the population standard deviation.
pub fn zscore(values: &mut [f64], column: &str, batch: &str) -> Result<()> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sd = (values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
    if !(sd.is_finite() && sd > 0.0) {
        return Err(DdmError::DegenerateScale {
            column: column.to_string(),
            batch: batch.to_string(),
        });
    }
    for x in values.iter_mut() {
        *x = (*x - mean) / sd;
    }
    Ok(())
}

/// Lag `columns` by one trial: row `i` receives the value recorded at row
/// `i - 1` and the first row of the batch is dropped.
pub fn shift_back(table: &TrialTable, columns: &[String]) -> Result<TrialTable> {
    let mut shifted = table.clone();
    for name in columns {
        let col = shifted.floats_mut(name)?;
        let len = col.len();
        if len > 1 {
            col.copy_within(..len - 1, 1);
        }
    }
    Ok(shifted.filter_rows(|i| i > 0))
}

/// Append signed treatment indicators derived from a 0/1 flag:
/// `<flag>_effect` (+1/−1), `<flag>_effect_inv` (its negation) and
/// `<flag>_inv` (1 − flag).
pub fn derive_flags(table: &mut TrialTable, flag: &str) -> Result<()> {
    let raw = table.ints(flag)?.to_vec();
    let effect: Vec<i64> = raw.iter().map(|&f| if f == 0 { -1 } else { 1 }).collect();
    let effect_inv = effect.iter().map(|&e| -e).collect();
    let inv = raw.iter().map(|&f| 1 - f).collect();
    table.insert_column(&format!("{flag}_effect"), Column::Int(effect))?;
    table.insert_column(&format!("{flag}_effect_inv"), Column::Int(effect_inv))?;
    table.insert_column(&format!("{flag}_inv"), Column::Int(inv))?;
    Ok(())
}

/// Drop every trial with `rt <= floor`.
pub fn remove_outliers(table: &TrialTable, floor: f64) -> Result<TrialTable> {
    let rts = table.rts()?;
    Ok(table.filter_rows(|i| rts[i] > floor))
}

// ---------------------------------------------------------------------------
// Batch loading
// ---------------------------------------------------------------------------

/// Configuration for a loading run.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Z-score the `normalize` columns within each batch.
    pub continuous: bool,
    /// Reaction-time floor; trials at or below it are dropped.
    pub outlier_floor: Option<f64>,
    /// Lag the normalized covariates by one trial.
    pub shift: bool,
    /// Fail on unmapped codes instead of leaving them unchanged.
    pub strict: bool,
    pub normalize: Vec<String>,
    pub treatment_flag: Option<String>,
    /// Response value marking an invalid trial.
    pub invalid_response: Option<i64>,
    pub relabel: Vec<LabelRule>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            continuous: true,
            outlier_floor: Some(0.4),
            shift: false,
            strict: false,
            normalize: vec![THETA.to_string()],
            treatment_flag: None,
            invalid_response: None,
            relabel: vec![LabelRule::stimulus()],
        }
    }
}

impl LoaderConfig {
    pub fn scalp() -> Self {
        Self {
            treatment_flag: Some("dbs".to_string()),
            relabel: scalp_rules(),
            ..Default::default()
        }
    }

    pub fn intraop() -> Self {
        Self {
            normalize: vec!["vent".into(), "mid".into(), "dors".into()],
            invalid_response: Some(10000),
            relabel: intraop_rules(),
            ..Default::default()
        }
    }

    /// Confidence files carry an already-scaled theta.
    pub fn confidence() -> Self {
        Self {
            continuous: false,
            relabel: confidence_rules(),
            ..Default::default()
        }
    }

    /// Files that are already labeled and filtered.
    pub fn passthrough() -> Self {
        Self {
            continuous: false,
            outlier_floor: None,
            normalize: Vec::new(),
            relabel: Vec::new(),
            ..Default::default()
        }
    }
}

/// Identifies one record batch: a subject, optionally under one condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchId {
    pub subject: String,
    pub condition: Option<String>,
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.condition {
            Some(c) => write!(f, "{}/{c}", self.subject),
            None => write!(f, "{}", self.subject),
        }
    }
}

/// Anything that can hand out raw record batches.
pub trait BatchSource {
    fn read_batch(&self, id: &BatchId) -> Result<TrialTable>;
}

/// Batches stored as `<prefix><subject><condition>.txt`.
#[derive(Debug, Clone)]
pub struct FileBatchSource {
    pub prefix: PathBuf,
    pub layout: Layout,
}

impl FileBatchSource {
    pub fn new(prefix: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            prefix: prefix.into(),
            layout,
        }
    }

    pub fn path_for(&self, id: &BatchId) -> PathBuf {
        let mut name = self.prefix.as_os_str().to_os_string();
        name.push(&id.subject);
        if let Some(c) = &id.condition {
            name.push(c);
        }
        name.push(".txt");
        PathBuf::from(name)
    }
}

impl BatchSource for FileBatchSource {
    fn read_batch(&self, id: &BatchId) -> Result<TrialTable> {
        read_table(&self.path_for(id), &self.layout)
    }
}

/// Load every subject × condition batch into one trial table.
///
/// Subjects are stamped with their position in `subjects`; conditions may be
/// empty for single-batch-per-subject families.
pub fn load(
    source: &dyn BatchSource,
    subjects: &[String],
    conditions: &[String],
    config: &LoaderConfig,
) -> Result<TrialTable> {
    let conditions: Vec<Option<String>> = if conditions.is_empty() {
        vec![None]
    } else {
        conditions.iter().cloned().map(Some).collect()
    };

    let mut batches = Vec::with_capacity(subjects.len() * conditions.len());
    for (subj_idx, subject) in subjects.iter().enumerate() {
        for condition in &conditions {
            let id = BatchId {
                subject: subject.clone(),
                condition: condition.clone(),
            };
            let batch = source.read_batch(&id)?;
            batches.push(prepare_batch(batch, subj_idx as i64, &id, config)?);
        }
    }

    let mut table = TrialTable::concat(&batches)?;
    log::debug!("loaded {} trials from {} batches", table.len(), batches.len());
    finish_table(&mut table, config)?;
    Ok(table)
}

/// Load a single-file dataset (subject ids come from the file).
pub fn load_file(path: &Path, layout: &Layout, config: &LoaderConfig) -> Result<TrialTable> {
    let mut table = read_table(path, layout)?;
    coerce_behavioral(&mut table)?;
    table = drop_invalid(table, config)?;
    finish_table(&mut table, config)?;
    log::info!("loaded {} trials from {}", table.len(), path.display());
    Ok(table)
}

fn drop_invalid(table: TrialTable, config: &LoaderConfig) -> Result<TrialTable> {
    match config.invalid_response {
        Some(marker) => {
            let resp = table.responses()?;
            Ok(table.filter_rows(|i| resp[i] != marker))
        }
        None => Ok(table),
    }
}

fn prepare_batch(
    mut batch: TrialTable,
    subj_idx: i64,
    id: &BatchId,
    config: &LoaderConfig,
) -> Result<TrialTable> {
    batch.insert_column(SUBJECT, Column::Int(vec![subj_idx; batch.len()]))?;
    coerce_behavioral(&mut batch)?;
    let mut batch = drop_invalid(batch, config)?;

    if !config.continuous {
        return Ok(batch);
    }
    let present: Vec<String> = config
        .normalize
        .iter()
        .filter(|c| batch.has_column(c))
        .cloned()
        .collect();
    for col in &present {
        zscore(batch.floats_mut(col)?, col, &id.to_string())?;
    }
    if config.shift {
        batch = shift_back(&batch, &present)?;
    }
    Ok(batch)
}

fn finish_table(table: &mut TrialTable, config: &LoaderConfig) -> Result<()> {
    if let Some(flag) = &config.treatment_flag {
        derive_flags(table, flag)?;
    }
    if let Some(floor) = config.outlier_floor {
        let before = table.len();
        *table = remove_outliers(table, floor)?;
        log::debug!("removed {} trials with rt <= {floor}", before - table.len());
    }
    relabel(table, &config.relabel, config.strict)?;

    let ids = table.subject_ids()?;
    if ids.iter().enumerate().any(|(i, &s)| s != i as i64) {
        log::warn!("subject ids {ids:?} are not dense, renumbering");
        table.reindex_subjects()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory batch source keyed by `subject/condition`.
    struct MemorySource {
        batches: HashMap<String, String>,
        layout: Layout,
    }

    impl BatchSource for MemorySource {
        fn read_batch(&self, id: &BatchId) -> Result<TrialTable> {
            let text = self.batches.get(&id.to_string()).ok_or_else(|| DdmError::Parse {
                source_name: id.to_string(),
                line: 0,
                message: "no such batch".into(),
            })?;
            parse_delimited(text, &id.to_string(), &self.layout)
        }
    }

    fn scalp_line(stim: u8, rt: f64, resp: f64, theta: f64, dbs: u8) -> String {
        format!("9 {stim} {rt} {resp} 0 0 {theta} 0 {dbs}\n")
    }

    fn scalp_source() -> MemorySource {
        let mut batches = HashMap::new();
        for subj in ["1", "2"] {
            for (cond, dbs) in [("on", 1), ("off", 0)] {
                let mut text = String::new();
                text.push_str(&scalp_line(1, 0.3, 1.0, 1.0, dbs));
                text.push_str(&scalp_line(2, 0.8, 0.0, 2.0, dbs));
                text.push_str(&scalp_line(3, 1.2, 1.0, 3.0, dbs));
                text.push_str(&scalp_line(1, 2.0, 1.0, 4.0, dbs));
                batches.insert(format!("{subj}/{cond}"), text);
            }
        }
        MemorySource {
            batches,
            layout: Layout::scalp(),
        }
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_zscore_mean_zero_sd_one() {
        let mut v = vec![1.0, 4.0, 2.0, 9.0, 3.5];
        zscore(&mut v, "theta", "b").unwrap();
        let n = v.len() as f64;
        let mean = v.iter().sum::<f64>() / n;
        let sd = (v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
        assert!(mean.abs() < 1e-12);
        assert!((sd - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zscore_constant_batch_fails() {
        let mut v = vec![2.0; 5];
        let err = zscore(&mut v, "theta", "3/on").unwrap_err();
        assert!(matches!(err, DdmError::DegenerateScale { .. }));
    }

    #[test]
    fn test_outlier_floor_strict_inequality() {
        let t = TrialTable::from_columns(vec![(RT.into(), Column::Float(vec![0.1, 0.4, 0.41, 2.0]))])
            .unwrap();
        let kept = remove_outliers(&t, 0.4).unwrap();
        assert_eq!(kept.rts().unwrap(), &[0.41, 2.0]);
    }

    #[test]
    fn test_shift_back_lags_by_one() {
        let t = TrialTable::from_columns(vec![
            (RT.into(), Column::Float(vec![1.0, 2.0, 3.0])),
            (THETA.into(), Column::Float(vec![10.0, 20.0, 30.0])),
        ])
        .unwrap();
        let s = shift_back(&t, &[THETA.to_string()]).unwrap();
        assert_eq!(s.rts().unwrap(), &[2.0, 3.0]);
        assert_eq!(s.floats(THETA).unwrap(), &[10.0, 20.0]);
    }

    #[test]
    fn test_shift_back_single_trial_batch() {
        let t = TrialTable::from_columns(vec![
            (RT.into(), Column::Float(vec![0.8])),
            (THETA.into(), Column::Float(vec![1.5])),
        ])
        .unwrap();
        let s = shift_back(&t, &[THETA.to_string()]).unwrap();
        assert!(s.is_empty());
        assert!(s.floats(THETA).unwrap().is_empty());

        let empty = t.filter_rows(|_| false);
        assert!(shift_back(&empty, &[THETA.to_string()]).unwrap().is_empty());
    }

    #[test]
    fn test_derive_flags() {
        let mut t =
            TrialTable::from_columns(vec![("dbs".into(), Column::Int(vec![0, 1, 1]))]).unwrap();
        derive_flags(&mut t, "dbs").unwrap();
        assert_eq!(t.ints("dbs_effect").unwrap(), &[-1, 1, 1]);
        assert_eq!(t.ints("dbs_effect_inv").unwrap(), &[1, -1, -1]);
        assert_eq!(t.ints("dbs_inv").unwrap(), &[1, 0, 0]);
    }

    #[test]
    fn test_relabel_lenient_keeps_unknown() {
        let mut t = TrialTable::from_columns(vec![(
            STIM.into(),
            Column::Label(vec![Some("1".into()), Some("7".into())]),
        )])
        .unwrap();
        relabel(&mut t, &[LabelRule::stimulus()], false).unwrap();
        assert_eq!(
            t.labels(STIM).unwrap(),
            &[Some("WW".to_string()), Some("7".to_string())]
        );
    }

    #[test]
    fn test_relabel_strict_rejects_unknown() {
        let mut t = TrialTable::from_columns(vec![(
            STIM.into(),
            Column::Label(vec![Some("1".into()), Some("7".into())]),
        )])
        .unwrap();
        let err = relabel(&mut t, &[LabelRule::stimulus()], true).unwrap_err();
        assert!(matches!(err, DdmError::UnknownCode { ref code, .. } if code == "7"));
    }

    #[test]
    fn test_relabel_creates_target_from_source() {
        let mut t = TrialTable::from_columns(vec![(
            STIM.into(),
            Column::Label(vec![Some("1".into()), Some("2".into()), Some("3".into())]),
        )])
        .unwrap();
        relabel(&mut t, &scalp_rules(), false).unwrap();
        let conf: Vec<_> = t.labels("conf").unwrap().iter().flatten().cloned().collect();
        assert_eq!(conf, vec!["HC", "HC", "LC"]);
        let stim: Vec<_> = t.labels(STIM).unwrap().iter().flatten().cloned().collect();
        assert_eq!(stim, vec!["WW", "LL", "WL"]);
    }

    #[test]
    fn test_parse_header_infers_kinds() {
        let text = "subj_idx,stim,rt,response,theta\n0,WW,0.5,1,0.25\n1,LL,0.7,0,\n";
        let t = parse_delimited(text, "mem", &Layout::from_header()).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.subjects().unwrap(), &[0, 1]);
        assert!(t.floats(THETA).unwrap()[1].is_nan());
        assert_eq!(t.require(STIM).unwrap().kind(), ColumnKind::Label);
    }

    #[test]
    fn test_parse_reports_line_number() {
        let text = "0 1 0.5\n0 1 oops 1 0 0 0 0 1\n";
        let err = parse_delimited(text, "mem", &Layout::scalp()).unwrap_err();
        assert!(matches!(err, DdmError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_load_scalp_pipeline() {
        let source = scalp_source();
        let t = load(&source, &ids(&["1", "2"]), &ids(&["on", "off"]), &LoaderConfig::scalp())
            .unwrap();
        // One 0.3 s trial per batch falls under the floor.
        assert_eq!(t.len(), 12);
        assert_eq!(t.subject_ids().unwrap(), vec![0, 1]);
        assert!(t.rts().unwrap().iter().all(|&rt| rt > 0.4));
        assert!(t.has_column("dbs_effect"));
        assert_eq!(t.levels("conf").unwrap(), vec!["HC", "LC"]);
        assert_eq!(t.levels(STIM).unwrap(), vec!["LL", "WL", "WW"]);
        t.validate(Some(0.4)).unwrap();
    }

    #[test]
    fn test_load_normalizes_per_batch() {
        let source = scalp_source();
        let config = LoaderConfig {
            outlier_floor: None,
            ..LoaderConfig::scalp()
        };
        let t = load(&source, &ids(&["1"]), &ids(&["on"]), &config).unwrap();
        let theta = t.floats(THETA).unwrap();
        assert!(theta.iter().sum::<f64>().abs() < 1e-12);
    }

    #[test]
    fn test_load_with_shift_drops_first_trial() {
        let source = scalp_source();
        let config = LoaderConfig {
            outlier_floor: None,
            shift: true,
            ..LoaderConfig::scalp()
        };
        let t = load(&source, &ids(&["1"]), &ids(&["on", "off"]), &config).unwrap();
        assert_eq!(t.len(), 6);
    }

    #[test]
    fn test_load_missing_batch_propagates() {
        let source = scalp_source();
        let err = load(&source, &ids(&["3"]), &ids(&["on"]), &LoaderConfig::scalp());
        assert!(err.is_err());
    }

    #[test]
    fn test_file_batch_source_path() {
        let src = FileBatchSource::new("data/theta/m3tst3_auc_", Layout::scalp());
        let id = BatchId {
            subject: "4".into(),
            condition: Some("off".into()),
        };
        assert_eq!(src.path_for(&id), PathBuf::from("data/theta/m3tst3_auc_4off.txt"));
    }
}
