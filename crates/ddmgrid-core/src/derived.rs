//! Per-subject median splits and binary indicator covariates.
//!
//! Every column written here is a pure function of the input table and the
//! subject grouping, so running [`add_derived_fields`] twice yields the same
//! table. Ties at the median go to the upper bucket (`high` / `slow`).
//! A stratum without trials leaves its cells unset.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::table::{CONF, Column, RESPONSE, RT, STIM, SUBJECT, THETA, TrialTable};

pub const THETA_SPLIT: &str = "theta_split";
pub const RT_SPLIT: &str = "rt_split";
pub const RT_SPLIT_COR_INC: &str = "rt_split_cor_inc";

/// A float 1.0/0.0 column marking rows where `source == level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorSpec {
    pub name: String,
    pub source: String,
    pub level: String,
}

impl IndicatorSpec {
    pub fn new(name: &str, source: &str, level: &str) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            level: level.to_string(),
        }
    }
}

/// Which derived columns to synthesize.
#[derive(Debug, Clone)]
pub struct DerivedConfig {
    /// Continuous covariate that gets a low/high split.
    pub split_column: String,
    pub indicators: Vec<IndicatorSpec>,
}

impl Default for DerivedConfig {
    fn default() -> Self {
        Self {
            split_column: THETA.to_string(),
            indicators: vec![
                IndicatorSpec::new("conf_effect", CONF, "HC"),
                IndicatorSpec::new("LL_effect", STIM, "LL"),
                IndicatorSpec::new("WW_effect", STIM, "WW"),
            ],
        }
    }
}

/// Median of a sample, averaging the two middle values for even counts.
/// Non-finite values are ignored; `None` when nothing remains.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut v: Vec<f64> = values.into_iter().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    Some(if v.len() % 2 == 0 {
        (v[mid - 1] + v[mid]) / 2.0
    } else {
        v[mid]
    })
}

/// Rows of the table grouped by subject id, each group in row order.
fn rows_by_subject(table: &TrialTable) -> Result<BTreeMap<i64, Vec<usize>>> {
    let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, &s) in table.subjects()?.iter().enumerate() {
        groups.entry(s).or_default().push(i);
    }
    Ok(groups)
}

/// Label `rows` by comparing `values[row]` with the median over `rows`.
fn split_rows(
    values: &[f64],
    rows: &[usize],
    labels: (&str, &str),
    out: &mut [Option<String>],
) {
    let Some(med) = median(rows.iter().map(|&i| values[i])) else {
        return;
    };
    for &i in rows {
        let x = values[i];
        if !x.is_finite() {
            continue;
        }
        out[i] = Some(if x >= med { labels.1 } else { labels.0 }.to_string());
    }
}

/// Per-subject low/high split of a continuous column.
pub fn median_split(table: &TrialTable, column: &str) -> Result<Vec<Option<String>>> {
    let values = float_values(table, column)?;
    let mut out = vec![None; table.len()];
    for rows in rows_by_subject(table)?.values() {
        split_rows(&values, rows, ("low", "high"), &mut out);
    }
    Ok(out)
}

/// Per-subject fast/slow split of reaction time, optionally stratified by
/// response accuracy.
pub fn rt_split(table: &TrialTable, by_accuracy: bool) -> Result<Vec<Option<String>>> {
    let rts = table.rts()?;
    let responses = table.responses()?;
    let mut out = vec![None; table.len()];
    for rows in rows_by_subject(table)?.values() {
        if by_accuracy {
            let (correct, incorrect): (Vec<usize>, Vec<usize>) =
                rows.iter().copied().partition(|&i| responses[i] == 1);
            split_rows(rts, &correct, ("fast", "slow"), &mut out);
            split_rows(rts, &incorrect, ("fast", "slow"), &mut out);
        } else {
            split_rows(rts, rows, ("fast", "slow"), &mut out);
        }
    }
    Ok(out)
}

/// 1.0 where `source == level`, 0.0 elsewhere (unset cells included).
pub fn indicator(table: &TrialTable, spec: &IndicatorSpec) -> Result<Vec<f64>> {
    let col = table.require(&spec.source)?;
    Ok((0..table.len())
        .map(|i| {
            if col.level(i).as_deref() == Some(spec.level.as_str()) {
                1.0
            } else {
                0.0
            }
        })
        .collect())
}

fn float_values(table: &TrialTable, column: &str) -> Result<Vec<f64>> {
    let col = table.require(column)?;
    Ok((0..table.len())
        .map(|i| col.value_f64(i).unwrap_or(f64::NAN))
        .collect())
}

/// Append the split and indicator columns, replacing earlier versions.
///
/// Columns whose source is absent are skipped with a debug log, so families
/// without a theta recording (or without confidence) still pass through.
pub fn add_derived_fields(mut table: TrialTable, config: &DerivedConfig) -> Result<TrialTable> {
    table.require(SUBJECT)?;

    if table.has_column(&config.split_column) {
        let split = median_split(&table, &config.split_column)?;
        table.insert_column(THETA_SPLIT, Column::Label(split))?;
    } else {
        log::debug!("no '{}' column, skipping median split", config.split_column);
    }

    if table.has_column(RT) && table.has_column(RESPONSE) {
        let plain = rt_split(&table, false)?;
        let stratified = rt_split(&table, true)?;
        table.insert_column(RT_SPLIT, Column::Label(plain))?;
        table.insert_column(RT_SPLIT_COR_INC, Column::Label(stratified))?;
    }

    for spec in &config.indicators {
        if !table.has_column(&spec.source) {
            log::debug!("no '{}' column, skipping indicator {}", spec.source, spec.name);
            continue;
        }
        let values = indicator(&table, spec)?;
        table.insert_column(&spec.name, Column::Float(values))?;
    }
    Ok(table)
}
