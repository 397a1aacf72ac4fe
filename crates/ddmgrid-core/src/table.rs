//! Columnar in-memory trial table.
//!
//! One row per trial. The four behavioral columns ([`SUBJECT`], [`STIM`],
//! [`RT`], [`RESPONSE`]) are required by everything downstream; any other
//! column is a covariate, a treatment flag, or a derived field. Column order
//! is insertion order and is part of the table's identity.

use std::collections::BTreeSet;

use crate::error::{DdmError, Result};

/// Dense zero-based subject index.
pub const SUBJECT: &str = "subj_idx";
/// Stimulus condition label.
pub const STIM: &str = "stim";
/// Reaction time in seconds.
pub const RT: &str = "rt";
/// Response accuracy, 1 = correct (upper boundary), 0 = incorrect.
pub const RESPONSE: &str = "response";
/// Confidence condition label.
pub const CONF: &str = "conf";
/// Continuous physiological covariate.
pub const THETA: &str = "theta";

/// Storage kind of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Float,
    Label,
}

impl std::fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Label => write!(f, "label"),
        }
    }
}

/// A single typed column. Label cells may be unset (`None`).
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Label(Vec<Option<String>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Label(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Int(_) => ColumnKind::Int,
            Self::Float(_) => ColumnKind::Float,
            Self::Label(_) => ColumnKind::Label,
        }
    }

    /// Whether the column can feed a regression effect.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Label(_))
    }

    /// Numeric value of row `i`; `None` for labels and non-finite floats.
    pub fn value_f64(&self, i: usize) -> Option<f64> {
        match self {
            Self::Int(v) => Some(v[i] as f64),
            Self::Float(v) => Some(v[i]).filter(|x| x.is_finite()),
            Self::Label(_) => None,
        }
    }

    /// Categorical level of row `i`; `None` for unset labels and floats.
    pub fn level(&self, i: usize) -> Option<String> {
        match self {
            Self::Int(v) => Some(v[i].to_string()),
            Self::Float(_) => None,
            Self::Label(v) => v[i].clone(),
        }
    }

    /// Whether row `i` holds a usable value of either kind.
    pub fn is_set(&self, i: usize) -> bool {
        match self {
            Self::Int(_) => true,
            Self::Float(v) => v[i].is_finite(),
            Self::Label(v) => v[i].is_some(),
        }
    }

    fn select(&self, rows: &[usize]) -> Column {
        match self {
            Self::Int(v) => Self::Int(rows.iter().map(|&i| v[i]).collect()),
            Self::Float(v) => Self::Float(rows.iter().map(|&i| v[i]).collect()),
            Self::Label(v) => Self::Label(rows.iter().map(|&i| v[i].clone()).collect()),
        }
    }

    fn extend_from(&mut self, other: &Column) -> bool {
        // Mixed numeric kinds widen to float.
        if let (Self::Int(a), Self::Float(_)) = (&*self, other) {
            let widened: Vec<f64> = a.iter().map(|&x| x as f64).collect();
            *self = Self::Float(widened);
        }
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.extend_from_slice(b),
            (Self::Float(a), Self::Float(b)) => a.extend_from_slice(b),
            (Self::Float(a), Self::Int(b)) => a.extend(b.iter().map(|&x| x as f64)),
            (Self::Label(a), Self::Label(b)) => a.extend(b.iter().cloned()),
            _ => return false,
        }
        true
    }
}

/// Ordered sequence of trial records stored column-wise.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialTable {
    columns: Vec<(String, Column)>,
    len: usize,
}

impl TrialTable {
    /// Create an empty table with no columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from named columns, which must all have equal length.
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self> {
        let mut table = Self::new();
        for (name, col) in columns {
            table.insert_column(&name, col)?;
        }
        Ok(table)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Column lookup that fails with a descriptive error.
    pub fn require(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| DdmError::Column(format!("missing column '{name}'")))
    }

    fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    /// Insert a column, replacing an existing one of the same name in place.
    pub fn insert_column(&mut self, name: &str, column: Column) -> Result<()> {
        if self.columns.is_empty() {
            self.len = column.len();
        } else if column.len() != self.len {
            return Err(DdmError::Column(format!(
                "column '{name}' has {} rows, table has {}",
                column.len(),
                self.len
            )));
        }
        match self.column_mut(name) {
            Some(slot) => *slot = column,
            None => self.columns.push((name.to_string(), column)),
        }
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        let pos = self.columns.iter().position(|(n, _)| n == name)?;
        let (_, col) = self.columns.remove(pos);
        if self.columns.is_empty() {
            self.len = 0;
        }
        Some(col)
    }

    pub fn ints(&self, name: &str) -> Result<&[i64]> {
        match self.require(name)? {
            Column::Int(v) => Ok(v),
            other => Err(kind_error(name, ColumnKind::Int, other.kind())),
        }
    }

    pub fn floats(&self, name: &str) -> Result<&[f64]> {
        match self.require(name)? {
            Column::Float(v) => Ok(v),
            other => Err(kind_error(name, ColumnKind::Float, other.kind())),
        }
    }

    pub fn labels(&self, name: &str) -> Result<&[Option<String>]> {
        match self.require(name)? {
            Column::Label(v) => Ok(v),
            other => Err(kind_error(name, ColumnKind::Label, other.kind())),
        }
    }

    pub(crate) fn floats_mut(&mut self, name: &str) -> Result<&mut Vec<f64>> {
        match self.column_mut(name) {
            Some(Column::Float(v)) => Ok(v),
            Some(other) => Err(kind_error(name, ColumnKind::Float, other.kind())),
            None => Err(DdmError::Column(format!("missing column '{name}'"))),
        }
    }

    pub(crate) fn labels_mut(&mut self, name: &str) -> Result<&mut Vec<Option<String>>> {
        match self.column_mut(name) {
            Some(Column::Label(v)) => Ok(v),
            Some(other) => Err(kind_error(name, ColumnKind::Label, other.kind())),
            None => Err(DdmError::Column(format!("missing column '{name}'"))),
        }
    }

    pub fn subjects(&self) -> Result<&[i64]> {
        self.ints(SUBJECT)
    }

    pub fn rts(&self) -> Result<&[f64]> {
        self.floats(RT)
    }

    pub fn responses(&self) -> Result<&[i64]> {
        self.ints(RESPONSE)
    }

    /// Sorted distinct subject ids.
    pub fn subject_ids(&self) -> Result<Vec<i64>> {
        let set: BTreeSet<i64> = self.subjects()?.iter().copied().collect();
        Ok(set.into_iter().collect())
    }

    /// Sorted distinct levels of a categorical column; unset cells are skipped.
    /// Integer columns sort numerically, labels lexicographically.
    pub fn levels(&self, name: &str) -> Result<Vec<String>> {
        match self.require(name)? {
            Column::Int(v) => {
                let set: BTreeSet<i64> = v.iter().copied().collect();
                Ok(set.into_iter().map(|x| x.to_string()).collect())
            }
            Column::Label(v) => {
                let set: BTreeSet<&String> = v.iter().flatten().collect();
                Ok(set.into_iter().cloned().collect())
            }
            Column::Float(_) => Err(DdmError::Column(format!(
                "column '{name}' is continuous and has no levels"
            ))),
        }
    }

    /// New table holding the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|(n, c)| (n.clone(), c.select(rows)))
                .collect(),
            len: if self.columns.is_empty() { 0 } else { rows.len() },
        }
    }

    /// New table keeping rows for which `keep` returns true.
    pub fn filter_rows(&self, keep: impl Fn(usize) -> bool) -> Self {
        let rows: Vec<usize> = (0..self.len).filter(|&i| keep(i)).collect();
        self.select_rows(&rows)
    }

    /// Rows where an integer column equals `value`.
    pub fn filter_eq(&self, name: &str, value: i64) -> Result<Self> {
        let col = self.ints(name)?;
        Ok(self.filter_rows(|i| col[i] == value))
    }

    /// Concatenate tables with identical column sets, preserving row order.
    pub fn concat(tables: &[TrialTable]) -> Result<Self> {
        let Some(first) = tables.first() else {
            return Ok(Self::new());
        };
        let mut out = first.clone();
        for (idx, t) in tables.iter().enumerate().skip(1) {
            if t.columns.len() != out.columns.len() {
                return Err(DdmError::Column(format!(
                    "table {idx} has {} columns, expected {}",
                    t.columns.len(),
                    out.columns.len()
                )));
            }
            for (name, col) in out.columns.iter_mut() {
                let other = t.require(name)?;
                if !col.extend_from(other) {
                    return Err(DdmError::Column(format!(
                        "column '{name}' is {} in table {idx}, expected {}",
                        other.kind(),
                        col.kind()
                    )));
                }
            }
            out.len += t.len;
        }
        Ok(out)
    }

    /// Renumber subjects densely (0..N-1) in ascending order of their
    /// current ids.
    pub fn reindex_subjects(&mut self) -> Result<()> {
        let ids = self.subject_ids()?;
        let Some(Column::Int(col)) = self.column_mut(SUBJECT) else {
            return Err(DdmError::Column(format!("missing column '{SUBJECT}'")));
        };
        for s in col.iter_mut() {
            // ids is sorted and contains every value present.
            *s = ids.binary_search(s).unwrap_or_default() as i64;
        }
        Ok(())
    }

    /// Stack studies into one table with an integer group column. Subject ids
    /// of later tables are offset so no two studies share a subject.
    pub fn stack_groups(tables: &[TrialTable], group_column: &str) -> Result<Self> {
        let mut parts = Vec::with_capacity(tables.len());
        let mut offset = 0i64;
        for (g, t) in tables.iter().enumerate() {
            let mut part = t.clone();
            part.reindex_subjects()?;
            let n_subj = part.subject_ids()?.len() as i64;
            if let Some(Column::Int(col)) = part.column_mut(SUBJECT) {
                col.iter_mut().for_each(|s| *s += offset);
            }
            offset += n_subj;
            part.insert_column(group_column, Column::Int(vec![g as i64; part.len()]))?;
            parts.push(part);
        }
        Self::concat(&parts)
    }

    /// Check the invariants every loaded table must satisfy.
    pub fn validate(&self, rt_floor: Option<f64>) -> Result<()> {
        let ids = self.subject_ids()?;
        if ids.iter().enumerate().any(|(i, &s)| s != i as i64) {
            return Err(DdmError::Column(format!(
                "subject ids are not dense and zero-based: {ids:?}"
            )));
        }
        self.require(STIM)?;
        self.responses()?;
        if let Some(floor) = rt_floor
            && let Some(bad) = self.rts()?.iter().find(|&&rt| rt <= floor)
        {
            return Err(DdmError::Column(format!(
                "reaction time {bad} does not exceed floor {floor}"
            )));
        }
        Ok(())
    }
}

fn kind_error(name: &str, wanted: ColumnKind, got: ColumnKind) -> DdmError {
    DdmError::Column(format!("column '{name}' is {got}, expected {wanted}"))
}
