//! Per-model trace persistence.
//!
//! Each model owns one directory under the store root, keyed by its name.
//!
//! # Storage Format
//!
//! - `model.json`: metadata (spec summary, data fingerprint, run id, timing)
//! - `trace.csv`: one row per draw: `iter,logp,deviance,<node ids...>`
//! - `summary.json`: the run's result, written by the runner
//!
//! A resumed run continues from the last row of `trace.csv` when the stored
//! fingerprint and node ids match the current model.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::engine::{Draw, DrawSink, TraceRow};
use crate::error::{DdmError, Result};
use crate::spec::{ModelSpec, SpecSummary};
use crate::table::Column;

const TRACE_FILE: &str = "trace.csv";
const META_FILE: &str = "model.json";
const SUMMARY_FILE: &str = "summary.json";

// ---------------------------------------------------------------------------
// Metadata (model.json)
// ---------------------------------------------------------------------------

/// Metadata written next to a model's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMeta {
    pub version: u32,
    pub run_id: String,
    pub model: SpecSummary,
    /// SHA-256 over the spec summary and the trial data.
    pub fingerprint: String,
    pub node_ids: Vec<String>,
    pub samples: usize,
    pub burn: usize,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub draws_recorded: usize,
    /// Iteration the run resumed from, if it did.
    pub resumed_from: Option<usize>,
    pub ddmgrid_version: String,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Content fingerprint of a spec and its dataset.
pub fn fingerprint(spec: &ModelSpec) -> String {
    let mut hasher = Sha256::new();
    if let Ok(json) = serde_json::to_vec(&spec.summary()) {
        hasher.update(&json);
    }
    let table = spec.dataset.as_ref();
    for name in table.column_names() {
        hasher.update(name.as_bytes());
        match table.column(name) {
            Some(Column::Int(v)) => v.iter().for_each(|x| hasher.update(x.to_le_bytes())),
            Some(Column::Float(v)) => v.iter().for_each(|x| hasher.update(x.to_bits().to_le_bytes())),
            Some(Column::Label(v)) => v.iter().for_each(|x| {
                hasher.update(x.as_deref().unwrap_or("\u{0}").as_bytes());
                hasher.update([0xffu8]);
            }),
            None => {}
        }
    }
    hex_encode(&hasher.finalize())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Root directory holding one subdirectory per model.
#[derive(Debug, Clone)]
pub struct TraceStore {
    root: PathBuf,
}

/// What a resumable trace looked like when reopened.
#[derive(Debug, Default)]
pub struct Resumed {
    pub rows: Vec<TraceRow>,
}

impl Resumed {
    pub fn next_iter(&self) -> usize {
        self.rows.last().map_or(0, |r| r.iter + 1)
    }
}

impl TraceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Remove a model's persisted state. Nothing to clear is success.
    pub fn clear(&self, name: &str) -> Result<()> {
        let dir = self.model_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                log::debug!("cleared {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DdmError::io_at(&dir, e)),
        }
    }

    pub fn read_meta(&self, name: &str) -> Result<TraceMeta> {
        self.read_json(name, META_FILE)
    }

    pub fn write_summary<T: Serialize>(&self, name: &str, summary: &T) -> Result<PathBuf> {
        let path = self.model_dir(name).join(SUMMARY_FILE);
        write_json(&path, summary)?;
        Ok(path)
    }

    pub fn read_summary<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.read_json(name, SUMMARY_FILE)
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str, file: &str) -> Result<T> {
        let path = self.model_dir(name).join(file);
        let text = fs::read_to_string(&path).map_err(|e| DdmError::io_at(&path, e))?;
        serde_json::from_str(&text).map_err(|e| DdmError::Parse {
            source_name: path.display().to_string(),
            line: e.line(),
            message: e.to_string(),
        })
    }

    /// Parse a model's trace file.
    ///
    /// A truncated final line (from an interrupted write) is dropped.
    pub fn read_trace(&self, name: &str) -> Result<(Vec<String>, Vec<TraceRow>)> {
        let path = self.model_dir(name).join(TRACE_FILE);
        let text = fs::read_to_string(&path).map_err(|e| DdmError::io_at(&path, e))?;
        let mut lines = text.lines();
        let header = lines.next().ok_or_else(|| DdmError::Parse {
            source_name: path.display().to_string(),
            line: 1,
            message: "empty trace".to_string(),
        })?;
        let ids: Vec<String> = header.split(',').skip(3).map(str::to_string).collect();

        let body: Vec<&str> = lines.collect();
        let mut rows = Vec::with_capacity(body.len());
        for (n, line) in body.iter().enumerate() {
            match parse_row(line, ids.len()) {
                Some(row) => rows.push(row),
                None if n + 1 == body.len() => {
                    log::warn!("{}: dropping truncated last row", path.display());
                }
                None => {
                    return Err(DdmError::Parse {
                        source_name: path.display().to_string(),
                        line: n + 2,
                        message: "malformed trace row".to_string(),
                    });
                }
            }
        }
        Ok((ids, rows))
    }

    /// Open a writer for `spec`.
    ///
    /// Without `resume` any previous state is cleared. With `resume` the
    /// stored rows are returned when the fingerprint and node ids match;
    /// otherwise the stale state is cleared and sampling starts over.
    pub fn open(
        &self,
        spec: &ModelSpec,
        node_ids: &[String],
        samples: usize,
        burn: usize,
        resume: bool,
    ) -> Result<(TraceWriter, Resumed)> {
        let print = fingerprint(spec);
        let mut resumed = Resumed::default();

        if resume {
            match self.try_resume(&spec.name, &print, node_ids) {
                Ok(Some(r)) => resumed = r,
                Ok(None) => self.clear(&spec.name)?,
                Err(e) => {
                    log::warn!("{}: cannot resume ({e}), starting over", spec.name);
                    self.clear(&spec.name)?;
                }
            }
        } else {
            self.clear(&spec.name)?;
        }

        let dir = self.model_dir(&spec.name);
        fs::create_dir_all(&dir).map_err(|e| DdmError::io_at(&dir, e))?;

        // Rewrite the trace so a truncated tail never precedes new rows.
        let trace_path = dir.join(TRACE_FILE);
        let file = File::create(&trace_path).map_err(|e| DdmError::io_at(&trace_path, e))?;
        let mut csv = BufWriter::new(file);
        let io = |e: std::io::Error| DdmError::io_at(&trace_path, e);
        writeln!(csv, "iter,logp,deviance,{}", node_ids.join(",")).map_err(io)?;
        for row in &resumed.rows {
            write_row(&mut csv, row.iter, row.logp, row.deviance, &row.values).map_err(io)?;
        }
        csv.flush().map_err(io)?;

        let meta = TraceMeta {
            version: 1,
            run_id: Uuid::new_v4().to_string(),
            model: spec.summary(),
            fingerprint: print,
            node_ids: node_ids.to_vec(),
            samples,
            burn,
            started_at: unix_now(),
            finished_at: None,
            draws_recorded: resumed.rows.len(),
            resumed_from: (!resumed.rows.is_empty()).then(|| resumed.next_iter()),
            ddmgrid_version: crate::VERSION.to_string(),
        };
        write_json(&dir.join(META_FILE), &meta)?;

        if let Some(from) = meta.resumed_from {
            log::info!("{}: resuming at iteration {from}", spec.name);
        }
        Ok((
            TraceWriter {
                dir,
                csv,
                width: node_ids.len(),
                meta,
            },
            resumed,
        ))
    }

    fn try_resume(&self, name: &str, print: &str, node_ids: &[String]) -> Result<Option<Resumed>> {
        let dir = self.model_dir(name);
        if !dir.join(META_FILE).exists() {
            return Ok(None);
        }
        let meta = self.read_meta(name)?;
        if meta.fingerprint != print || meta.node_ids != node_ids {
            log::info!("{name}: stored trace belongs to a different model, starting over");
            return Ok(None);
        }
        let (ids, rows) = self.read_trace(name)?;
        if ids != node_ids {
            return Ok(None);
        }
        Ok(Some(Resumed { rows }))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| DdmError::io(path.display().to_string(), std::io::Error::other(e)))?;
    fs::write(path, json).map_err(|e| DdmError::io_at(path, e))
}

fn write_row(
    out: &mut impl Write,
    iter: usize,
    logp: f64,
    deviance: f64,
    values: &[f64],
) -> std::io::Result<()> {
    write!(out, "{iter},{logp},{deviance}")?;
    for v in values {
        write!(out, ",{v}")?;
    }
    writeln!(out)
}

fn parse_row(line: &str, width: usize) -> Option<TraceRow> {
    let mut fields = line.split(',');
    let iter = fields.next()?.parse().ok()?;
    let logp = fields.next()?.parse().ok()?;
    let deviance = fields.next()?.parse().ok()?;
    let values: Vec<f64> = fields.map(|f| f.parse().ok()).collect::<Option<_>>()?;
    (values.len() == width).then_some(TraceRow {
        iter,
        logp,
        deviance,
        values,
    })
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Incremental writer for one model's trace.
pub struct TraceWriter {
    dir: PathBuf,
    csv: BufWriter<File>,
    width: usize,
    meta: TraceMeta,
}

impl TraceWriter {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn draws_recorded(&self) -> usize {
        self.meta.draws_recorded
    }

    pub fn run_id(&self) -> &str {
        &self.meta.run_id
    }

    /// Flush the trace and stamp the finish time into `model.json`.
    pub fn finish(mut self) -> Result<PathBuf> {
        let trace_path = self.dir.join(TRACE_FILE);
        self.csv.flush().map_err(|e| DdmError::io_at(&trace_path, e))?;
        self.meta.finished_at = Some(unix_now());
        write_json(&self.dir.join(META_FILE), &self.meta)?;
        Ok(self.dir)
    }
}

impl DrawSink for TraceWriter {
    fn record(&mut self, draw: &Draw<'_>) -> Result<()> {
        if draw.values.len() != self.width {
            return Err(DdmError::Column(format!(
                "draw has {} values, trace has {} nodes",
                draw.values.len(),
                self.width
            )));
        }
        let trace_path = self.dir.join(TRACE_FILE);
        write_row(&mut self.csv, draw.iter, draw.logp, draw.deviance, draw.values)
            .and_then(|()| self.csv.flush())
            .map_err(|e| DdmError::io_at(&trace_path, e))?;
        self.meta.draws_recorded += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::sample_table;
    use std::fs::OpenOptions;
    use std::sync::Arc;

    fn spec() -> ModelSpec {
        ModelSpec::new("trace", Arc::new(sample_table())).depends("v", &["stim"])
    }

    fn ids() -> Vec<String> {
        vec!["a".into(), "v(WW)".into()]
    }

    fn draw(iter: usize, values: &[f64]) -> Draw<'_> {
        Draw {
            iter,
            logp: -(iter as f64),
            deviance: 2.0 * iter as f64,
            values,
        }
    }

    #[test]
    fn test_fingerprint_tracks_data_and_spec() {
        let s = spec();
        assert_eq!(fingerprint(&s), fingerprint(&s.clone()));
        assert_ne!(fingerprint(&s), fingerprint(&s.clone().full()));

        let mut other = sample_table();
        other
            .insert_column("rt", Column::Float(vec![0.9; 8]))
            .unwrap();
        let changed = s.clone().with_dataset("trace", Arc::new(other));
        assert_ne!(fingerprint(&s), fingerprint(&changed));
    }

    #[test]
    fn test_writer_creates_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path());
        let s = spec();
        let (mut w, resumed) = store.open(&s, &ids(), 10, 5, false).unwrap();
        assert!(resumed.rows.is_empty());
        w.record(&draw(0, &[1.0, 2.0])).unwrap();
        w.record(&draw(1, &[1.5, 2.5])).unwrap();
        let dir = w.finish().unwrap();

        assert!(dir.join("trace.csv").exists());
        let meta = store.read_meta(&s.name).unwrap();
        assert_eq!(meta.draws_recorded, 2);
        assert!(meta.finished_at.is_some());
        assert_eq!(meta.node_ids, ids());

        let (header, rows) = store.read_trace(&s.name).unwrap();
        assert_eq!(header, ids());
        assert_eq!(rows[1].values, vec![1.5, 2.5]);
        assert_eq!(rows[1].deviance, 2.0);
    }

    #[test]
    fn test_record_rejects_wrong_width() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path());
        let (mut w, _) = store.open(&spec(), &ids(), 10, 5, false).unwrap();
        assert!(w.record(&draw(0, &[1.0])).is_err());
    }

    #[test]
    fn test_clear_missing_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path());
        store.clear("never-written").unwrap();
    }

    #[test]
    fn test_resume_continues_matching_trace() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path());
        let s = spec();
        let (mut w, _) = store.open(&s, &ids(), 10, 5, false).unwrap();
        for i in 0..3 {
            w.record(&draw(i, &[i as f64, 0.0])).unwrap();
        }
        w.finish().unwrap();

        let (w, resumed) = store.open(&s, &ids(), 10, 5, true).unwrap();
        assert_eq!(resumed.rows.len(), 3);
        assert_eq!(resumed.next_iter(), 3);
        assert_eq!(w.draws_recorded(), 3);
        let meta = store.read_meta(&s.name).unwrap();
        assert_eq!(meta.resumed_from, Some(3));
    }

    #[test]
    fn test_resume_with_changed_model_starts_over() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path());
        let s = spec();
        let (mut w, _) = store.open(&s, &ids(), 10, 5, false).unwrap();
        w.record(&draw(0, &[1.0, 1.0])).unwrap();
        w.finish().unwrap();

        let other_ids = vec!["a".to_string(), "v(LL)".to_string()];
        let (_, resumed) = store.open(&s, &other_ids, 10, 5, true).unwrap();
        assert!(resumed.rows.is_empty());
    }

    #[test]
    fn test_no_resume_clears() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path());
        let s = spec();
        let (mut w, _) = store.open(&s, &ids(), 10, 5, false).unwrap();
        w.record(&draw(0, &[1.0, 1.0])).unwrap();
        w.finish().unwrap();
        store.write_summary(&s.name, &"done").unwrap();

        let (_, resumed) = store.open(&s, &ids(), 10, 5, false).unwrap();
        assert!(resumed.rows.is_empty());
        assert!(!store.model_dir(&s.name).join("summary.json").exists());
    }

    #[test]
    fn test_truncated_tail_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path());
        let s = spec();
        let (mut w, _) = store.open(&s, &ids(), 10, 5, false).unwrap();
        w.record(&draw(0, &[1.0, 1.0])).unwrap();
        let dir = w.finish().unwrap();

        let mut tail = OpenOptions::new()
            .append(true)
            .open(dir.join(TRACE_FILE))
            .unwrap();
        write!(tail, "1,-1,2,0.5").unwrap();

        let (_, rows) = store.read_trace(&s.name).unwrap();
        assert_eq!(rows.len(), 1);
        let (_, resumed) = store.open(&s, &ids(), 10, 5, true).unwrap();
        assert_eq!(resumed.next_iter(), 1);
    }

    #[test]
    fn test_summary_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TraceStore::new(tmp.path());
        let s = spec();
        let (w, _) = store.open(&s, &ids(), 10, 5, false).unwrap();
        w.finish().unwrap();
        store.write_summary(&s.name, &vec![1.0, 2.0]).unwrap();
        let back: Vec<f64> = store.read_summary(&s.name).unwrap();
        assert_eq!(back, vec![1.0, 2.0]);
    }
}
