//! Integration tests for ddmgrid-core.
//!
//! These tests drive the public pipeline end to end:
//! files on disk → loader → catalog → grid → expansion → runner → batch.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use ddmgrid_core::{
    BatchConfig, BatchId, CancelToken, CatalogConfig, DdmError, DerivedConfig, Draw, DrawSink,
    EngineOutput, ExpandedModel, FileBatchSource, GridKind, GridOptions, Layout, LoaderConfig,
    ModelRunner, ModelSpec, Role, RunnerConfig, SamplingEngine, SamplingPlan, TraceStore,
    TrialTable, add_derived_fields, expand, format_report, load, load_catalog, run_batch,
};

const CONF_CSV: &str = "\
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

const PD_CSV: &str = "\
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

fn write_catalog(dir: &Path) {
    let config = CatalogConfig::default();
    for f in [&config.diss, &config.sen, &config.easy] {
        fs::write(dir.join(f), CONF_CSV).unwrap();
    }
    fs::write(dir.join(&config.pd), PD_CSV).unwrap();
}

/// Engine that walks every node along a fixed ramp.
struct RampEngine;

impl SamplingEngine for RampEngine {
    fn name(&self) -> &str {
        "ramp"
    }

    fn sample(
        &self,
        model: &ExpandedModel,
        _table: &TrialTable,
        plan: &SamplingPlan,
        sink: &mut dyn DrawSink,
        cancel: &CancelToken,
    ) -> ddmgrid_core::Result<EngineOutput> {
        let mut values = plan
            .initial
            .clone()
            .unwrap_or_else(|| vec![0.5; model.nodes.len()]);
        for iter in plan.start_iter..plan.samples {
            assert!(!cancel.is_cancelled());
            for v in values.iter_mut() {
                *v += 0.001;
            }
            sink.record(&Draw {
                iter,
                logp: -1.0,
                deviance: 2.0,
                values: &values,
            })?;
        }
        Ok(EngineOutput {
            draws_completed: plan.remaining(),
            final_logp: -1.0,
            acceptance: vec![1.0; model.nodes.len()],
        })
    }

    fn deviance(&self, _: &ExpandedModel, _: &TrialTable, _: &[f64]) -> ddmgrid_core::Result<f64> {
        Ok(1.5)
    }
}

#[test]
fn intraop_batches_load_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let rows = [
        "0 3 0.55 1 1.0 2.0 0.5",
        "0 4 0.81 0 2.0 1.0 0.7",
        "0 5 0.62 10000 9.0 9.0 9.0",
        "0 3 0.90 1 3.0 5.0 0.2",
    ];
    for subject in ["a", "b"] {
        fs::write(dir.path().join(format!("ip_{subject}.txt")), rows.join("\n")).unwrap();
    }
    let source = FileBatchSource::new(dir.path().join("ip_"), Layout::intraop());
    let subjects = vec!["a".to_string(), "b".to_string()];
    let table = load(&source, &subjects, &[], &LoaderConfig::intraop()).unwrap();

    // The invalid-response row is dropped before normalization.
    assert_eq!(table.len(), 6);
    assert_eq!(table.subject_ids().unwrap(), vec![0, 1]);
    let vent = table.floats("vent").unwrap();
    assert!(vent[..3].iter().sum::<f64>().abs() < 1e-9);
    assert_eq!(table.levels("stim").unwrap(), vec!["WL", "WW"]);
    assert_eq!(table.levels("conf").unwrap(), vec!["HC", "LC"]);

    let id = BatchId {
        subject: "c".into(),
        condition: None,
    };
    assert!(source.path_for(&id).ends_with("ip_c.txt"));
}

#[test]
fn every_grid_expands_against_its_dataset() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(dir.path());
    let catalog = load_catalog(dir.path(), &CatalogConfig::default()).unwrap();

    for kind in [
        GridKind::Combined,
        GridKind::Nodbs,
        GridKind::Rooted,
        GridKind::Correlation,
        GridKind::Pd,
    ] {
        let specs = kind.build(&catalog, &GridOptions::default()).unwrap();
        assert!(!specs.is_empty());
        let mut names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), specs.len(), "{kind:?} grid has duplicate names");

        for spec in &specs {
            for cov in spec.covariates() {
                assert!(spec.dataset.has_column(cov), "{} uses missing {cov}", spec.name);
            }
            let first = expand(spec).unwrap();
            let second = expand(spec).unwrap();
            assert_eq!(first.node_ids(), second.node_ids());
        }
    }
}

#[test]
fn invalid_spec_fails_before_sampling() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(dir.path());
    let catalog = load_catalog(dir.path(), &CatalogConfig::default()).unwrap();
    let spec = ModelSpec::new("diss", catalog.get("diss").unwrap()).effects("a", &["gamma"]);
    assert!(matches!(expand(&spec), Err(DdmError::InvalidSpec(_))));
}

#[test]
fn combined_batch_runs_locally_and_persists_traces() {
    let data = tempfile::tempdir().unwrap();
    let traces = tempfile::tempdir().unwrap();
    write_catalog(data.path());
    let catalog = load_catalog(data.path(), &CatalogConfig::default()).unwrap();
    let specs = GridKind::Combined
        .build(&catalog, &GridOptions::default())
        .unwrap();

    let runner = ModelRunner::new(
        Arc::new(RampEngine),
        RunnerConfig {
            trace_root: traces.path().to_path_buf(),
            ..Default::default()
        },
    );
    let config = BatchConfig {
        samples: 30,
        burn: 10,
        workers: 2,
        ..Default::default()
    };
    let outcomes = run_batch(Role::Coordinator, &specs, &runner, &config, &CancelToken::new())
        .unwrap();

    assert_eq!(outcomes.len(), specs.len());
    for (outcome, spec) in outcomes.iter().zip(&specs) {
        let result = outcome.result.as_ref().unwrap();
        assert_eq!(outcome.name, spec.name);
        assert_eq!(result.kept_draws, 20);
        // Dbar = 2, Dhat = 1.5.
        assert!((result.dic - 2.5).abs() < 1e-12);
        assert!(traces.path().join(&spec.name).join("trace.csv").exists());
    }

    let store = TraceStore::new(traces.path());
    let (ids, rows) = store.read_trace(&specs[0].name).unwrap();
    assert_eq!(rows.len(), 30);
    assert_eq!(ids, expand(&specs[0]).unwrap().node_ids());

    let report = format_report(&outcomes);
    assert!(report.contains(&format!("{} of {} models fitted", specs.len(), specs.len())));
}

#[test]
fn resumed_batch_extends_existing_traces() {
    let traces = tempfile::tempdir().unwrap();
    let data = add_derived_fields(
        ddmgrid_core::loader::parse_delimited(
            PD_CSV,
            "pd",
            &Layout::from_header(),
        )
        .unwrap(),
        &DerivedConfig::default(),
    )
    .unwrap();
    let spec = ModelSpec::new("pd", Arc::new(data)).depends("v", &["stim"]);
    let runner = ModelRunner::new(
        Arc::new(RampEngine),
        RunnerConfig {
            trace_root: traces.path().to_path_buf(),
            ..Default::default()
        },
    );
    let cancel = CancelToken::new();
    let first = runner.run(&spec, 20, 5, false, &cancel).unwrap();
    let second = runner.run(&spec, 50, 5, true, &cancel).unwrap();
    assert_eq!(first.kept_draws, 15);
    assert_eq!(second.kept_draws, 45);
    assert_eq!(second.resumed_from, Some(20));

    // The resumed chain continues from the stored state.
    let v = second.stat("v(WW)").unwrap();
    // Kept values run 0.506..=0.550 in 0.001 steps.
    assert!((v.summary.mean - 0.528).abs() < 1e-6);
    assert!((v.summary.q50 - 0.528).abs() < 1e-6);
}
