//! # ddmgrid-core
//!
//! **Hierarchical drift-diffusion model grids over behavioral datasets.**
//!
//! `ddmgrid-core` loads trial-level reaction-time data, derives the
//! covariates the models regress on, enumerates a deterministic grid of
//! model specifications, expands each into its parameter-node graph and fits
//! them through a pluggable [`SamplingEngine`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use ddmgrid_core::{CatalogConfig, ModelSpec, expand, load_catalog};
//!
//! let catalog = load_catalog(Path::new("data"), &CatalogConfig::default()).unwrap();
//! let spec = ModelSpec::new("diss", catalog.get("diss").unwrap())
//!     .effects("a", &["theta"])
//!     .depends("v", &["stim"]);
//! let model = expand(&spec).unwrap();
//! println!("{}: {} nodes", model.name, model.nodes.len());
//! ```
//!
//! ## Architecture
//!
//! Loader → Derived fields → Grid (specs) → Expansion → Runner → Orchestrator
//!
//! - **Loader** ([`loader`]): per-batch normalization, relabeling, outlier
//!   removal and lag shifting into one [`TrialTable`].
//! - **Derived fields** ([`derived`]): per-subject median splits and 0/1
//!   indicators; unset strata are left unset, never guessed.
//! - **Specs** ([`spec`], [`expand`]): a [`ModelSpec`] is immutable data with
//!   a content-derived name; [`expand()`] validates it eagerly and builds the
//!   node graph with an explicit [`NodeFamily`] per node.
//! - **Grid** ([`grid`]): pure functions returning ordered, uniquely named
//!   spec lists.
//! - **Runner** ([`runner`]): one model, one trace directory, one
//!   [`ModelResult`].
//! - **Orchestrator** ([`orchestrator`]): local thread pool or TCP
//!   coordinator/worker dispatch with per-model failure isolation.

pub mod catalog;
pub mod derived;
pub mod engine;
pub mod error;
pub mod expand;
pub mod grid;
pub mod loader;
pub mod orchestrator;
pub mod proposals;
pub mod runner;
pub mod spec;
pub mod summary;
pub mod table;
pub mod trace;

pub use catalog::{Catalog, CatalogConfig, GROUP, PD, load_catalog, split_by_flag};
pub use derived::{DerivedConfig, IndicatorSpec, add_derived_fields, median, median_split, rt_split};
pub use engine::{
    CancelToken, Draw, DrawSink, EngineOutput, MemorySink, SamplingEngine, SamplingPlan, TraceRow,
};
pub use error::{DdmError, PartialDiagnostics, Result};
pub use expand::{
    EffectLink, EffectTerm, ExpandedModel, Node, NodeFamily, NodeLevel, ParamKind, Parent,
    TrialDesign, expand,
};
pub use grid::{GridKind, GridOptions, build_grid, combined_grid, correlation_grid, pd_grid};
pub use loader::{
    BatchId, BatchSource, FileBatchSource, LabelRule, Layout, LoaderConfig, load, load_file,
};
pub use orchestrator::{
    BatchConfig, JobOutcome, LocalPool, Role, TcpCoordinator, format_report, run_batch, tcp_worker,
};
pub use proposals::{FamilyScales, ProposalPlan, ProposalTuning, plan_proposals};
pub use runner::{ModelResult, ModelRunner, RunnerConfig};
pub use spec::{ModelSpec, ModelType, ParamSymbol, SpecSummary};
pub use summary::{NodeStat, NodeSummary, dic, format_group_stats, summarize};
pub use table::{Column, ColumnKind, TrialTable};
pub use trace::{TraceMeta, TraceStore, TraceWriter};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
