//! Reference sampling engine for ddmgrid models.
//!
//! [`MetropolisEngine`] implements [`ddmgrid_core::SamplingEngine`] with a
//! component-wise random-walk Metropolis sampler, optional joint adaptive
//! blocks and the Wiener first-passage-time likelihood in [`wfpt`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use ddmgrid_core::{ModelRunner, RunnerConfig};
//! use ddmgrid_sampler::MetropolisEngine;
//!
//! let runner = ModelRunner::new(Arc::new(MetropolisEngine::default()), RunnerConfig::default());
//! # let _ = runner;
//! ```

pub mod metropolis;
pub mod priors;
pub mod wfpt;

pub use metropolis::{MetropolisConfig, MetropolisEngine};
pub use priors::{NodePrior, Prior, PriorSet};
pub use wfpt::{DdmParams, Integration, full_pdf, log_density};
