//! Plugin interfaces consumed by the Davit control loop.
//!
//! The core never talks to infrastructure directly; it composes three
//! pluggable seams:
//! - [`TargetPlugin`]: reports a workload's status and applies scaling
//! - [`MetricSource`]: answers time-ranged metric queries
//! - [`Strategy`]: turns a metric series into a [`davit_policy::ScalingAction`]
//!
//! Implementations register in a [`PluginRegistry`] under the names policy
//! documents refer to. The [`mem`] module provides in-memory implementations
//! for tests and local experiments.

#![forbid(unsafe_code)]

mod error;
pub mod mem;
mod metrics;
mod registry;
mod strategy;
mod target;

pub use error::{PluginError, Result};
pub use metrics::{MetricSource, Sample, TimeRange};
pub use registry::PluginRegistry;
pub use strategy::{CheckEvaluation, FixedValue, PassThrough, Strategy};
pub use target::TargetPlugin;
