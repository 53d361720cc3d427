//! Experiment lifecycle engine and its external seams.

mod engine;
mod metrics;
mod render;

pub use engine::ExperimentEngine;
pub use metrics::{CostFlowSnapshot, MetricSource, NullMetricSource, PrometheusSource};
pub use render::{ConfigRenderer, RenderedConfig, TemplateDirRenderer};
