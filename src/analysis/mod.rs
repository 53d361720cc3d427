//! Statistical analysis: pure, side-effect-free computations over metric
//! samples, and the verdict synthesizer.

mod recommend;
mod stats;

pub use recommend::{Analyzer, MetricKind, MetricSamples};
pub use stats::{
    TTestConfig, TTestOutcome, bonferroni, confidence_interval_95, mean,
    minimum_detectable_effect, percentile, relative_improvement_pct, required_sample_size,
    sample_variance, welch_t_test,
};
