//! Statistical results embedded in the experiment row. Immutable once written.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final verdict for an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Promote,
    Reject,
    Continue,
    Neutral,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Promote => "promote",
            Self::Reject => "reject",
            Self::Continue => "continue",
            Self::Neutral => "neutral",
        };
        write!(f, "{s}")
    }
}

/// How risky adopting the candidate would be, derived from the most
/// negative observed effect size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

/// 95% confidence interval around a sample mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Welch's t-test outcome for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub metric: String,
    /// t statistic; positive means the candidate improved.
    pub statistic: f64,
    pub p_value: f64,
    pub significant: bool,
    pub degrees_of_freedom: f64,
    /// Cohen's d; positive means the candidate improved.
    pub effect_size: f64,
    /// Percent change in the candidate's favor.
    pub relative_improvement_pct: f64,
    pub baseline_ci: ConfidenceInterval,
    pub candidate_ci: ConfidenceInterval,
    pub baseline_samples: usize,
    pub candidate_samples: usize,
}

/// Roll-up over all per-metric results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub recommendation: Recommendation,
    /// 0..1; how much to trust the recommendation.
    pub confidence: f64,
    pub risk: RiskLevel,
    pub significant_improvements: usize,
    pub significant_regressions: usize,
    /// True when any metric lacked the minimum sample count.
    pub insufficient_data: bool,
}

/// The full analysis artifact persisted on the experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    /// Metric name -> test result, ordered for stable serialization.
    pub metrics: BTreeMap<String, TestResult>,
    pub summary: AnalysisSummary,
    pub analyzed_at: DateTime<Utc>,
}
