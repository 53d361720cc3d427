//! Per-metric interpretation and the experiment verdict synthesizer.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::analysis::stats::{self, TTestConfig};
use crate::model::{
    AnalysisSummary, ConfidenceInterval, ExperimentResults, Recommendation, RiskLevel,
    SuccessCriteria, TestResult,
};

/// Optimization direction of a metric, inferred from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Latency,
    ErrorRate,
    Cost,
    Throughput,
}

impl MetricKind {
    /// Classify a metric name. Unknown names default to latency-like
    /// (lower is better), the conservative choice.
    pub fn classify(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("error") {
            Self::ErrorRate
        } else if name.contains("throughput") || name.contains("ops") {
            Self::Throughput
        } else if name.contains("cost") || name.contains("cardinality") {
            Self::Cost
        } else {
            Self::Latency
        }
    }

    pub fn lower_is_better(self) -> bool {
        !matches!(self, Self::Throughput)
    }
}

/// Baseline and candidate sample vectors for one metric.
#[derive(Debug, Clone, Default)]
pub struct MetricSamples {
    pub baseline: Vec<f64>,
    pub candidate: Vec<f64>,
}

/// Stateless analyzer; safe to share and call concurrently.
#[derive(Debug, Clone, Copy)]
pub struct Analyzer {
    pub min_sample: usize,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self { min_sample: 30 }
    }
}

impl Analyzer {
    pub fn new(min_sample: usize) -> Self {
        Self { min_sample }
    }

    /// Test one metric.
    ///
    /// Samples of lower-is-better metrics are negated before the test so a
    /// positive statistic, effect size and relative improvement always mean
    /// "the candidate improved". Confidence intervals stay on the raw scale.
    pub fn analyze_metric(
        &self,
        name: &str,
        samples: &MetricSamples,
        alpha: f64,
    ) -> TestResult {
        let config = TTestConfig {
            min_sample: self.min_sample,
            alpha,
        };

        let kind = MetricKind::classify(name);
        let outcome = if kind.lower_is_better() {
            let baseline: Vec<f64> = samples.baseline.iter().map(|x| -x).collect();
            let candidate: Vec<f64> = samples.candidate.iter().map(|x| -x).collect();
            stats::welch_t_test(&baseline, &candidate, &config)
        } else {
            stats::welch_t_test(&samples.baseline, &samples.candidate, &config)
        };

        let (b_mean, b_lower, b_upper) = stats::confidence_interval_95(&samples.baseline);
        let (c_mean, c_lower, c_upper) = stats::confidence_interval_95(&samples.candidate);

        TestResult {
            metric: name.to_string(),
            statistic: outcome.statistic,
            p_value: outcome.p_value,
            significant: outcome.significant,
            degrees_of_freedom: outcome.degrees_of_freedom,
            effect_size: outcome.effect_size,
            relative_improvement_pct: adjusted_improvement(kind, &samples.baseline, &samples.candidate),
            baseline_ci: ConfidenceInterval {
                mean: b_mean,
                lower: b_lower,
                upper: b_upper,
            },
            candidate_ci: ConfidenceInterval {
                mean: c_mean,
                lower: c_lower,
                upper: c_upper,
            },
            baseline_samples: samples.baseline.len(),
            candidate_samples: samples.candidate.len(),
        }
    }

    /// Run every metric and synthesize the experiment verdict.
    pub fn analyze_experiment(
        &self,
        samples: &BTreeMap<String, MetricSamples>,
        criteria: &SuccessCriteria,
    ) -> ExperimentResults {
        let mut metrics = BTreeMap::new();
        let mut insufficient_data = false;
        for (name, metric_samples) in samples {
            if metric_samples.baseline.len() < self.min_sample
                || metric_samples.candidate.len() < self.min_sample
            {
                insufficient_data = true;
            }
            metrics.insert(
                name.clone(),
                self.analyze_metric(name, metric_samples, criteria.alpha),
            );
        }

        let significant_improvements = metrics
            .values()
            .filter(|r| r.significant && r.relative_improvement_pct > criteria.min_improvement_pct)
            .count();
        let significant_regressions = metrics
            .values()
            .filter(|r| r.significant && r.relative_improvement_pct < -criteria.max_regression_pct)
            .count();

        let recommendation = if insufficient_data {
            Recommendation::Continue
        } else if significant_regressions > 0 {
            Recommendation::Reject
        } else if significant_improvements > 0 {
            Recommendation::Promote
        } else {
            Recommendation::Neutral
        };

        let confidence = if insufficient_data {
            0.3
        } else {
            let bands: Vec<f64> = metrics
                .values()
                .filter(|r| r.significant)
                .map(|r| confidence_band(r.p_value))
                .collect();
            if bands.is_empty() {
                0.5
            } else {
                bands.iter().sum::<f64>() / bands.len() as f64
            }
        };

        let worst_effect = metrics
            .values()
            .map(|r| r.effect_size)
            .fold(f64::INFINITY, f64::min);
        let risk = if worst_effect < -0.8 {
            RiskLevel::High
        } else if worst_effect < -0.5 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        ExperimentResults {
            metrics,
            summary: AnalysisSummary {
                recommendation,
                confidence,
                risk,
                significant_improvements,
                significant_regressions,
                insufficient_data,
            },
            analyzed_at: Utc::now(),
        }
    }
}

/// Relative improvement with the sign flipped for lower-is-better metrics,
/// so positive always favors the candidate.
fn adjusted_improvement(kind: MetricKind, baseline: &[f64], candidate: &[f64]) -> f64 {
    let raw = stats::relative_improvement_pct(stats::mean(baseline), stats::mean(candidate));
    if kind.lower_is_better() { -raw } else { raw }
}

/// Confidence contributed by one significant metric.
fn confidence_band(p_value: f64) -> f64 {
    if p_value < 0.001 {
        0.95
    } else if p_value < 0.01 {
        0.85
    } else if p_value < 0.05 {
        0.75
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples_around(center: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| center + 0.1 * (i % 5) as f64).collect()
    }

    fn one_metric(name: &str, baseline: Vec<f64>, candidate: Vec<f64>) -> BTreeMap<String, MetricSamples> {
        let mut map = BTreeMap::new();
        map.insert(name.to_string(), MetricSamples { baseline, candidate });
        map
    }

    #[test]
    fn classification_by_name() {
        assert_eq!(MetricKind::classify("latency_p95"), MetricKind::Latency);
        assert_eq!(MetricKind::classify("error_rate"), MetricKind::ErrorRate);
        assert_eq!(MetricKind::classify("throughput_rps"), MetricKind::Throughput);
        assert_eq!(MetricKind::classify("cardinality"), MetricKind::Cost);
        assert_eq!(MetricKind::classify("cost_per_minute"), MetricKind::Cost);
        assert!(MetricKind::classify("error_rate").lower_is_better());
        assert!(!MetricKind::classify("throughput_rps").lower_is_better());
    }

    #[test]
    fn large_cardinality_drop_promotes_with_high_confidence() {
        // Baseline mean ~100, candidate ~30, 40 samples, low variance.
        let samples = one_metric(
            "cardinality",
            samples_around(100.0, 40),
            samples_around(30.0, 40),
        );
        let results = Analyzer::default().analyze_experiment(&samples, &SuccessCriteria::default());

        let result = &results.metrics["cardinality"];
        assert!(result.significant);
        assert!(result.relative_improvement_pct > 50.0, "{}", result.relative_improvement_pct);
        assert!(result.statistic > 0.0, "positive statistic = candidate improved");
        assert!(result.effect_size > 0.0);

        assert_eq!(results.summary.recommendation, Recommendation::Promote);
        assert!(results.summary.confidence >= 0.75);
        assert_eq!(results.summary.risk, RiskLevel::Low);
    }

    #[test]
    fn same_distribution_is_neutral() {
        let samples = one_metric(
            "latency_p95",
            samples_around(100.0, 40),
            samples_around(100.0, 40),
        );
        let results = Analyzer::default().analyze_experiment(&samples, &SuccessCriteria::default());
        assert_eq!(results.summary.recommendation, Recommendation::Neutral);
        assert_eq!(results.summary.significant_improvements, 0);
        assert_eq!(results.summary.significant_regressions, 0);
    }

    #[test]
    fn any_significant_regression_rejects() {
        let mut samples = one_metric(
            "latency_p95",
            samples_around(100.0, 40),
            samples_around(130.0, 40), // 30% worse latency
        );
        // A big improvement elsewhere must not outweigh the regression.
        samples.insert(
            "cardinality".to_string(),
            MetricSamples {
                baseline: samples_around(100.0, 40),
                candidate: samples_around(30.0, 40),
            },
        );
        let results = Analyzer::default().analyze_experiment(&samples, &SuccessCriteria::default());
        assert_eq!(results.summary.recommendation, Recommendation::Reject);
        assert!(results.summary.significant_regressions >= 1);
        assert_eq!(results.summary.risk, RiskLevel::High);
    }

    #[test]
    fn insufficient_samples_mean_continue_at_low_confidence() {
        let samples = one_metric(
            "latency_p95",
            samples_around(100.0, 10),
            samples_around(30.0, 10),
        );
        let results = Analyzer::default().analyze_experiment(&samples, &SuccessCriteria::default());
        assert_eq!(results.summary.recommendation, Recommendation::Continue);
        assert!((results.summary.confidence - 0.3).abs() < f64::EPSILON);
        assert!(results.summary.insufficient_data);
    }

    #[test]
    fn throughput_gain_counts_as_improvement_without_negation() {
        let samples = one_metric(
            "throughput_rps",
            samples_around(100.0, 40),
            samples_around(120.0, 40),
        );
        let results = Analyzer::default().analyze_experiment(&samples, &SuccessCriteria::default());
        let result = &results.metrics["throughput_rps"];
        assert!(result.relative_improvement_pct > 15.0);
        assert_eq!(results.summary.recommendation, Recommendation::Promote);
    }

    #[test]
    fn latency_drop_reports_positive_improvement() {
        let analyzer = Analyzer::default();
        let samples = MetricSamples {
            baseline: samples_around(100.0, 40),
            candidate: samples_around(80.0, 40),
        };
        let result = analyzer.analyze_metric("latency_p95", &samples, 0.05);
        assert!(result.significant);
        assert!(result.relative_improvement_pct > 0.0, "lower latency is an improvement");
        // CIs stay on the raw scale.
        assert!(result.baseline_ci.mean > result.candidate_ci.mean);
    }

    #[test]
    fn confidence_bands() {
        assert_eq!(confidence_band(0.0005), 0.95);
        assert_eq!(confidence_band(0.005), 0.85);
        assert_eq!(confidence_band(0.03), 0.75);
        assert_eq!(confidence_band(0.2), 0.5);
    }

    #[test]
    fn small_regressions_below_threshold_do_not_reject() {
        // 3% latency regression: significant but inside the 5% tolerance.
        let samples = one_metric(
            "latency_p95",
            samples_around(100.0, 40),
            samples_around(103.0, 40),
        );
        let results = Analyzer::default().analyze_experiment(&samples, &SuccessCriteria::default());
        assert_eq!(results.summary.recommendation, Recommendation::Neutral);
    }
}
