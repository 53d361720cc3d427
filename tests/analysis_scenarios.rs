//! Acceptance scenarios for the statistical analyzer, exercised through the
//! public API.

use std::collections::BTreeMap;

use phoenix::analysis::{Analyzer, MetricSamples, bonferroni, percentile, welch_t_test, TTestConfig};
use phoenix::model::{Recommendation, RiskLevel, SuccessCriteria};
use pretty_assertions::assert_eq;

fn low_variance(center: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| center + 0.1 * (i % 5) as f64).collect()
}

#[test]
fn bonferroni_adjusts_family_alpha() {
    // Five metrics at family alpha 0.05 -> per-metric alpha 0.01.
    let significant = bonferroni(&[0.01, 0.03, 0.04, 0.06, 0.001], 0.05);
    assert_eq!(significant, vec![false, false, false, false, true]);
}

#[test]
fn cardinality_reduction_experiment_promotes() {
    // Baseline mean ~100, candidate ~30, 40 samples each side.
    let mut samples = BTreeMap::new();
    samples.insert(
        "cardinality".to_string(),
        MetricSamples {
            baseline: low_variance(100.0, 40),
            candidate: low_variance(30.0, 40),
        },
    );

    let results = Analyzer::default().analyze_experiment(&samples, &SuccessCriteria::default());
    assert_eq!(results.summary.recommendation, Recommendation::Promote);
    assert!(results.summary.confidence >= 0.75);
    assert_eq!(results.summary.risk, RiskLevel::Low);

    let result = &results.metrics["cardinality"];
    assert!(result.significant);
    assert!(result.relative_improvement_pct > 50.0);
}

#[test]
fn same_distribution_reports_neutral() {
    let mut samples = BTreeMap::new();
    samples.insert(
        "latency_p95".to_string(),
        MetricSamples {
            baseline: low_variance(100.0, 40),
            candidate: low_variance(100.0, 40),
        },
    );
    let results = Analyzer::default().analyze_experiment(&samples, &SuccessCriteria::default());
    assert_eq!(results.summary.recommendation, Recommendation::Neutral);
}

#[test]
fn t_statistic_is_antisymmetric() {
    let a = low_variance(100.0, 40);
    let b = low_variance(93.0, 40);
    let config = TTestConfig::default();
    let ab = welch_t_test(&a, &b, &config);
    let ba = welch_t_test(&b, &a, &config);
    assert!((ab.statistic + ba.statistic).abs() < 1e-9);
}

#[test]
fn sorted_percentile_matches_median() {
    let xs = vec![9.0, 4.0, 7.0, 1.0, 3.0];
    let mut sorted = xs.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(percentile(50.0, &sorted), 4.0);
    assert_eq!(percentile(50.0, &xs), 4.0);
    assert_eq!(percentile(0.0, &xs), 1.0);
    assert_eq!(percentile(100.0, &xs), 9.0);
}
