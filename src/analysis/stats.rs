//! Statistical primitives: pure functions over numeric samples.

use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// Parameters shared by the sample-level tests.
#[derive(Debug, Clone, Copy)]
pub struct TTestConfig {
    /// Minimum samples per side before a test can report significance.
    pub min_sample: usize,
    /// Significance level.
    pub alpha: f64,
}

impl Default for TTestConfig {
    fn default() -> Self {
        Self {
            min_sample: 30,
            alpha: 0.05,
        }
    }
}

/// Raw output of Welch's t-test, before any direction adjustment.
#[derive(Debug, Clone, Copy)]
pub struct TTestOutcome {
    pub statistic: f64,
    pub p_value: f64,
    pub degrees_of_freedom: f64,
    pub significant: bool,
    /// Cohen's d with pooled SD.
    pub effect_size: f64,
    /// (mean_c - mean_b) / |mean_b| * 100, or 0 when mean_b is 0.
    pub relative_improvement_pct: f64,
}

/// Arithmetic mean; 0 for empty input.
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample variance with the n-1 denominator; 0 below two samples.
pub fn sample_variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Welch's two-sample t-test of `candidate` against `baseline`.
///
/// With fewer than `min_sample` points on either side the test refuses to
/// claim anything: `significant = false`, `statistic = 0`.
pub fn welch_t_test(baseline: &[f64], candidate: &[f64], config: &TTestConfig) -> TTestOutcome {
    let mean_b = mean(baseline);
    let mean_c = mean(candidate);
    let improvement = relative_improvement_pct(mean_b, mean_c);

    if baseline.len() < config.min_sample || candidate.len() < config.min_sample {
        return TTestOutcome {
            statistic: 0.0,
            p_value: 1.0,
            degrees_of_freedom: 0.0,
            significant: false,
            effect_size: 0.0,
            relative_improvement_pct: improvement,
        };
    }

    let n_b = baseline.len() as f64;
    let n_c = candidate.len() as f64;
    let var_b = sample_variance(baseline);
    let var_c = sample_variance(candidate);

    let diff = mean_c - mean_b;
    // Zero-variance inputs are degenerate; a vanishing floor keeps the
    // statistic finite while preserving the obvious answer.
    let se = (var_b / n_b + var_c / n_c).sqrt().max(1e-12);
    let statistic = diff / se;

    let degrees_of_freedom = welch_satterthwaite(var_b, n_b, var_c, n_c)
        .unwrap_or(n_b + n_c - 2.0);
    let p_value = two_tailed_p(statistic, degrees_of_freedom);

    let pooled_sd = ((var_b + var_c) / 2.0).sqrt();
    let effect_size = if pooled_sd > 0.0 { diff / pooled_sd } else { 0.0 };

    TTestOutcome {
        statistic,
        p_value,
        degrees_of_freedom,
        significant: p_value < config.alpha,
        effect_size,
        relative_improvement_pct: improvement,
    }
}

/// Candidate-vs-baseline change in percent; 0 when the baseline mean is 0.
pub fn relative_improvement_pct(mean_baseline: f64, mean_candidate: f64) -> f64 {
    if mean_baseline == 0.0 {
        0.0
    } else {
        (mean_candidate - mean_baseline) / mean_baseline.abs() * 100.0
    }
}

fn welch_satterthwaite(var_b: f64, n_b: f64, var_c: f64, n_c: f64) -> Option<f64> {
    let a = var_b / n_b;
    let b = var_c / n_c;
    let numerator = (a + b).powi(2);
    let denominator = a.powi(2) / (n_b - 1.0) + b.powi(2) / (n_c - 1.0);
    let df = numerator / denominator;
    (df.is_finite() && df > 0.0).then_some(df)
}

/// Two-tailed p-value from the Student's t distribution.
fn two_tailed_p(statistic: f64, degrees_of_freedom: f64) -> f64 {
    if !statistic.is_finite() {
        return 0.0;
    }
    match StudentsT::new(0.0, 1.0, degrees_of_freedom) {
        Ok(dist) => (2.0 * (1.0 - dist.cdf(statistic.abs()))).clamp(0.0, 1.0),
        // df too small for a t distribution; fall back to the normal
        // approximation.
        Err(_) => (2.0 * (1.0 - standard_normal().cdf(statistic.abs()))).clamp(0.0, 1.0),
    }
}

fn standard_normal() -> Normal {
    Normal::new(0.0, 1.0).expect("standard normal parameters are valid")
}

/// 95% confidence interval around the sample mean via the normal
/// approximation. Returns `(mean, lower, upper)`.
pub fn confidence_interval_95(xs: &[f64]) -> (f64, f64, f64) {
    let m = mean(xs);
    if xs.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let half = 1.959_964 * (sample_variance(xs) / xs.len() as f64).sqrt();
    (m, m - half, m + half)
}

/// Bonferroni correction: index i is significant iff `p_i < alpha / n`.
pub fn bonferroni(p_values: &[f64], alpha: f64) -> Vec<bool> {
    if p_values.is_empty() {
        return Vec::new();
    }
    let adjusted = alpha / p_values.len() as f64;
    p_values.iter().map(|p| *p < adjusted).collect()
}

/// Minimum detectable effect for a given per-group sample size.
pub fn minimum_detectable_effect(variance: f64, n: usize, alpha: f64, power: f64) -> f64 {
    if n == 0 {
        return f64::INFINITY;
    }
    let z = z_alpha(alpha) + z_power(power);
    z * (2.0 * variance / n as f64).sqrt()
}

/// Per-group sample size required to detect `effect`, rounded up.
pub fn required_sample_size(effect: f64, variance: f64, alpha: f64, power: f64) -> usize {
    if effect <= 0.0 {
        return usize::MAX;
    }
    let z = z_alpha(alpha) + z_power(power);
    (2.0 * variance * z.powi(2) / effect.powi(2)).ceil() as usize
}

fn z_alpha(alpha: f64) -> f64 {
    standard_normal().inverse_cdf(1.0 - alpha / 2.0)
}

fn z_power(power: f64) -> f64 {
    standard_normal().inverse_cdf(power)
}

/// Percentile via linear interpolation on a sorted copy.
///
/// Returns 0 for empty input or `p` outside [0, 100].
pub fn percentile(p: f64, data: &[f64]) -> f64 {
    if data.is_empty() || !(0.0..=100.0).contains(&p) {
        return 0.0;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 40 low-variance samples around `center`.
    fn samples_around(center: f64) -> Vec<f64> {
        (0..40).map(|i| center + 0.1 * (i % 5) as f64).collect()
    }

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[2.0, 4.0]), 3.0);
    }

    #[test]
    fn variance_uses_n_minus_one() {
        // Var([1, 2, 3, 4]) with n-1 = 5/3.
        let v = sample_variance(&[1.0, 2.0, 3.0, 4.0]);
        assert!((v - 5.0 / 3.0).abs() < 1e-12, "got {v}");
        assert_eq!(sample_variance(&[1.0]), 0.0);
    }

    #[test]
    fn detects_true_ten_percent_shift_at_forty_samples() {
        let baseline = samples_around(100.0);
        let candidate = samples_around(110.0);
        let outcome = welch_t_test(&baseline, &candidate, &TTestConfig::default());
        assert!(outcome.significant, "p = {}", outcome.p_value);
        assert!(outcome.p_value < 0.001);
        assert!(outcome.statistic > 0.0);
        assert!((outcome.relative_improvement_pct - 10.0).abs() < 0.5);
    }

    #[test]
    fn below_min_sample_reports_insignificant_zero_statistic() {
        let baseline: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let candidate: Vec<f64> = (0..10).map(|i| 200.0 + i as f64).collect();
        let outcome = welch_t_test(&baseline, &candidate, &TTestConfig::default());
        assert!(!outcome.significant);
        assert_eq!(outcome.statistic, 0.0);
    }

    #[test]
    fn statistic_is_antisymmetric() {
        let a = samples_around(100.0);
        let b = samples_around(95.0);
        let config = TTestConfig::default();
        let ab = welch_t_test(&a, &b, &config);
        let ba = welch_t_test(&b, &a, &config);
        assert!((ab.statistic + ba.statistic).abs() < 1e-9);
    }

    #[test]
    fn identical_distributions_are_not_significant() {
        let xs = samples_around(100.0);
        let outcome = welch_t_test(&xs, &xs.clone(), &TTestConfig::default());
        assert!(!outcome.significant);
        assert!((outcome.statistic).abs() < 1e-9);
        assert!(outcome.p_value > 0.9);
    }

    #[test]
    fn relative_improvement_handles_zero_baseline() {
        assert_eq!(relative_improvement_pct(0.0, 10.0), 0.0);
        assert_eq!(relative_improvement_pct(100.0, 70.0), -30.0);
    }

    #[test]
    fn bonferroni_five_metrics() {
        let significant = bonferroni(&[0.01, 0.03, 0.04, 0.06, 0.001], 0.05);
        assert_eq!(significant, vec![false, false, false, false, true]);
    }

    #[test]
    fn required_sample_size_for_half_sigma_effect() {
        // Classic n = 2(z_0.975 + z_0.8)^2 / 0.5^2 with sigma^2 = 1.
        assert_eq!(required_sample_size(0.5, 1.0, 0.05, 0.8), 63);
        assert_eq!(required_sample_size(0.0, 1.0, 0.05, 0.8), usize::MAX);
    }

    #[test]
    fn mde_shrinks_with_more_samples() {
        let wide = minimum_detectable_effect(1.0, 50, 0.05, 0.8);
        let narrow = minimum_detectable_effect(1.0, 200, 0.05, 0.8);
        assert!(narrow < wide);
        assert!(narrow > 0.0);
        assert_eq!(minimum_detectable_effect(1.0, 0, 0.05, 0.8), f64::INFINITY);
    }

    #[test]
    fn percentile_median_matches_classic_definition() {
        let xs = [5.0, 1.0, 3.0, 2.0, 4.0];
        assert_eq!(percentile(50.0, &xs), 3.0);
        let even = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(50.0, &even), 2.5);
    }

    #[test]
    fn percentile_boundaries() {
        let xs = [9.0, 1.0, 5.0];
        assert_eq!(percentile(0.0, &xs), 1.0);
        assert_eq!(percentile(100.0, &xs), 9.0);
        assert_eq!(percentile(50.0, &[]), 0.0);
        assert_eq!(percentile(-1.0, &xs), 0.0);
        assert_eq!(percentile(101.0, &xs), 0.0);
    }

    #[test]
    fn confidence_interval_brackets_the_mean() {
        let xs = samples_around(100.0);
        let (m, lower, upper) = confidence_interval_95(&xs);
        assert!(lower < m && m < upper);
        assert!((m - 100.2).abs() < 1e-9);
    }
}
