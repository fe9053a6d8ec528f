//! Two-proportion significance testing between variant aggregates.
//!
//! Implements the classical pooled two-proportion z-test with a two-sided
//! p-value, Cohen's h effect size, per-variant Wald confidence intervals,
//! and an advisory post-hoc power estimate. The normal CDF uses the
//! Abramowitz-Stegun 7.1.26 error-function polynomial (max absolute error
//! 1.5e-7); every path is a pure function of its inputs, so repeated
//! evaluation of the same aggregates produces bit-identical reports.
//!
//! Power is advisory only ("keep running longer"); it is never a
//! promotion gate.

use serde::{Deserialize, Serialize};

use crate::experiment_config::ConfidenceLevel;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Binary-outcome sample for one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProportionSample {
    pub samples: u64,
    pub successes: u64,
}

impl ProportionSample {
    pub fn new(samples: u64, successes: u64) -> Self {
        Self { samples, successes }
    }

    pub fn rate(&self) -> Option<f64> {
        if self.samples == 0 {
            return None;
        }
        Some(self.successes as f64 / self.samples as f64)
    }
}

// ---------------------------------------------------------------------------
// Effect size
// ---------------------------------------------------------------------------

/// Cohen's conventional magnitude classes for |h|.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectMagnitude {
    Negligible,
    Small,
    Medium,
    Large,
}

impl EffectMagnitude {
    pub fn classify(effect_size_h: f64) -> Self {
        let magnitude = effect_size_h.abs();
        if magnitude < 0.2 {
            Self::Negligible
        } else if magnitude < 0.5 {
            Self::Small
        } else if magnitude < 0.8 {
            Self::Medium
        } else {
            Self::Large
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Negligible => "negligible",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Wald interval for one variant's rate, clamped to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

/// Full evaluation of the difference between two variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceReport {
    pub samples_a: u64,
    pub samples_b: u64,
    pub rate_a: f64,
    pub rate_b: f64,
    pub z_statistic: f64,
    /// Two-sided p-value in (0, 1].
    pub p_value: f64,
    pub is_significant: bool,
    pub confidence_level: ConfidenceLevel,
    /// Cohen's h, signed: positive when A's rate exceeds B's.
    pub effect_size_h: f64,
    pub effect_magnitude: EffectMagnitude,
    pub interval_a: ConfidenceInterval,
    pub interval_b: ConfidenceInterval,
    /// Advisory probability of detecting the observed difference at the
    /// current sample sizes.
    pub power: f64,
}

/// Evaluation result. Zero samples on either side yields
/// `InsufficientData` rather than a fabricated p-value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SignificanceOutcome {
    InsufficientData { samples_a: u64, samples_b: u64 },
    Computed(SignificanceReport),
}

impl SignificanceOutcome {
    pub fn report(&self) -> Option<&SignificanceReport> {
        match self {
            Self::Computed(report) => Some(report),
            Self::InsufficientData { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate the difference between variant A and variant B samples.
pub fn evaluate(
    sample_a: ProportionSample,
    sample_b: ProportionSample,
    confidence_level: ConfidenceLevel,
) -> SignificanceOutcome {
    let (Some(rate_a), Some(rate_b)) = (sample_a.rate(), sample_b.rate()) else {
        return SignificanceOutcome::InsufficientData {
            samples_a: sample_a.samples,
            samples_b: sample_b.samples,
        };
    };

    let n_a = sample_a.samples as f64;
    let n_b = sample_b.samples as f64;

    // Pooled two-proportion z-test.
    let pooled =
        (sample_a.successes + sample_b.successes) as f64 / (sample_a.samples + sample_b.samples) as f64;
    let pooled_se = (pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b)).sqrt();
    let (z_statistic, p_value) = if pooled_se > 0.0 {
        let z = (rate_b - rate_a) / pooled_se;
        (z, two_sided_p(z))
    } else {
        // Pooled rate is exactly 0 or 1: both variants at the same
        // extreme, no evidence of a difference.
        (0.0, 1.0)
    };
    let is_significant = p_value < confidence_level.alpha();

    let effect_size_h = 2.0 * (rate_a.sqrt().asin() - rate_b.sqrt().asin());

    let z_critical = confidence_level.z_two_sided();
    let interval_a = wald_interval(rate_a, n_a, z_critical);
    let interval_b = wald_interval(rate_b, n_b, z_critical);

    let power = post_hoc_power(rate_a, n_a, rate_b, n_b, z_critical);

    SignificanceOutcome::Computed(SignificanceReport {
        samples_a: sample_a.samples,
        samples_b: sample_b.samples,
        rate_a,
        rate_b,
        z_statistic,
        p_value,
        is_significant,
        confidence_level,
        effect_size_h,
        effect_magnitude: EffectMagnitude::classify(effect_size_h),
        interval_a,
        interval_b,
        power,
    })
}

fn two_sided_p(z: f64) -> f64 {
    let p = 2.0 * (1.0 - normal_cdf(z.abs()));
    p.clamp(f64::MIN_POSITIVE, 1.0)
}

fn wald_interval(rate: f64, n: f64, z_critical: f64) -> ConfidenceInterval {
    let half_width = z_critical * (rate * (1.0 - rate) / n).sqrt();
    ConfidenceInterval {
        lower: (rate - half_width).max(0.0),
        upper: (rate + half_width).min(1.0),
    }
}

/// Post-hoc power: probability a test at the configured level detects
/// the observed rate difference given the current sample sizes.
fn post_hoc_power(rate_a: f64, n_a: f64, rate_b: f64, n_b: f64, z_critical: f64) -> f64 {
    let delta = (rate_b - rate_a).abs();
    let se = (rate_a * (1.0 - rate_a) / n_a + rate_b * (1.0 - rate_b) / n_b).sqrt();
    if se <= 0.0 {
        return if delta > 0.0 { 1.0 } else { 0.0 };
    }
    normal_cdf(delta / se - z_critical).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Normal CDF (Abramowitz-Stegun 7.1.26)
// ---------------------------------------------------------------------------

/// Standard normal CDF via the error function.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz-Stegun 7.1.26 polynomial approximation of erf.
/// Maximum absolute error 1.5e-7.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_samples_yield_insufficient_data() {
        let outcome = evaluate(
            ProportionSample::new(0, 0),
            ProportionSample::new(100, 90),
            ConfidenceLevel::NinetyFive,
        );
        assert_eq!(
            outcome,
            SignificanceOutcome::InsufficientData { samples_a: 0, samples_b: 100 }
        );
        assert!(outcome.report().is_none());
    }

    #[test]
    fn normal_cdf_matches_reference_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.9750).abs() < 1e-4);
        assert!((normal_cdf(-1.96) - 0.0250).abs() < 1e-4);
        assert!((normal_cdf(2.5758) - 0.9950).abs() < 1e-4);
    }

    #[test]
    fn clear_difference_is_significant() {
        // 97.0% vs 98.5% over 10k samples each: z is around 7, far past
        // any supported confidence level.
        let outcome = evaluate(
            ProportionSample::new(10_000, 9_700),
            ProportionSample::new(10_000, 9_850),
            ConfidenceLevel::NinetyFive,
        );
        let report = outcome.report().expect("computed");
        assert!(report.is_significant);
        assert!(report.p_value < 0.001);
        assert!(report.z_statistic > 5.0);
        assert!((report.rate_a - 0.97).abs() < 1e-12);
        assert!((report.rate_b - 0.985).abs() < 1e-12);
    }

    #[test]
    fn identical_rates_are_not_significant() {
        let outcome = evaluate(
            ProportionSample::new(5_000, 4_500),
            ProportionSample::new(5_000, 4_500),
            ConfidenceLevel::NinetyFive,
        );
        let report = outcome.report().expect("computed");
        assert!(!report.is_significant);
        assert!((report.p_value - 1.0).abs() < 1e-9);
        assert_eq!(report.z_statistic, 0.0);
    }

    #[test]
    fn small_samples_with_large_gap_are_inconclusive() {
        // Same rates as the textbook case, but at 50 samples the pooled
        // standard error dwarfs the difference.
        let outcome = evaluate(
            ProportionSample::new(50, 48),
            ProportionSample::new(50, 49),
            ConfidenceLevel::NinetyFive,
        );
        let report = outcome.report().expect("computed");
        assert!(!report.is_significant);
        assert!(report.p_value > 0.05);
    }

    #[test]
    fn degenerate_pooled_rate_reads_as_no_evidence() {
        let outcome = evaluate(
            ProportionSample::new(100, 100),
            ProportionSample::new(200, 200),
            ConfidenceLevel::NinetyNine,
        );
        let report = outcome.report().expect("computed");
        assert_eq!(report.p_value, 1.0);
        assert!(!report.is_significant);
    }

    #[test]
    fn effect_size_sign_follows_rate_order() {
        let outcome = evaluate(
            ProportionSample::new(1_000, 900),
            ProportionSample::new(1_000, 700),
            ConfidenceLevel::NinetyFive,
        );
        let report = outcome.report().expect("computed");
        assert!(report.effect_size_h > 0.0, "A ahead of B gives positive h");

        let reversed = evaluate(
            ProportionSample::new(1_000, 700),
            ProportionSample::new(1_000, 900),
            ConfidenceLevel::NinetyFive,
        );
        let reversed = reversed.report().expect("computed");
        assert!(reversed.effect_size_h < 0.0);
        assert_eq!(report.effect_magnitude, reversed.effect_magnitude);
    }

    #[test]
    fn effect_magnitude_classes_use_cohens_cutoffs() {
        assert_eq!(EffectMagnitude::classify(0.1), EffectMagnitude::Negligible);
        assert_eq!(EffectMagnitude::classify(-0.3), EffectMagnitude::Small);
        assert_eq!(EffectMagnitude::classify(0.6), EffectMagnitude::Medium);
        assert_eq!(EffectMagnitude::classify(-1.2), EffectMagnitude::Large);
    }

    #[test]
    fn confidence_intervals_cover_the_rate_and_stay_in_range() {
        let outcome = evaluate(
            ProportionSample::new(200, 190),
            ProportionSample::new(200, 170),
            ConfidenceLevel::NinetyFive,
        );
        let report = outcome.report().expect("computed");
        for (interval, rate) in [
            (report.interval_a, report.rate_a),
            (report.interval_b, report.rate_b),
        ] {
            assert!(interval.lower <= rate && rate <= interval.upper);
            assert!(interval.lower >= 0.0);
            assert!(interval.upper <= 1.0);
        }
    }

    #[test]
    fn power_grows_with_sample_size() {
        let small = evaluate(
            ProportionSample::new(100, 90),
            ProportionSample::new(100, 95),
            ConfidenceLevel::NinetyFive,
        );
        let large = evaluate(
            ProportionSample::new(10_000, 9_000),
            ProportionSample::new(10_000, 9_500),
            ConfidenceLevel::NinetyFive,
        );
        let small_power = small.report().expect("computed").power;
        let large_power = large.report().expect("computed").power;
        assert!(large_power > small_power);
        assert!(large_power > 0.99, "large samples detect a 5-point gap");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let a = ProportionSample::new(3_333, 3_001);
        let b = ProportionSample::new(3_456, 3_210);
        let first = evaluate(a, b, ConfidenceLevel::Ninety);
        for _ in 0..10 {
            assert_eq!(evaluate(a, b, ConfidenceLevel::Ninety), first);
        }
    }

    #[test]
    fn stricter_levels_demand_smaller_p_values() {
        // A borderline difference: significant at 80%, not at 99%.
        let a = ProportionSample::new(400, 340);
        let b = ProportionSample::new(400, 358);
        let loose = evaluate(a, b, ConfidenceLevel::Eighty);
        let strict = evaluate(a, b, ConfidenceLevel::NinetyNine);
        let loose = loose.report().expect("computed");
        let strict = strict.report().expect("computed");
        assert_eq!(loose.p_value, strict.p_value);
        assert!(loose.is_significant);
        assert!(!strict.is_significant);
    }
}
