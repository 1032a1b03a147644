//! Two-proportion significance arithmetic for variant evaluation.
//!
//! Pooled z-test over (impressions, conversions) with a one-sided p-value
//! in each direction. The normal CDF uses the Abramowitz–Stegun 7.1.26
//! rational approximation (max error ~1.5e-7), which is far below any
//! alpha a marketing experiment runs at.

/// Outcome of comparing a variant against control.
#[derive(Debug, Clone, Copy)]
pub struct TestResult {
    /// z-statistic for (variant rate - control rate).
    pub z: f64,
    /// One-sided p-value that the variant is an improvement.
    pub p_improve: f64,
    /// One-sided p-value that the variant is a degradation.
    pub p_degrade: f64,
}

/// Pooled two-proportion z-test. Returns `None` when either arm has zero
/// impressions or the pooled rate is degenerate (all or no conversions),
/// where the statistic is undefined.
pub fn two_proportion(
    control_n: u64,
    control_x: u64,
    variant_n: u64,
    variant_x: u64,
) -> Option<TestResult> {
    if control_n == 0 || variant_n == 0 {
        return None;
    }
    let n_c = control_n as f64;
    let n_v = variant_n as f64;
    let p_c = control_x as f64 / n_c;
    let p_v = variant_x as f64 / n_v;

    let pooled = (control_x + variant_x) as f64 / (n_c + n_v);
    let se = (pooled * (1.0 - pooled) * (1.0 / n_c + 1.0 / n_v)).sqrt();
    if se == 0.0 || !se.is_finite() {
        return None;
    }

    let z = (p_v - p_c) / se;
    Some(TestResult {
        z,
        p_improve: normal_sf(z),
        p_degrade: normal_sf(-z),
    })
}

/// Standard normal CDF.
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Standard normal survival function.
pub fn normal_sf(z: f64) -> f64 {
    1.0 - normal_cdf(z)
}

/// Abramowitz–Stegun 7.1.26.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}
