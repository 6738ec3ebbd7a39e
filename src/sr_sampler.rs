//! Parameter-fitted probability distributions.
//!
//! Scenario latencies and amounts are described by their mean and 95th
//! percentile. This module turns such a description into native
//! distribution parameters and draws samples from it.
//!
//! - **Lognormal**: closed-form inversion of mean and p95.
//! - **Gamma**: shape found by bisection so that the fitted p95 matches,
//!   with the quantile computed from the regularized lower incomplete gamma
//!   function.
//!
//! Degenerate descriptions (non-positive or non-finite mean/p95) sample as
//! zero instead of failing.

use std::cell::RefCell;

use hashbrown::HashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Standard normal 95th-percentile quantile
pub const Z_95: f64 = 1.644_853_626_951_472_2;

const UNIFORM_FLOOR: f64 = 1e-12;
const GAMMA_SHAPE_RANGE: (f64, f64) = (0.2, 20.0);
const GAMMA_FIT_ITERATIONS: usize = 60;
const GAMMA_QUANTILE_ITERATIONS: usize = 100;
const INCOMPLETE_GAMMA_MAX_ITER: usize = 500;
const INCOMPLETE_GAMMA_EPS: f64 = 1e-14;

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEFFICIENTS: [f64; 9] = [
    0.999_999_999_999_809_93,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_13,
    -176.615_029_162_140_59,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_571_6e-6,
    1.505_632_735_149_311_6e-7,
];

// ============================================================================
// Distribution Description
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DistributionKind {
    Lognormal,
    Gamma,
}

/// A distribution described by its mean and 95th percentile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSpec {
    pub kind: DistributionKind,
    pub mean: f64,
    pub p95: f64,
}

impl DistributionSpec {
    pub fn lognormal(mean: f64, p95: f64) -> Self {
        Self {
            kind: DistributionKind::Lognormal,
            mean,
            p95,
        }
    }

    pub fn gamma(mean: f64, p95: f64) -> Self {
        Self {
            kind: DistributionKind::Gamma,
            mean,
            p95,
        }
    }

    /// Non-positive or non-finite parameters; such a distribution samples as zero
    pub fn is_degenerate(&self) -> bool {
        !(self.mean.is_finite() && self.p95.is_finite()) || self.mean <= 0.0 || self.p95 <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LognormalParams {
    pub mu: f64,
    pub sigma: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaParams {
    pub shape: f64,
    pub scale: f64,
}

// ============================================================================
// Sampling
// ============================================================================

thread_local! {
    // keyed by (mean, p95) bit patterns; a fit is a pure function of both
    static GAMMA_FITS: RefCell<HashMap<(u64, u64), Option<GammaParams>>> =
        RefCell::new(HashMap::new());
}

/// `fit_gamma` memoised per thread
pub fn cached_fit_gamma(mean: f64, p95: f64) -> Option<GammaParams> {
    GAMMA_FITS.with(|fits| {
        *fits
            .borrow_mut()
            .entry((mean.to_bits(), p95.to_bits()))
            .or_insert_with(|| fit_gamma(mean, p95))
    })
}

/// Draw one sample. Lognormal parameters are closed form. Gamma fits are
/// cached per thread; the cached fit is bit-identical to a fresh one, so
/// streams do not depend on which thread ran first.
pub fn sample<R: RngCore>(rng: &mut R, spec: &DistributionSpec) -> f64 {
    if spec.is_degenerate() {
        return 0.0;
    }
    match spec.kind {
        DistributionKind::Lognormal => match fit_lognormal(spec.mean, spec.p95) {
            Some(params) => (params.mu + params.sigma * standard_normal(rng)).exp(),
            None => 0.0,
        },
        DistributionKind::Gamma => match cached_fit_gamma(spec.mean, spec.p95) {
            Some(params) => sample_gamma(rng, params.shape) * params.scale,
            None => 0.0,
        },
    }
}

/// Uniform float in [0, 1) built from one 32-bit draw
#[inline]
pub fn uniform<R: RngCore>(rng: &mut R) -> f64 {
    rng.next_u32() as f64 / 4_294_967_296.0
}

/// Bernoulli trial with probability `p`
#[inline]
pub fn chance<R: RngCore>(rng: &mut R, p: f64) -> bool {
    uniform(rng) < p
}

/// Box-Muller transform; both uniforms are floored away from zero
pub fn standard_normal<R: RngCore>(rng: &mut R) -> f64 {
    let u1 = uniform(rng).max(UNIFORM_FLOOR);
    let u2 = uniform(rng).max(UNIFORM_FLOOR);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Exponential inter-arrival time for a rate in events per second
pub fn exponential<R: RngCore>(rng: &mut R, rate: f64) -> f64 {
    if rate <= 0.0 || !rate.is_finite() {
        return f64::INFINITY;
    }
    let u = uniform(rng).max(UNIFORM_FLOOR);
    -u.ln() / rate
}

/// Marsaglia-Tsang with unit scale. Shapes below one are boosted once.
pub fn sample_gamma<R: RngCore>(rng: &mut R, shape: f64) -> f64 {
    if shape <= 0.0 || !shape.is_finite() {
        return 0.0;
    }

    let (effective_shape, boost) = if shape < 1.0 {
        (shape + 1.0, Some(1.0 / shape))
    } else {
        (shape, None)
    };

    let d = effective_shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    let value = loop {
        let x = standard_normal(rng);
        let v = 1.0 + c * x;
        if v <= 0.0 {
            continue;
        }
        let v = v * v * v;
        let u = uniform(rng).max(UNIFORM_FLOOR);
        if u < 1.0 - 0.0331 * x.powi(4) {
            break d * v;
        }
        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            break d * v;
        }
    };

    match boost {
        Some(exponent) => value * uniform(rng).max(UNIFORM_FLOOR).powf(exponent),
        None => value,
    }
}

// ============================================================================
// Fitting
// ============================================================================

/// Solve `0.5σ² − zσ + (ln p95 − ln mean) = 0` for the smallest non-negative σ
pub fn fit_lognormal(mean: f64, p95: f64) -> Option<LognormalParams> {
    if !(mean.is_finite() && p95.is_finite()) || mean <= 0.0 || p95 <= 0.0 {
        return None;
    }

    let d = p95.ln() - mean.ln();
    let root = (Z_95 * Z_95 - 2.0 * d).max(0.0).sqrt();
    let sigma = if Z_95 - root >= 0.0 {
        Z_95 - root
    } else {
        Z_95 + root
    };
    let mu = mean.ln() - 0.5 * sigma * sigma;

    Some(LognormalParams { mu, sigma })
}

/// Bisection on shape so that the fitted 95th percentile matches `p95`.
///
/// Returns the best estimate after a fixed number of steps even when the
/// target lies outside the searchable shape range.
pub fn fit_gamma(mean: f64, p95: f64) -> Option<GammaParams> {
    if !(mean.is_finite() && p95.is_finite()) || mean <= 0.0 || p95 <= 0.0 {
        return None;
    }

    let (mut lo, mut hi) = GAMMA_SHAPE_RANGE;
    for _ in 0..GAMMA_FIT_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        let q = gamma_quantile(0.95, mid, mean / mid);
        // the quantile shrinks toward the mean as shape grows
        if q > p95 {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let shape = 0.5 * (lo + hi);
    Some(GammaParams {
        shape,
        scale: mean / shape,
    })
}

/// Quantile of Gamma(shape, scale) by bisecting the CDF
pub fn gamma_quantile(p: f64, shape: f64, scale: f64) -> f64 {
    if p <= 0.0 || shape <= 0.0 || scale <= 0.0 {
        return 0.0;
    }

    let mut hi = (shape * scale).max(1e-9) * 2.0;
    let mut expansions = 0;
    while regularized_lower_gamma(shape, hi / scale) < p && expansions < 200 {
        hi *= 2.0;
        expansions += 1;
    }

    let mut lo = 0.0;
    for _ in 0..GAMMA_QUANTILE_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        if regularized_lower_gamma(shape, mid / scale) < p {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

// ============================================================================
// Special Functions
// ============================================================================

/// ln Γ(z) via the Lanczos approximation, with reflection below 0.5
pub fn ln_gamma(z: f64) -> f64 {
    if z < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * z).sin()).abs().ln() - ln_gamma(1.0 - z);
    }

    let z = z - 1.0;
    let mut x = LANCZOS_COEFFICIENTS[0];
    for (i, coefficient) in LANCZOS_COEFFICIENTS.iter().enumerate().skip(1) {
        x += coefficient / (z + i as f64);
    }
    let t = z + LANCZOS_G + 0.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (z + 0.5) * t.ln() - t + x.ln()
}

/// Regularized lower incomplete gamma P(a, x)
pub fn regularized_lower_gamma(a: f64, x: f64) -> f64 {
    if x <= 0.0 || a <= 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        lower_gamma_series(a, x)
    } else {
        1.0 - upper_gamma_continued_fraction(a, x)
    }
}

fn lower_gamma_series(a: f64, x: f64) -> f64 {
    let mut ap = a;
    let mut term = 1.0 / a;
    let mut sum = term;
    for _ in 0..INCOMPLETE_GAMMA_MAX_ITER {
        ap += 1.0;
        term *= x / ap;
        sum += term;
        if term.abs() < sum.abs() * INCOMPLETE_GAMMA_EPS {
            break;
        }
    }
    (sum * (-x + a * x.ln() - ln_gamma(a)).exp()).clamp(0.0, 1.0)
}

/// Q(a, x) by the modified Lentz continued fraction
fn upper_gamma_continued_fraction(a: f64, x: f64) -> f64 {
    const TINY: f64 = 1e-300;

    let mut b = x + 1.0 - a;
    let mut c = 1.0 / TINY;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=INCOMPLETE_GAMMA_MAX_ITER {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < TINY {
            d = TINY;
        }
        c = b + an / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < INCOMPLETE_GAMMA_EPS {
            break;
        }
    }
    ((-x + a * x.ln() - ln_gamma(a)).exp() * h).clamp(0.0, 1.0)
}
