//! Wiener first-passage-time density.
//!
//! Lower-boundary density of a diffusion with unit boundary separation and
//! zero drift uses the Navarro & Fuss (2009) small/large-time series, taking
//! whichever needs fewer terms for the requested error. Drift variability is
//! integrated analytically; start-point and non-decision variability are
//! averaged with Simpson's rule.
//!
//! Reaction times are signed: positive for upper-boundary responses,
//! negative for lower-boundary responses.

use std::f64::consts::PI;

/// Parameters of a single trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DdmParams {
    pub a: f64,
    pub v: f64,
    pub t: f64,
    /// Relative starting point in (0, 1).
    pub z: f64,
    pub sv: f64,
    pub sz: f64,
    pub st: f64,
}

impl Default for DdmParams {
    fn default() -> Self {
        Self {
            a: 1.0,
            v: 0.0,
            t: 0.3,
            z: 0.5,
            sv: 0.0,
            sz: 0.0,
            st: 0.0,
        }
    }
}

impl DdmParams {
    pub fn is_valid(&self) -> bool {
        let finite = [self.a, self.v, self.t, self.z, self.sv, self.sz, self.st]
            .iter()
            .all(|x| x.is_finite());
        finite
            && self.a > 0.0
            && self.t >= 0.0
            && self.sv >= 0.0
            && self.st >= 0.0
            && self.sz >= 0.0
            && self.z - self.sz / 2.0 > 0.0
            && self.z + self.sz / 2.0 < 1.0
    }
}

/// Numerical settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integration {
    /// Truncation error of the series.
    pub err: f64,
    /// Simpson intervals over start-point variability (even).
    pub n_sz: usize,
    /// Simpson intervals over non-decision variability (even).
    pub n_st: usize,
}

impl Default for Integration {
    fn default() -> Self {
        Self {
            err: 1e-4,
            n_sz: 2,
            n_st: 2,
        }
    }
}

/// Below these widths a variability parameter is treated as zero.
const MIN_SZ: f64 = 1e-3;
const MIN_ST: f64 = 1e-3;

/// Density at normalized time `u` of absorbing at the lower boundary of a
/// zero-drift, unit-separation process starting at `w`.
pub fn ftt_01w(u: f64, w: f64, err: f64) -> f64 {
    if u <= 0.0 {
        return 0.0;
    }
    // Terms needed by the large-time series.
    let kl = if PI * u * err < 1.0 {
        let k = (-2.0 * (PI * u * err).ln() / (PI * PI * u)).sqrt();
        k.max(1.0 / (PI * u.sqrt()))
    } else {
        1.0 / (PI * u.sqrt())
    };
    // Terms needed by the small-time series.
    let ks = if 2.0 * (2.0 * PI * u).sqrt() * err < 1.0 {
        let k = 2.0 + (-2.0 * u * (2.0 * (2.0 * PI * u).sqrt() * err).ln()).sqrt();
        k.max(u.sqrt() + 1.0)
    } else {
        2.0
    };

    if ks < kl {
        small_time(u, w, ks.ceil() as i64)
    } else {
        large_time(u, w, kl.ceil() as i64)
    }
}

fn small_time(u: f64, w: f64, k: i64) -> f64 {
    let sum: f64 = (-((k - 1) / 2)..=k / 2)
        .map(|i| {
            let x = w + 2.0 * i as f64;
            x * (-(x * x) / (2.0 * u)).exp()
        })
        .sum();
    sum / (2.0 * PI * u.powi(3)).sqrt()
}

fn large_time(u: f64, w: f64, k: i64) -> f64 {
    let sum: f64 = (1..=k)
        .map(|i| {
            let i = i as f64;
            i * (-(i * i) * PI * PI * u / 2.0).exp() * (i * PI * w).sin()
        })
        .sum();
    sum * PI
}

/// Lower-boundary density at decision time `x` with normally distributed
/// drift (`sv = 0` gives the plain Wiener density).
pub fn pdf_sv(x: f64, v: f64, sv: f64, a: f64, z: f64, err: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let p = ftt_01w(x / (a * a), z, err);
    if p <= 0.0 {
        return 0.0;
    }
    let var = sv * sv;
    let exponent =
        ((a * z * sv).powi(2) - 2.0 * a * v * z - v * v * x) / (2.0 * var * x + 2.0);
    (p.ln() + exponent).exp() / (var * x + 1.0).sqrt() / (a * a)
}

/// Mean of `f` over `[lo, hi]` by composite Simpson with `n` intervals.
fn simpson_mean(lo: f64, hi: f64, n: usize, f: impl Fn(f64) -> f64) -> f64 {
    let n = n.max(2) + n % 2;
    let h = (hi - lo) / n as f64;
    let inner: f64 = (1..n)
        .map(|i| {
            let w = if i % 2 == 1 { 4.0 } else { 2.0 };
            w * f(lo + i as f64 * h)
        })
        .sum();
    (f(lo) + f(hi) + inner) * h / 3.0 / (hi - lo)
}

/// Density of the signed reaction time `x` under the full model.
pub fn full_pdf(x: f64, p: &DdmParams, int: &Integration) -> f64 {
    let (v, z) = if x > 0.0 { (-p.v, 1.0 - p.z) } else { (p.v, p.z) };
    let x = x.abs();
    let at = |z: f64, t: f64| pdf_sv(x - t, v, p.sv, p.a, z, int.err);

    match (p.sz >= MIN_SZ, p.st >= MIN_ST) {
        (false, false) => at(z, p.t),
        (false, true) => simpson_mean(p.t, p.t + p.st, int.n_st, |t| at(z, t)),
        (true, false) => {
            simpson_mean(z - p.sz / 2.0, z + p.sz / 2.0, int.n_sz, |z| at(z, p.t))
        }
        (true, true) => simpson_mean(z - p.sz / 2.0, z + p.sz / 2.0, int.n_sz, |z| {
            simpson_mean(p.t, p.t + p.st, int.n_st, |t| at(z, t))
        }),
    }
}

/// Log density of one trial; `-inf` for invalid parameters or zero density.
pub fn log_density(x: f64, p: &DdmParams, int: &Integration) -> f64 {
    if !p.is_valid() || !x.is_finite() {
        return f64::NEG_INFINITY;
    }
    let d = full_pdf(x, p, int);
    if d > 0.0 && d.is_finite() {
        d.ln()
    } else {
        f64::NEG_INFINITY
    }
}
