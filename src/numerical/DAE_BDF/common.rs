//! some utilities shared by the DAE solver: tolerance handling, weighted
//! norms and initial step selection

use nalgebra::DVector;

pub const EPS: f64 = f64::EPSILON;

// rtol or atol can be a number or a vector
#[derive(Debug, Clone, PartialEq)]
pub enum NumberOrVec {
    Number(f64),
    Vec(Vec<f64>),
}

/// Weighted root-mean-square norm used for error control:
/// ```text
/// ||v||_rms = ||v||_2 / sqrt(n)
/// ```
pub fn norm(vector: &DVector<f64>) -> f64 {
    if vector.is_empty() {
        return 0.0;
    }
    vector.norm() / (vector.len() as f64).sqrt()
}

/// Newton tolerance derived from the relative tolerance, as in the scipy
/// BDF implementation.
pub fn newton_tol(rtol: &NumberOrVec) -> f64 {
    let rtol_min = match rtol {
        NumberOrVec::Number(r) => *r,
        NumberOrVec::Vec(r) => r
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min),
    };
    f64::max(10.0 * EPS / rtol_min, f64::min(0.03, rtol_min.powf(0.5)))
}

pub fn validate_tol(
    rtol: &NumberOrVec,
    atol: &NumberOrVec,
    n: usize,
) -> Result<(), &'static str> {
    match rtol {
        NumberOrVec::Number(r) => {
            if *r <= 0.0 {
                return Err("`rtol` must be positive.");
            }
        }
        NumberOrVec::Vec(r) => {
            if r.len() != n {
                return Err("`rtol` vector has wrong length.");
            }
            if r.iter().any(|&x| x <= 0.0) {
                return Err("`rtol` must be positive.");
            }
        }
    }
    match atol {
        NumberOrVec::Number(a) => {
            if *a < 0.0 {
                return Err("`atol` must be non-negative.");
            }
        }
        NumberOrVec::Vec(a) => {
            if a.len() != n {
                return Err("`atol` vector has wrong length.");
            }
            if a.iter().any(|&x| x < 0.0) {
                return Err("`atol` must be non-negative.");
            }
        }
    }
    Ok(())
}

/// Elementwise scale `atol_i + rtol_i * |y_i|` used for the error norm and
/// as the reciprocal of the integrator error weights.
pub fn scale_func(rtol: &NumberOrVec, atol: &NumberOrVec, y: &DVector<f64>) -> DVector<f64> {
    let n = y.len();
    DVector::from_fn(n, |i, _| {
        let r = match rtol {
            NumberOrVec::Number(r) => *r,
            NumberOrVec::Vec(r) => r[i],
        };
        let a = match atol {
            NumberOrVec::Number(a) => *a,
            NumberOrVec::Vec(a) => a[i],
        };
        a + y[i].abs() * r
    })
}

/// Initial step size for the DAE. With a consistent `(y0, ydot0)` in hand,
/// the curvature is unknown, so the step is chosen from the ratio of the
/// state and derivative norms and clipped to the integration interval.
pub fn select_initial_step(
    t0: f64,
    t_bound: f64,
    y0: &DVector<f64>,
    ydot0: &DVector<f64>,
    max_step: f64,
    rtol: &NumberOrVec,
    atol: &NumberOrVec,
) -> f64 {
    let interval = (t_bound - t0).abs();
    if interval == 0.0 {
        return 0.0;
    }
    let scale = scale_func(rtol, atol, y0);
    let d0 = norm(&y0.component_div(&scale));
    let d1 = norm(&ydot0.component_div(&scale));
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };
    h0.min(interval).min(max_step)
}
