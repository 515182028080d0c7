//! # BDF solver for differential-algebraic systems F(t, y, y') = 0
//!
//! Variable-order (1-5), variable-step BDF method in Nordsieck difference
//! form. The implicit system solved at each step is the DAE residual itself:
//! with the predictor
//!
//! ```text
//! y_predict = sum_{i=0..order} D[i],     psi = D[1..order+1]^T gamma / alpha_k
//! ```
//!
//! the corrected solution is `y = y_predict + d` with time derivative
//!
//! ```text
//! y' = (psi + d) / c,      c = h / alpha_k
//! ```
//!
//! so Newton's method iterates on
//!
//! ```text
//! F(t_new, y_predict + d, (psi + d)/c) = 0
//! ```
//!
//! with the iteration matrix `dF/dy + (1/c) dF/dy'`. Assembling and solving
//! that matrix is delegated entirely to the [`DAESystem`]: the general rate
//! model answers with its Schur-complement block solver. A factorization
//! failure or a non-converged Schur iteration surfaces as a *recoverable*
//! error and the step is retried with half the step size; only a structural
//! failure aborts the integration.
//!
//! Forward sensitivities are advanced in staggered-direct fashion: the
//! sensitivity systems are linear DAEs sharing the iteration matrix, so each
//! direction costs one extra linear solve per accepted step. Sensitivities
//! participate in the local error test unless disabled.
//!
//! References: Byrne & Hindmarsh; Shampine & Reichelt (the MATLAB ODE
//! suite); Hindmarsh et al., SUNDIALS IDAS.

use nalgebra::{DMatrix, DVector};

use log::{debug, error, warn};

use crate::global::LinearSolveStatus;
use crate::numerical::DAE_BDF::common::{
    newton_tol, norm, scale_func, select_initial_step, validate_tol, NumberOrVec, EPS,
};

const MAX_ORDER: usize = 5;
const NEWTON_MAXITER: usize = 4;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

/// Callback surface the integrator drives. Implemented by the simulator,
/// which translates transformed time into real time and dispatches to the
/// model.
pub trait DAESystem {
    fn num_dofs(&self) -> usize;

    fn num_sens(&self) -> usize {
        0
    }

    /// DAE residual `res = F(t, y, ydot)`.
    fn residual(&mut self, t: f64, y: &[f64], ydot: &[f64], res: &mut [f64])
        -> Result<(), String>;

    /// Re-evaluates the system Jacobian `dF/dy` at the given point and marks
    /// the time-discretized blocks for re-factorization.
    fn update_jacobian(&mut self, t: f64, y: &[f64], ydot: &[f64]) -> Result<(), String>;

    /// The step size (and thus `alpha`) changed: the discretized blocks must
    /// be reassembled before the next solve, the Jacobian itself is still
    /// valid.
    fn notify_step_size_changed(&mut self);

    /// Solves `(dF/dy + alpha dF/dy') x = rhs` in place.
    fn linear_solve(
        &mut self,
        t: f64,
        alpha: f64,
        outer_tol: f64,
        rhs: &mut [f64],
        weight: &[f64],
        y: &[f64],
        ydot: &[f64],
    ) -> LinearSolveStatus;

    /// Refreshes cached parameter-derivative data (`dF/dp` columns) at the
    /// given point. Called once per step before the per-direction
    /// sensitivity right-hand sides.
    fn prepare_sensitivity_rhs(&mut self, _t: f64, _y: &[f64], _ydot: &[f64]) {}

    /// `rhs = -(dF/dy * s + dF/dy' * sdot + dF/dp_dir)`.
    fn sensitivity_rhs(
        &mut self,
        _dir: usize,
        _t: f64,
        _y: &[f64],
        _ydot: &[f64],
        _s: &[f64],
        _sdot: &[f64],
        _rhs: &mut [f64],
    ) {
    }
}

/// Non-fatal reasons a step attempt is repeated are handled internally;
/// these are the terminal outcomes of [`DAE_BDF::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Accepted,
    /// Unrecoverable failure (step size underflow, fatal linear solve, ...).
    Failed(String),
}

/// Transform applied to the difference array when the step size changes by
/// `step_ratio`.
///
/// The first `order + 1` history rows represent a polynomial on the old
/// step grid; re-expanding the same polynomial on the stretched grid
/// multiplies them by `(R(step_ratio) R(1))^T` with
///
/// ```text
/// R(r)[i, j] = prod_{m=1..i} (m - 1 - r j) / m,      R(r)[0, j] = 1
/// ```
///
/// (Shampine & Reichelt, the MATLAB ODE suite). Each column of `R` is the
/// running product of its factors, written out directly.
fn history_rescale_matrix(order: usize, step_ratio: f64) -> DMatrix<f64> {
    let build = |ratio: f64| -> DMatrix<f64> {
        let mut r = DMatrix::from_element(order + 1, order + 1, 1.0);
        for j in 0..=order {
            let mut running = 1.0;
            for i in 1..=order {
                running *= (i as f64 - 1.0 - ratio * j as f64) / i as f64;
                r[(i, j)] = running;
            }
        }
        r
    };
    build(step_ratio) * build(1.0)
}

fn rescale_history(history: &mut DMatrix<f64>, order: usize, step_ratio: f64) {
    let transform = history_rescale_matrix(order, step_ratio).transpose();
    let rescaled = transform * history.rows(0, order + 1);
    history.rows_mut(0, order + 1).copy_from(&rescaled);
}

/// Verdict on one modified-Newton update.
enum NewtonProgress {
    /// remaining error provably below the tolerance; apply and stop
    Converged,
    /// apply the update and keep iterating
    Advance,
    /// discard the update, the iteration cannot reach the tolerance
    Diverging,
}

/// Judges an update by the geometric-series error bound. For a contraction
/// with observed rate `rho = |u_k| / |u_{k-1}|` the distance to the fixed
/// point after applying `u_k` is at most
///
/// ```text
/// |u_{k+1}| + |u_{k+2}| + ... <= (rho + rho^2 + ...) |u_k| = rho / (1 - rho) |u_k|
/// ```
///
/// and after `m` further updates at the same rate the bound shrinks by
/// `rho^(m-1)`. The iteration is abandoned as soon as `rho >= 1` or the
/// bound cannot drop below `tol` within the `iters_left` updates that the
/// iteration budget still allows.
fn judge_newton_update(
    update_norm: f64,
    prev_update_norm: Option<f64>,
    iters_left: i32,
    tol: f64,
) -> NewtonProgress {
    if update_norm == 0.0 {
        return NewtonProgress::Converged;
    }
    let rho = match prev_update_norm {
        Some(prev) => update_norm / prev,
        // no rate estimate yet after the first update
        None => return NewtonProgress::Advance,
    };
    if rho >= 1.0 {
        return NewtonProgress::Diverging;
    }
    let remaining_bound = rho / (1.0 - rho) * update_norm;
    if remaining_bound * rho.powi(iters_left - 1) > tol {
        return NewtonProgress::Diverging;
    }
    if remaining_bound < tol {
        return NewtonProgress::Converged;
    }
    NewtonProgress::Advance
}

/// Step factor a method of order `candidate_order` could sustain given its
/// weighted local error estimate: the local error of an order-q BDF scales
/// like `h^(q + 1)`, so the admissible step scales like
/// `err^(-1 / (q + 1))`. A vanishing estimate allows the maximum growth.
fn order_step_factor(candidate_order: usize, err_norm: f64) -> f64 {
    if err_norm == 0.0 {
        MAX_FACTOR
    } else {
        err_norm.powf(-1.0 / (candidate_order as f64 + 1.0))
    }
}

/// BDF integrator state. The [`DAESystem`] is passed into each call so the
/// caller keeps ownership of the model between sections.
pub struct DAE_BDF {
    pub t: f64,
    pub y: DVector<f64>,
    pub ydot: DVector<f64>,
    t_bound: f64,
    max_step: f64,
    rtol: NumberOrVec,
    atol: NumberOrVec,
    rtol_sens: NumberOrVec,
    atol_sens: NumberOrVec,
    /// include sensitivities in the local error test
    pub sens_error_control: bool,
    newton_tol: f64,
    n: usize,
    h_abs: f64,
    order: usize,
    n_equal_steps: usize,
    d_array: DMatrix<f64>,
    sens: Vec<DMatrix<f64>>,
    sens_y: Vec<DVector<f64>>,
    sens_ydot: Vec<DVector<f64>>,
    gamma: DVector<f64>,
    alpha: DVector<f64>,
    error_const: DVector<f64>,
    /// discretized blocks factorized for the current (Jacobian, alpha) pair
    lu_valid: bool,
    pub nsteps: usize,
    pub nfev: usize,
    pub njev: usize,
}

impl DAE_BDF {
    pub fn new(
        n: usize,
        rtol: NumberOrVec,
        atol: NumberOrVec,
        max_step: f64,
    ) -> Result<Self, String> {
        validate_tol(&rtol, &atol, n)?;

        // kappa are the BDF stabilization coefficients, gamma the cumulative
        // harmonic sums; alpha = (1 - kappa) * gamma
        let kappa = DVector::from_vec(vec![0.0, -0.1850, -1.0 / 9.0, -0.0823, -0.0415, 0.0]);
        let gamma = {
            let mut g = vec![0.0];
            let mut cumsum = 0.0;
            for i in 1..=MAX_ORDER {
                cumsum += 1.0 / (i as f64);
                g.push(cumsum);
            }
            DVector::from_vec(g)
        };
        let alpha =
            (DVector::from(vec![1.0; MAX_ORDER + 1]) - kappa.clone()).component_mul(&gamma);
        let error_const = kappa.component_mul(&gamma)
            + DVector::from_iterator(MAX_ORDER + 1, (1..=MAX_ORDER + 1).map(|i| 1.0 / i as f64));

        let tol = newton_tol(&rtol);
        Ok(DAE_BDF {
            t: 0.0,
            y: DVector::zeros(n),
            ydot: DVector::zeros(n),
            t_bound: 0.0,
            max_step,
            rtol_sens: rtol.clone(),
            atol_sens: atol.clone(),
            rtol,
            atol,
            sens_error_control: true,
            newton_tol: tol,
            n,
            h_abs: 0.0,
            order: 1,
            n_equal_steps: 0,
            d_array: DMatrix::zeros(MAX_ORDER + 3, n),
            sens: Vec::new(),
            sens_y: Vec::new(),
            sens_ydot: Vec::new(),
            gamma,
            alpha,
            error_const,
            lu_valid: false,
            nsteps: 0,
            nfev: 0,
            njev: 0,
        })
    }

    pub fn set_sensitivity_tolerances(&mut self, rtol: NumberOrVec, atol: NumberOrVec) {
        self.rtol_sens = rtol;
        self.atol_sens = atol;
    }

    /// (Re-)initializes the history from consistent `(t0, y0, ydot0)`. Called
    /// at the start of integration and after every discontinuous section
    /// transition.
    pub fn reset(
        &mut self,
        t0: f64,
        y0: &[f64],
        ydot0: &[f64],
        t_bound: f64,
        first_step: Option<f64>,
    ) -> Result<(), String> {
        assert_eq!(y0.len(), self.n);
        self.t = t0;
        self.t_bound = t_bound;
        self.y = DVector::from_column_slice(y0);
        self.ydot = DVector::from_column_slice(ydot0);
        let h_abs = match first_step {
            Some(h) => {
                if h <= 0.0 {
                    return Err("`first_step` must be positive".to_string());
                }
                h.min(self.max_step)
            }
            None => select_initial_step(
                t0,
                t_bound,
                &self.y,
                &self.ydot,
                self.max_step,
                &self.rtol,
                &self.atol,
            )
            .max(1e-10),
        };
        self.h_abs = h_abs;
        self.order = 1;
        self.n_equal_steps = 0;
        self.d_array = DMatrix::zeros(MAX_ORDER + 3, self.n);
        self.d_array.set_row(0, &self.y.transpose());
        self.d_array.set_row(1, &(self.ydot.transpose() * h_abs));
        for (dir, ds) in self.sens.iter_mut().enumerate() {
            *ds = DMatrix::zeros(MAX_ORDER + 3, self.n);
            ds.set_row(0, &self.sens_y[dir].transpose());
            ds.set_row(1, &(self.sens_ydot[dir].transpose() * h_abs));
        }
        self.lu_valid = false;
        Ok(())
    }

    /// Installs consistent sensitivity initial values, one pair per AD
    /// direction. Must be called before `reset`ting for them to enter the
    /// history.
    pub fn set_sens_initial(&mut self, s0: Vec<DVector<f64>>, sdot0: Vec<DVector<f64>>) {
        assert_eq!(s0.len(), sdot0.len());
        self.sens = s0
            .iter()
            .map(|_| DMatrix::zeros(MAX_ORDER + 3, self.n))
            .collect();
        self.sens_y = s0;
        self.sens_ydot = sdot0;
    }

    pub fn num_sens(&self) -> usize {
        self.sens_y.len()
    }

    pub fn sens_state(&self, dir: usize) -> (&DVector<f64>, &DVector<f64>) {
        (&self.sens_y[dir], &self.sens_ydot[dir])
    }

    /// Pushes the integration target further out without touching history
    /// (continuous section transition).
    pub fn set_t_bound(&mut self, t_bound: f64) {
        self.t_bound = t_bound;
    }

    pub fn finished(&self) -> bool {
        self.t >= self.t_bound - 10.0 * EPS * self.t_bound.abs().max(1.0)
    }

    fn scale_of(&self, y: &DVector<f64>) -> DVector<f64> {
        scale_func(&self.rtol, &self.atol, &y.abs())
    }

    /// One accepted BDF step (internally retries on error-test and Newton
    /// failures). Integration is forward in (transformed) time only.
    pub fn step<S: DAESystem>(&mut self, system: &mut S) -> StepResult {
        let t = self.t;
        let max_step = self.max_step;
        let min_step = 10.0 * EPS * t.abs().max(1.0);

        let mut h_abs = self.h_abs;
        if h_abs > max_step {
            rescale_history(&mut self.d_array, self.order, max_step / h_abs);
            self.rescale_sens_history(max_step / h_abs);
            self.n_equal_steps = 0;
            h_abs = max_step;
        } else if h_abs < min_step {
            rescale_history(&mut self.d_array, self.order, min_step / h_abs);
            self.rescale_sens_history(min_step / h_abs);
            self.n_equal_steps = 0;
            h_abs = min_step;
        }

        let order = self.order;
        let mut current_jac = false;
        let mut step_accepted = false;

        let mut t_new = t;
        let mut correction = DVector::zeros(self.n);
        let mut y_new = DVector::zeros(self.n);
        let mut ydot_new = DVector::zeros(self.n);
        let mut scale = DVector::zeros(self.n);
        let mut safety = 0.9;
        let mut error_norm = 0.0;
        let mut n_iter = 0usize;
        let mut c = 0.0;
        let mut psi = DVector::zeros(self.n);

        while !step_accepted {
            if h_abs < min_step {
                return StepResult::Failed("step size too small".to_string());
            }

            t_new = t + h_abs;
            if t_new > self.t_bound {
                t_new = self.t_bound;
                rescale_history(&mut self.d_array, order, (t_new - t).abs() / h_abs);
                self.rescale_sens_history((t_new - t).abs() / h_abs);
                self.n_equal_steps = 0;
                self.lu_valid = false;
                system.notify_step_size_changed();
            }
            let h = t_new - t;
            h_abs = h.abs();

            let y_predict: DVector<f64> =
                self.d_array.rows(0, order + 1).row_sum().transpose();
            scale = self.scale_of(&y_predict);
            psi = self.d_array.rows(1, order).transpose() * self.gamma.rows(1, order)
                / self.alpha[order];
            c = h / self.alpha[order];
            let alpha_newton = 1.0 / c;

            // weights for the inner (Schur) iteration
            let weight: Vec<f64> = scale.iter().map(|s| 1.0 / s).collect();

            correction.fill(0.0);
            let mut converged = false;
            let mut fatal: Option<String> = None;

            loop {
                if !self.lu_valid {
                    system.notify_step_size_changed();
                    self.lu_valid = true;
                }

                let mut prev_update_norm: Option<f64> = None;
                let mut res = vec![0.0; self.n];
                converged = false;
                for k in 0..NEWTON_MAXITER {
                    for i in 0..self.n {
                        y_new[i] = y_predict[i] + correction[i];
                        ydot_new[i] = (psi[i] + correction[i]) / c;
                    }
                    self.nfev += 1;
                    if let Err(e) =
                        system.residual(t_new, y_new.as_slice(), ydot_new.as_slice(), &mut res)
                    {
                        fatal = Some(e);
                        break;
                    }
                    if !res.iter().all(|x| x.is_finite()) {
                        break;
                    }
                    for r in res.iter_mut() {
                        *r = -*r;
                    }
                    let status = system.linear_solve(
                        t_new,
                        alpha_newton,
                        self.newton_tol,
                        &mut res,
                        &weight,
                        y_new.as_slice(),
                        ydot_new.as_slice(),
                    );
                    match status {
                        LinearSolveStatus::Ok => {}
                        LinearSolveStatus::Recoverable => {
                            debug!("recoverable linear solve failure at t = {}", t_new);
                            break;
                        }
                        LinearSolveStatus::Fatal => {
                            fatal = Some("fatal linear solve failure".to_string());
                            break;
                        }
                    }
                    let update = DVector::from_column_slice(&res);
                    let update_norm = norm(&update.component_div(&scale));
                    match judge_newton_update(
                        update_norm,
                        prev_update_norm,
                        (NEWTON_MAXITER - k) as i32,
                        self.newton_tol,
                    ) {
                        NewtonProgress::Diverging => break,
                        NewtonProgress::Converged => {
                            correction += &update;
                            n_iter = k + 1;
                            converged = true;
                            break;
                        }
                        NewtonProgress::Advance => {
                            correction += &update;
                            n_iter = k + 1;
                            prev_update_norm = Some(update_norm);
                        }
                    }
                }

                if let Some(msg) = fatal.take() {
                    return StepResult::Failed(msg);
                }
                if converged {
                    break;
                }
                if !current_jac {
                    // retry once with a fresh Jacobian at the predicted point
                    let ydot_predict = &psi / c;
                    self.njev += 1;
                    if let Err(e) = system.update_jacobian(
                        t_new,
                        y_predict.as_slice(),
                        ydot_predict.as_slice(),
                    ) {
                        return StepResult::Failed(e);
                    }
                    self.lu_valid = false;
                    current_jac = true;
                    correction.fill(0.0);
                } else {
                    break;
                }
            }

            if !converged {
                let factor = 0.5;
                h_abs *= factor;
                rescale_history(&mut self.d_array, order, factor);
                self.rescale_sens_history(factor);
                self.n_equal_steps = 0;
                self.lu_valid = false;
                system.notify_step_size_changed();
                current_jac = false;
                continue;
            }

            safety = 0.9 * (2.0 * NEWTON_MAXITER as f64 + 1.0)
                / (2.0 * NEWTON_MAXITER as f64 + n_iter as f64);
            scale = self.scale_of(&y_new);
            let error = self.error_const[order] * &correction;
            error_norm = norm(&error.component_div(&scale));

            if error_norm > 1.0 {
                let factor =
                    (safety * error_norm.powf(-1.0 / (order as f64 + 1.0))).max(MIN_FACTOR);
                h_abs *= factor;
                rescale_history(&mut self.d_array, order, factor);
                self.rescale_sens_history(factor);
                self.n_equal_steps = 0;
                self.lu_valid = false;
                system.notify_step_size_changed();
                continue;
            }

            // staggered-direct sensitivities on the converged step
            if self.num_sens() > 0 {
                match self.advance_sensitivities(
                    system, t_new, &y_new, &ydot_new, c, order, safety,
                ) {
                    SensOutcome::Ok => {}
                    SensOutcome::Reject(factor) => {
                        h_abs *= factor;
                        rescale_history(&mut self.d_array, order, factor);
                        self.rescale_sens_history(factor);
                        self.n_equal_steps = 0;
                        self.lu_valid = false;
                        system.notify_step_size_changed();
                        continue;
                    }
                    SensOutcome::Fatal(msg) => return StepResult::Failed(msg),
                }
            }

            step_accepted = true;
        }

        self.nsteps += 1;
        self.n_equal_steps += 1;
        self.t = t_new;
        self.y = y_new;
        self.ydot = ydot_new;
        self.h_abs = h_abs;

        Self::update_difference_array(&mut self.d_array, &correction, order);

        if self.n_equal_steps < order + 1 {
            return StepResult::Accepted;
        }

        // Order control, possible only after order + 1 equal steps filled
        // the history consistently: the difference rows adjacent to the
        // current order carry the error estimates of the order - 1 and
        // order + 1 methods. Every candidate order is scored by the step
        // factor it could sustain; the best one wins the next stretch.
        let mut best_order = order;
        let mut best_factor = order_step_factor(order, error_norm);
        if order > 1 {
            let err_down = norm(
                &(self.error_const[order - 1] * self.d_array.row(order).transpose())
                    .component_div(&scale),
            );
            let factor_down = order_step_factor(order - 1, err_down);
            if factor_down > best_factor {
                best_factor = factor_down;
                best_order = order - 1;
            }
        }
        if order < MAX_ORDER {
            let err_up = norm(
                &(self.error_const[order + 1] * self.d_array.row(order + 2).transpose())
                    .component_div(&scale),
            );
            let factor_up = order_step_factor(order + 1, err_up);
            if factor_up > best_factor {
                best_factor = factor_up;
                best_order = order + 1;
            }
        }
        self.order = best_order;

        let factor = (safety * best_factor).min(MAX_FACTOR);
        self.h_abs *= factor;
        rescale_history(&mut self.d_array, self.order, factor);
        self.rescale_sens_history(factor);
        self.n_equal_steps = 0;
        self.lu_valid = false;
        system.notify_step_size_changed();

        StepResult::Accepted
    }

    fn rescale_sens_history(&mut self, factor: f64) {
        let order = self.order;
        for ds in self.sens.iter_mut() {
            rescale_history(ds, order, factor);
        }
    }

    /// Folds an accepted correction into the difference array:
    /// `D[order+2] = corr - D[order+1]; D[order+1] = corr; D[i] += D[i+1]`.
    fn update_difference_array(
        d_array: &mut DMatrix<f64>,
        correction: &DVector<f64>,
        order: usize,
    ) {
        let prev = d_array.row(order + 1).clone_owned();
        d_array.set_row(order + 2, &(correction.transpose() - prev.transpose()));
        d_array.set_row(order + 1, &correction.transpose());
        for i in (0..order + 1).rev() {
            let next = d_array.row(i + 1).clone_owned();
            let mut row = d_array.row_mut(i);
            row += next.transpose();
        }
    }

    fn advance_sensitivities<S: DAESystem>(
        &mut self,
        system: &mut S,
        t_new: f64,
        y_new: &DVector<f64>,
        ydot_new: &DVector<f64>,
        c: f64,
        order: usize,
        safety: f64,
    ) -> SensOutcome {
        system.prepare_sensitivity_rhs(t_new, y_new.as_slice(), ydot_new.as_slice());

        let n_dirs = self.num_sens();
        let alpha_newton = 1.0 / c;
        let mut corrections: Vec<DVector<f64>> = Vec::with_capacity(n_dirs);
        let mut worst_error: f64 = 0.0;

        for dir in 0..n_dirs {
            let s_predict: DVector<f64> =
                self.sens[dir].rows(0, order + 1).row_sum().transpose();
            let psi_s = self.sens[dir].rows(1, order).transpose()
                * self.gamma.rows(1, order)
                / self.alpha[order];
            let sdot_predict = &psi_s / c;

            let mut rhs = vec![0.0; self.n];
            system.sensitivity_rhs(
                dir,
                t_new,
                y_new.as_slice(),
                ydot_new.as_slice(),
                s_predict.as_slice(),
                sdot_predict.as_slice(),
                &mut rhs,
            );

            let scale_s = scale_func(&self.rtol_sens, &self.atol_sens, &s_predict.abs());
            let weight: Vec<f64> = scale_s.iter().map(|s| 1.0 / s).collect();
            let status = system.linear_solve(
                t_new,
                alpha_newton,
                self.newton_tol,
                &mut rhs,
                &weight,
                y_new.as_slice(),
                ydot_new.as_slice(),
            );
            match status {
                LinearSolveStatus::Ok => {}
                LinearSolveStatus::Recoverable => {
                    warn!("recoverable linear solve failure in sensitivity system {}", dir);
                    return SensOutcome::Reject(0.5);
                }
                LinearSolveStatus::Fatal => {
                    error!("fatal linear solve failure in sensitivity system {}", dir);
                    return SensOutcome::Fatal(
                        "fatal linear solve failure in sensitivity system".to_string(),
                    );
                }
            }
            let d_s = DVector::from_column_slice(&rhs);

            if self.sens_error_control {
                let s_corr = &s_predict + &d_s;
                let scale_s = scale_func(&self.rtol_sens, &self.atol_sens, &s_corr.abs());
                let error = self.error_const[order] * &d_s;
                worst_error = worst_error.max(norm(&error.component_div(&scale_s)));
            }

            self.sens_y[dir] = &s_predict + &d_s;
            self.sens_ydot[dir] = (&psi_s + &d_s) / c;
            corrections.push(d_s);
        }

        if self.sens_error_control && worst_error > 1.0 {
            let factor =
                (safety * worst_error.powf(-1.0 / (order as f64 + 1.0))).max(MIN_FACTOR);
            return SensOutcome::Reject(factor);
        }

        for (dir, d_s) in corrections.iter().enumerate() {
            Self::update_difference_array(&mut self.sens[dir], d_s, order);
        }
        SensOutcome::Ok
    }
}

enum SensOutcome {
    Ok,
    Reject(f64),
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// y0' = -y0,  0 = y1 - y0  (index-1 DAE, solution e^{-t} twice)
    struct DecayDae;

    impl DAESystem for DecayDae {
        fn num_dofs(&self) -> usize {
            2
        }
        fn residual(
            &mut self,
            _t: f64,
            y: &[f64],
            ydot: &[f64],
            res: &mut [f64],
        ) -> Result<(), String> {
            res[0] = ydot[0] + y[0];
            res[1] = y[1] - y[0];
            Ok(())
        }
        fn update_jacobian(&mut self, _t: f64, _y: &[f64], _ydot: &[f64]) -> Result<(), String> {
            Ok(())
        }
        fn notify_step_size_changed(&mut self) {}
        fn linear_solve(
            &mut self,
            _t: f64,
            alpha: f64,
            _outer_tol: f64,
            rhs: &mut [f64],
            _weight: &[f64],
            _y: &[f64],
            _ydot: &[f64],
        ) -> LinearSolveStatus {
            // M = [[1 + alpha, 0], [-1, 1]]
            let x0 = rhs[0] / (1.0 + alpha);
            let x1 = rhs[1] + x0;
            rhs[0] = x0;
            rhs[1] = x1;
            LinearSolveStatus::Ok
        }
    }

    #[test]
    fn test_decay_dae() {
        let mut solver = DAE_BDF::new(
            2,
            NumberOrVec::Number(1e-8),
            NumberOrVec::Number(1e-10),
            1.0,
        )
        .unwrap();
        let mut system = DecayDae;
        solver
            .reset(0.0, &[1.0, 1.0], &[-1.0, -1.0], 1.0, None)
            .unwrap();
        while !solver.finished() {
            match solver.step(&mut system) {
                StepResult::Accepted => {}
                StepResult::Failed(msg) => panic!("step failed: {}", msg),
            }
        }
        let exact = (-1.0f64).exp();
        assert_relative_eq!(solver.y[0], exact, epsilon = 1e-6);
        assert_relative_eq!(solver.y[1], exact, epsilon = 1e-6);
        // the algebraic constraint holds exactly at the solution
        assert_relative_eq!(solver.y[1] - solver.y[0], 0.0, epsilon = 1e-10);
    }

    /// A linear solver that fails recoverably a fixed number of times,
    /// exercising the retry-with-smaller-step path.
    struct FlakyDae {
        failures_left: usize,
    }

    impl DAESystem for FlakyDae {
        fn num_dofs(&self) -> usize {
            1
        }
        fn residual(
            &mut self,
            _t: f64,
            y: &[f64],
            ydot: &[f64],
            res: &mut [f64],
        ) -> Result<(), String> {
            res[0] = ydot[0] + 2.0 * y[0];
            Ok(())
        }
        fn update_jacobian(&mut self, _t: f64, _y: &[f64], _ydot: &[f64]) -> Result<(), String> {
            Ok(())
        }
        fn notify_step_size_changed(&mut self) {}
        fn linear_solve(
            &mut self,
            _t: f64,
            alpha: f64,
            _outer_tol: f64,
            rhs: &mut [f64],
            _weight: &[f64],
            _y: &[f64],
            _ydot: &[f64],
        ) -> LinearSolveStatus {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return LinearSolveStatus::Recoverable;
            }
            // dF/dy + alpha dF/dydot = 2 + alpha
            rhs[0] /= 2.0 + alpha;
            LinearSolveStatus::Ok
        }
    }

    #[test]
    fn test_recoverable_solve_retries() {
        let mut solver = DAE_BDF::new(
            1,
            NumberOrVec::Number(1e-6),
            NumberOrVec::Number(1e-9),
            0.5,
        )
        .unwrap();
        let mut system = FlakyDae { failures_left: 3 };
        solver.reset(0.0, &[1.0], &[-2.0], 0.5, None).unwrap();
        while !solver.finished() {
            match solver.step(&mut system) {
                StepResult::Accepted => {}
                StepResult::Failed(msg) => panic!("step failed: {}", msg),
            }
        }
        assert_eq!(system.failures_left, 0);
        assert_relative_eq!(solver.y[0], (-1.0f64).exp(), epsilon = 1e-4);
    }

    #[test]
    fn test_step_hits_t_bound_exactly() {
        let mut solver = DAE_BDF::new(
            2,
            NumberOrVec::Number(1e-6),
            NumberOrVec::Number(1e-9),
            10.0,
        )
        .unwrap();
        let mut system = DecayDae;
        solver
            .reset(0.0, &[1.0, 1.0], &[-1.0, -1.0], 0.3, None)
            .unwrap();
        while !solver.finished() {
            assert_eq!(solver.step(&mut system), StepResult::Accepted);
        }
        assert_relative_eq!(solver.t, 0.3, epsilon = 1e-12);
    }
}
