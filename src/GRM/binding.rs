//! # Binding models
//!
//! Adsorption kinetics and isotherms attached to the bound states of each
//! particle shell. Every model can run in kinetic mode,
//!
//! ```text
//! dq_i/dt = f_bind,i(c_p, q)
//! ```
//!
//! or quasi-stationary mode, where the same equations become algebraic,
//! `f_bind,i(c_p, q) = 0`, and form the (contiguous) algebraic block of the
//! DAE. Dispatch over the concrete models is a capability trait plus a
//! tagged enum (`enum_dispatch`): the hot methods (`jacobian`,
//! `jacobian_add_discretized`, the per-shell algebraic solve) monomorphize
//! into a jump-free match.

use enum_dispatch::enum_dispatch;
use log::warn;

use crate::autodiff::Active;
use crate::somelinalg::band_matrix::FactorizableBandMatrix;
use crate::somelinalg::dense_matrix::DenseMatrixView;

const NEWTON_MAX_ITER: usize = 100;
const NEWTON_MAX_DAMPING: usize = 10;

#[enum_dispatch]
pub trait BindingModel {
    fn name(&self) -> &'static str;

    /// bound states per component
    fn n_bound(&self) -> &[usize];

    fn stride_bound(&self) -> usize;

    fn is_kinetic(&self) -> bool;

    fn has_algebraic_equations(&self) -> bool;

    /// contiguous row range (start, len) of the algebraic equations within
    /// the bound states of one shell
    fn algebraic_block(&self) -> (usize, usize);

    /// doubles of scratch needed by `consistent_initial_state`
    fn consistent_initialization_workspace_size(&self) -> usize;

    /// binding rate `f_bind` for one shell, `out` has `stride_bound` entries
    fn flux(&self, t: f64, z: f64, r: f64, sec: usize, cp: &[f64], q: &[f64], out: &mut [f64]);

    /// AD twin of `flux`; parameters carry their sensitivity directions
    fn flux_active(
        &self,
        t: Active,
        z: f64,
        r: f64,
        sec: usize,
        cp: &[Active],
        q: &[Active],
        out: &mut [Active],
    );

    /// dense local Jacobian `d f_bind / d (c_p, q)` for one shell, row-major
    /// `stride_bound x (n_comp + stride_bound)`
    fn jacobian(&self, t: f64, z: f64, r: f64, sec: usize, cp: &[f64], q: &[f64], jac: &mut [f64]);

    /// adds `alpha * dF_bind/dq_dot` to the diagonal of the bound-state rows
    /// starting at `row0`; a no-op for quasi-stationary models
    fn jacobian_add_discretized(&self, alpha: f64, fbm: &mut FactorizableBandMatrix, row0: usize);

    /// solves the algebraic equations of one shell for `q` at fixed `c_p`
    /// (damped Newton on the dense scratch view)
    fn consistent_initial_state(
        &self,
        t: f64,
        z: f64,
        r: f64,
        sec: usize,
        cp: &[f64],
        q: &mut [f64],
        tol: f64,
        workspace: &mut [f64],
        jac_data: &mut [f64],
        pivots: &mut [usize],
    ) -> Result<(), String>;

    fn set_parameter_value(&mut self, name: &str, comp: usize, value: f64) -> bool;

    fn set_parameter_ad_seed(&mut self, name: &str, comp: usize, dir: usize, seed: f64) -> bool;

    fn clear_parameter_seeds(&mut self);

    fn get_parameter_value(&self, name: &str, comp: usize) -> Option<f64>;
}

#[enum_dispatch(BindingModel)]
#[derive(Debug, Clone)]
pub enum BindingVariant {
    NoBinding,
    LinearBinding,
    LangmuirBinding,
}

/// Damped Newton iteration on `f(q) = 0` shared by the quasi-stationary
/// models. `flux_fn` fills the residual, `jac_fn` the dense square
/// Jacobian `df/dq` (row-major `n x n`).
fn newton_algebraic<FF, JF>(
    n: usize,
    tol: f64,
    flux_fn: FF,
    jac_fn: JF,
    q: &mut [f64],
    workspace: &mut [f64],
    jac_data: &mut [f64],
    pivots: &mut [usize],
) -> Result<(), String>
where
    FF: Fn(&[f64], &mut [f64]),
    JF: Fn(&[f64], &mut [f64]),
{
    assert!(workspace.len() >= 3 * n);
    let (f, rest) = workspace.split_at_mut(n);
    let (dq, q_trial) = rest.split_at_mut(n);
    let q_trial = &mut q_trial[..n];

    flux_fn(q, f);
    let mut f_norm = f.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if f_norm <= tol {
        return Ok(());
    }

    for _iter in 0..NEWTON_MAX_ITER {
        let mut jac = DenseMatrixView::new(jac_data, pivots, n);
        let mut dense = vec![0.0; n * n];
        jac_fn(q, &mut dense);
        for rr in 0..n {
            for cc in 0..n {
                jac.set(rr, cc, dense[rr * n + cc]);
            }
        }
        if !jac.factorize() {
            return Err("singular binding Jacobian".to_string());
        }
        dq.copy_from_slice(&f[..n]);
        for v in dq.iter_mut() {
            *v = -*v;
        }
        if !jac.solve(dq) {
            return Err("binding Jacobian solve failed".to_string());
        }

        // damped update: halve the step until the residual decreases
        let mut lambda = 1.0;
        let mut accepted = false;
        for _damp in 0..NEWTON_MAX_DAMPING {
            for i in 0..n {
                q_trial[i] = q[i] + lambda * dq[i];
            }
            flux_fn(q_trial, f);
            let trial_norm = f.iter().fold(0.0f64, |m, v| m.max(v.abs()));
            if trial_norm < f_norm || trial_norm <= tol {
                q[..n].copy_from_slice(q_trial);
                f_norm = trial_norm;
                accepted = true;
                break;
            }
            lambda *= 0.5;
        }
        if !accepted {
            return Err(format!(
                "binding Newton stalled, residual {}",
                f_norm
            ));
        }
        if f_norm <= tol {
            return Ok(());
        }
    }
    Err(format!(
        "binding Newton did not converge, residual {}",
        f_norm
    ))
}

/// Component with no bound states at all (pure transport).
#[derive(Debug, Clone)]
pub struct NoBinding {
    n_bound: Vec<usize>,
}

impl NoBinding {
    pub fn new(n_comp: usize) -> Self {
        NoBinding {
            n_bound: vec![0; n_comp],
        }
    }
}

impl BindingModel for NoBinding {
    fn name(&self) -> &'static str {
        "NONE"
    }
    fn n_bound(&self) -> &[usize] {
        &self.n_bound
    }
    fn stride_bound(&self) -> usize {
        0
    }
    fn is_kinetic(&self) -> bool {
        true
    }
    fn has_algebraic_equations(&self) -> bool {
        false
    }
    fn algebraic_block(&self) -> (usize, usize) {
        (0, 0)
    }
    fn consistent_initialization_workspace_size(&self) -> usize {
        0
    }
    fn flux(
        &self,
        _t: f64,
        _z: f64,
        _r: f64,
        _sec: usize,
        _cp: &[f64],
        _q: &[f64],
        _out: &mut [f64],
    ) {
    }
    fn flux_active(
        &self,
        _t: Active,
        _z: f64,
        _r: f64,
        _sec: usize,
        _cp: &[Active],
        _q: &[Active],
        _out: &mut [Active],
    ) {
    }
    fn jacobian(
        &self,
        _t: f64,
        _z: f64,
        _r: f64,
        _sec: usize,
        _cp: &[f64],
        _q: &[f64],
        _jac: &mut [f64],
    ) {
    }
    fn jacobian_add_discretized(
        &self,
        _alpha: f64,
        _fbm: &mut FactorizableBandMatrix,
        _row0: usize,
    ) {
    }
    fn consistent_initial_state(
        &self,
        _t: f64,
        _z: f64,
        _r: f64,
        _sec: usize,
        _cp: &[f64],
        _q: &mut [f64],
        _tol: f64,
        _workspace: &mut [f64],
        _jac_data: &mut [f64],
        _pivots: &mut [usize],
    ) -> Result<(), String> {
        Ok(())
    }
    fn set_parameter_value(&mut self, _name: &str, _comp: usize, _value: f64) -> bool {
        false
    }
    fn set_parameter_ad_seed(&mut self, _name: &str, _comp: usize, _dir: usize, _seed: f64) -> bool {
        false
    }
    fn clear_parameter_seeds(&mut self) {}
    fn get_parameter_value(&self, _name: &str, _comp: usize) -> Option<f64> {
        None
    }
}

/// Linear isotherm, `f_i = ka_i c_p,i - kd_i q_i`.
#[derive(Debug, Clone)]
pub struct LinearBinding {
    kinetic: bool,
    n_bound: Vec<usize>,
    /// component of each bound state
    bound_comp: Vec<usize>,
    ka: Vec<Active>,
    kd: Vec<Active>,
}

impl LinearBinding {
    pub fn new(n_bound: Vec<usize>, kinetic: bool, ka: Vec<f64>, kd: Vec<f64>) -> Self {
        let bound_comp = bound_component_map(&n_bound);
        LinearBinding {
            kinetic,
            n_bound,
            bound_comp,
            ka: ka.into_iter().map(Active::constant).collect(),
            kd: kd.into_iter().map(Active::constant).collect(),
        }
    }
}

fn bound_component_map(n_bound: &[usize]) -> Vec<usize> {
    let mut map = Vec::new();
    for (comp, nb) in n_bound.iter().enumerate() {
        for _ in 0..*nb {
            map.push(comp);
        }
    }
    map
}

impl BindingModel for LinearBinding {
    fn name(&self) -> &'static str {
        "LINEAR"
    }
    fn n_bound(&self) -> &[usize] {
        &self.n_bound
    }
    fn stride_bound(&self) -> usize {
        self.bound_comp.len()
    }
    fn is_kinetic(&self) -> bool {
        self.kinetic
    }
    fn has_algebraic_equations(&self) -> bool {
        !self.kinetic && !self.bound_comp.is_empty()
    }
    fn algebraic_block(&self) -> (usize, usize) {
        if self.has_algebraic_equations() {
            (0, self.stride_bound())
        } else {
            (0, 0)
        }
    }
    fn consistent_initialization_workspace_size(&self) -> usize {
        3 * self.stride_bound()
    }
    fn flux(&self, _t: f64, _z: f64, _r: f64, _sec: usize, cp: &[f64], q: &[f64], out: &mut [f64]) {
        for (b, &comp) in self.bound_comp.iter().enumerate() {
            out[b] = self.ka[comp].value() * cp[comp] - self.kd[comp].value() * q[b];
        }
    }
    fn flux_active(
        &self,
        _t: Active,
        _z: f64,
        _r: f64,
        _sec: usize,
        cp: &[Active],
        q: &[Active],
        out: &mut [Active],
    ) {
        for (b, &comp) in self.bound_comp.iter().enumerate() {
            out[b] = self.ka[comp] * cp[comp] - self.kd[comp] * q[b];
        }
    }
    fn jacobian(
        &self,
        _t: f64,
        _z: f64,
        _r: f64,
        _sec: usize,
        _cp: &[f64],
        _q: &[f64],
        jac: &mut [f64],
    ) {
        let nb = self.stride_bound();
        let n_comp = self.n_bound.len();
        let cols = n_comp + nb;
        for v in jac.iter_mut() {
            *v = 0.0;
        }
        for (b, &comp) in self.bound_comp.iter().enumerate() {
            jac[b * cols + comp] = self.ka[comp].value();
            jac[b * cols + n_comp + b] = -self.kd[comp].value();
        }
    }
    fn jacobian_add_discretized(&self, alpha: f64, fbm: &mut FactorizableBandMatrix, row0: usize) {
        if !self.kinetic {
            return;
        }
        for b in 0..self.stride_bound() {
            let mut row = fbm.row_mut(row0 + b);
            row[0] += alpha;
        }
    }
    fn consistent_initial_state(
        &self,
        t: f64,
        z: f64,
        r: f64,
        sec: usize,
        cp: &[f64],
        q: &mut [f64],
        tol: f64,
        workspace: &mut [f64],
        jac_data: &mut [f64],
        pivots: &mut [usize],
    ) -> Result<(), String> {
        if !self.has_algebraic_equations() {
            return Ok(());
        }
        let nb = self.stride_bound();
        let n_comp = self.n_bound.len();
        let cols = n_comp + nb;
        newton_algebraic(
            nb,
            tol,
            |qq, out| self.flux(t, z, r, sec, cp, qq, out),
            |qq, dense| {
                let mut full = vec![0.0; nb * cols];
                self.jacobian(t, z, r, sec, cp, qq, &mut full);
                for rr in 0..nb {
                    for cc in 0..nb {
                        dense[rr * nb + cc] = full[rr * cols + n_comp + cc];
                    }
                }
            },
            q,
            workspace,
            jac_data,
            pivots,
        )
    }
    fn set_parameter_value(&mut self, name: &str, comp: usize, value: f64) -> bool {
        match name {
            "LIN_KA" => {
                self.ka[comp] = Active::constant(value);
                true
            }
            "LIN_KD" => {
                self.kd[comp] = Active::constant(value);
                true
            }
            _ => false,
        }
    }
    fn set_parameter_ad_seed(&mut self, name: &str, comp: usize, dir: usize, seed: f64) -> bool {
        match name {
            "LIN_KA" => {
                self.ka[comp].set_ad_value(dir, seed);
                true
            }
            "LIN_KD" => {
                self.kd[comp].set_ad_value(dir, seed);
                true
            }
            _ => false,
        }
    }
    fn clear_parameter_seeds(&mut self) {
        for v in self.ka.iter_mut().chain(self.kd.iter_mut()) {
            v.clear_gradient();
        }
    }
    fn get_parameter_value(&self, name: &str, comp: usize) -> Option<f64> {
        match name {
            "LIN_KA" => Some(self.ka[comp].value()),
            "LIN_KD" => Some(self.kd[comp].value()),
            _ => None,
        }
    }
}

/// Multi-component Langmuir isotherm,
/// ```text
/// f_i = ka_i c_p,i q_max,i (1 - sum_j q_j / q_max,j) - kd_i q_i
/// ```
#[derive(Debug, Clone)]
pub struct LangmuirBinding {
    kinetic: bool,
    n_bound: Vec<usize>,
    bound_comp: Vec<usize>,
    ka: Vec<Active>,
    kd: Vec<Active>,
    qmax: Vec<Active>,
}

impl LangmuirBinding {
    pub fn new(
        n_bound: Vec<usize>,
        kinetic: bool,
        ka: Vec<f64>,
        kd: Vec<f64>,
        qmax: Vec<f64>,
    ) -> Self {
        let bound_comp = bound_component_map(&n_bound);
        LangmuirBinding {
            kinetic,
            n_bound,
            bound_comp,
            ka: ka.into_iter().map(Active::constant).collect(),
            kd: kd.into_iter().map(Active::constant).collect(),
            qmax: qmax.into_iter().map(Active::constant).collect(),
        }
    }
}

impl BindingModel for LangmuirBinding {
    fn name(&self) -> &'static str {
        "MULTI_COMPONENT_LANGMUIR"
    }
    fn n_bound(&self) -> &[usize] {
        &self.n_bound
    }
    fn stride_bound(&self) -> usize {
        self.bound_comp.len()
    }
    fn is_kinetic(&self) -> bool {
        self.kinetic
    }
    fn has_algebraic_equations(&self) -> bool {
        !self.kinetic && !self.bound_comp.is_empty()
    }
    fn algebraic_block(&self) -> (usize, usize) {
        if self.has_algebraic_equations() {
            (0, self.stride_bound())
        } else {
            (0, 0)
        }
    }
    fn consistent_initialization_workspace_size(&self) -> usize {
        3 * self.stride_bound()
    }
    fn flux(&self, _t: f64, _z: f64, _r: f64, _sec: usize, cp: &[f64], q: &[f64], out: &mut [f64]) {
        let mut theta = 1.0;
        for (b, &comp) in self.bound_comp.iter().enumerate() {
            theta -= q[b] / self.qmax[comp].value();
        }
        for (b, &comp) in self.bound_comp.iter().enumerate() {
            out[b] = self.ka[comp].value() * cp[comp] * self.qmax[comp].value() * theta
                - self.kd[comp].value() * q[b];
        }
    }
    fn flux_active(
        &self,
        _t: Active,
        _z: f64,
        _r: f64,
        _sec: usize,
        cp: &[Active],
        q: &[Active],
        out: &mut [Active],
    ) {
        let mut theta = Active::constant(1.0);
        for (b, &comp) in self.bound_comp.iter().enumerate() {
            theta = theta - q[b] / self.qmax[comp];
        }
        for (b, &comp) in self.bound_comp.iter().enumerate() {
            out[b] = self.ka[comp] * cp[comp] * self.qmax[comp] * theta - self.kd[comp] * q[b];
        }
    }
    fn jacobian(
        &self,
        _t: f64,
        _z: f64,
        _r: f64,
        _sec: usize,
        cp: &[f64],
        q: &[f64],
        jac: &mut [f64],
    ) {
        let nb = self.stride_bound();
        let n_comp = self.n_bound.len();
        let cols = n_comp + nb;
        for v in jac.iter_mut() {
            *v = 0.0;
        }
        let mut theta = 1.0;
        for (b, &comp) in self.bound_comp.iter().enumerate() {
            theta -= q[b] / self.qmax[comp].value();
        }
        for (b, &comp) in self.bound_comp.iter().enumerate() {
            let ka = self.ka[comp].value();
            let kd = self.kd[comp].value();
            let qm = self.qmax[comp].value();
            jac[b * cols + comp] = ka * qm * theta;
            for (b2, &comp2) in self.bound_comp.iter().enumerate() {
                jac[b * cols + n_comp + b2] -= ka * cp[comp] * qm / self.qmax[comp2].value();
            }
            jac[b * cols + n_comp + b] -= kd;
        }
    }
    fn jacobian_add_discretized(&self, alpha: f64, fbm: &mut FactorizableBandMatrix, row0: usize) {
        if !self.kinetic {
            return;
        }
        for b in 0..self.stride_bound() {
            let mut row = fbm.row_mut(row0 + b);
            row[0] += alpha;
        }
    }
    fn consistent_initial_state(
        &self,
        t: f64,
        z: f64,
        r: f64,
        sec: usize,
        cp: &[f64],
        q: &mut [f64],
        tol: f64,
        workspace: &mut [f64],
        jac_data: &mut [f64],
        pivots: &mut [usize],
    ) -> Result<(), String> {
        if !self.has_algebraic_equations() {
            return Ok(());
        }
        let nb = self.stride_bound();
        let n_comp = self.n_bound.len();
        let cols = n_comp + nb;
        let result = newton_algebraic(
            nb,
            tol,
            |qq, out| self.flux(t, z, r, sec, cp, qq, out),
            |qq, dense| {
                let mut full = vec![0.0; nb * cols];
                self.jacobian(t, z, r, sec, cp, qq, &mut full);
                for rr in 0..nb {
                    for cc in 0..nb {
                        dense[rr * nb + cc] = full[rr * cols + n_comp + cc];
                    }
                }
            },
            q,
            workspace,
            jac_data,
            pivots,
        );
        if result.is_err() {
            warn!(
                "Langmuir consistent initialization failed at z = {}, r = {}",
                z, r
            );
        }
        result
    }
    fn set_parameter_value(&mut self, name: &str, comp: usize, value: f64) -> bool {
        match name {
            "MCL_KA" => {
                self.ka[comp] = Active::constant(value);
                true
            }
            "MCL_KD" => {
                self.kd[comp] = Active::constant(value);
                true
            }
            "MCL_QMAX" => {
                self.qmax[comp] = Active::constant(value);
                true
            }
            _ => false,
        }
    }
    fn set_parameter_ad_seed(&mut self, name: &str, comp: usize, dir: usize, seed: f64) -> bool {
        match name {
            "MCL_KA" => {
                self.ka[comp].set_ad_value(dir, seed);
                true
            }
            "MCL_KD" => {
                self.kd[comp].set_ad_value(dir, seed);
                true
            }
            "MCL_QMAX" => {
                self.qmax[comp].set_ad_value(dir, seed);
                true
            }
            _ => false,
        }
    }
    fn clear_parameter_seeds(&mut self) {
        for v in self
            .ka
            .iter_mut()
            .chain(self.kd.iter_mut())
            .chain(self.qmax.iter_mut())
        {
            v.clear_gradient();
        }
    }
    fn get_parameter_value(&self, name: &str, comp: usize) -> Option<f64> {
        match name {
            "MCL_KA" => Some(self.ka[comp].value()),
            "MCL_KD" => Some(self.kd[comp].value()),
            "MCL_QMAX" => Some(self.qmax[comp].value()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_quasi_stationary_solve() {
        let binding = LinearBinding::new(vec![1, 1], false, vec![2.0, 1.0], vec![4.0, 0.5]);
        let cp = [1.0, 3.0];
        let mut q = [0.0, 0.0];
        let mut workspace = vec![0.0; binding.consistent_initialization_workspace_size()];
        let mut jac_data = vec![0.0; 16];
        let mut pivots = vec![0usize; 4];
        binding
            .consistent_initial_state(
                0.0,
                0.5,
                1e-6,
                0,
                &cp,
                &mut q,
                1e-12,
                &mut workspace,
                &mut jac_data,
                &mut pivots,
            )
            .unwrap();
        // q = ka/kd * cp
        assert_relative_eq!(q[0], 0.5, epsilon = 1e-10);
        assert_relative_eq!(q[1], 6.0, epsilon = 1e-10);
    }

    #[test]
    fn test_langmuir_equilibrium_matches_isotherm() {
        let binding = LangmuirBinding::new(
            vec![1, 1],
            false,
            vec![1.5, 0.8],
            vec![0.5, 1.2],
            vec![10.0, 8.0],
        );
        let cp = [0.7, 1.4];
        let mut q = [0.0, 0.0];
        let mut workspace = vec![0.0; binding.consistent_initialization_workspace_size()];
        let mut jac_data = vec![0.0; 16];
        let mut pivots = vec![0usize; 4];
        binding
            .consistent_initial_state(
                0.0, 0.5, 1e-6, 0, &cp, &mut q, 1e-12, &mut workspace, &mut jac_data,
                &mut pivots,
            )
            .unwrap();
        let mut res = [0.0, 0.0];
        binding.flux(0.0, 0.5, 1e-6, 0, &cp, &q, &mut res);
        assert!(res[0].abs() <= 1e-12 && res[1].abs() <= 1e-12);
        // closed form: b_i = ka_i cp_i / kd_i; q_i = qmax_i b_i / (1 + sum b)
        let b0 = 1.5 * 0.7 / 0.5;
        let b1 = 0.8 * 1.4 / 1.2;
        let denom = 1.0 + b0 + b1;
        assert_relative_eq!(q[0], 10.0 * b0 / denom, epsilon = 1e-9);
        assert_relative_eq!(q[1], 8.0 * b1 / denom, epsilon = 1e-9);
    }

    #[test]
    fn test_langmuir_jacobian_matches_finite_differences() {
        let binding = LangmuirBinding::new(
            vec![1, 1],
            true,
            vec![1.5, 0.8],
            vec![0.5, 1.2],
            vec![10.0, 8.0],
        );
        let cp = [0.7, 1.4];
        let q = [2.0, 1.0];
        let mut jac = vec![0.0; 2 * 4];
        binding.jacobian(0.0, 0.5, 1e-6, 0, &cp, &q, &mut jac);

        let eps = 1e-7;
        let mut f0 = [0.0; 2];
        binding.flux(0.0, 0.5, 1e-6, 0, &cp, &q, &mut f0);
        for col in 0..4 {
            let mut cp_p = cp;
            let mut q_p = q;
            if col < 2 {
                cp_p[col] += eps;
            } else {
                q_p[col - 2] += eps;
            }
            let mut f1 = [0.0; 2];
            binding.flux(0.0, 0.5, 1e-6, 0, &cp_p, &q_p, &mut f1);
            for row in 0..2 {
                let fd = (f1[row] - f0[row]) / eps;
                assert_relative_eq!(jac[row * 4 + col], fd, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_flux_active_param_derivative() {
        // d f / d ka for linear binding is cp
        let mut binding = LinearBinding::new(vec![1], true, vec![2.0], vec![1.0]);
        assert!(binding.set_parameter_ad_seed("LIN_KA", 0, 0, 1.0));
        let cp = [Active::constant(3.0)];
        let q = [Active::constant(0.5)];
        let mut out = [Active::constant(0.0)];
        binding.flux_active(Active::constant(0.0), 0.0, 0.0, 0, &cp, &q, &mut out);
        assert_relative_eq!(out[0].value(), 2.0 * 3.0 - 0.5);
        assert_relative_eq!(out[0].get_ad_value(0), 3.0);
    }

    #[test]
    fn test_kinetic_discretized_jacobian_contribution() {
        let binding = LinearBinding::new(vec![1], true, vec![1.0], vec![1.0]);
        let mut fbm = FactorizableBandMatrix::new(4, 1, 1);
        binding.jacobian_add_discretized(2.5, &mut fbm, 1);
        let (data, _) = fbm.scratch();
        // row 1, diagonal position kl = 1, stride 2*1+1+1 = 4
        assert_relative_eq!(data[1 * 4 + 1], 2.5);

        let qs = LinearBinding::new(vec![1], false, vec![1.0], vec![1.0]);
        let mut fbm2 = FactorizableBandMatrix::new(4, 1, 1);
        qs.jacobian_add_discretized(2.5, &mut fbm2, 1);
        let (data2, _) = fbm2.scratch();
        assert_relative_eq!(data2[1 * 4 + 1], 0.0);
    }
}
