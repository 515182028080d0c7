//! # Restarted GMRES with a user-supplied matrix-vector product
//!
//! Iterative solver for the flux Schur complement. The operator is only
//! available as a callback (it contains banded back-solves), so the solver
//! never touches matrix storage. Convergence is measured in the weighted
//! 2-norm
//!
//! ```text
//! ||r||_w = sqrt( sum_i (w_i r_i)^2 )
//! ```
//!
//! with the error weights w_i = 1 / (rtol |y_i| + atol_i) supplied by the
//! time integrator. Internally the weighted system
//! `(W A W^-1) (W x) = W b` is solved with plain GMRES (modified
//! Gram-Schmidt, Givens rotations, restarts), so the Arnoldi residual IS the
//! weighted residual.

use nalgebra::DVector;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GmresStatus {
    /// Weighted residual dropped below the tolerance.
    Converged { iterations: usize, residual: f64 },
    /// Iteration budget exhausted; the caller treats this as a recoverable
    /// linear-solve error.
    MaxIterations { residual: f64 },
    /// The matrix-vector callback reported a failure (e.g. a diagonal block
    /// solve broke down).
    OperatorFailure,
}

impl GmresStatus {
    pub fn converged(&self) -> bool {
        matches!(self, GmresStatus::Converged { .. })
    }
}

pub struct Gmres {
    pub restart: usize,
    pub max_restarts: usize,
}

impl Default for Gmres {
    fn default() -> Self {
        Gmres {
            restart: 30,
            max_restarts: 10,
        }
    }
}

impl Gmres {
    /// Solves `A x = b` where `A` is only available through `matvec`.
    /// `x` holds the initial guess on entry and the solution on exit.
    /// `matvec(v, av)` computes `av = A v` and returns `false` on failure.
    pub fn solve<F>(
        &self,
        mut matvec: F,
        b: &[f64],
        x: &mut [f64],
        weight: &[f64],
        tol: f64,
    ) -> GmresStatus
    where
        F: FnMut(&[f64], &mut [f64]) -> bool,
    {
        let n = b.len();
        let m = self.restart.min(n);
        let mut scratch_in = vec![0.0; n];
        let mut scratch_out = vec![0.0; n];
        let mut total_iters = 0usize;

        // weighted matvec: v and result live in the scaled space
        let mut apply = |v: &DVector<f64>,
                         scratch_in: &mut [f64],
                         scratch_out: &mut [f64],
                         matvec: &mut F|
         -> Option<DVector<f64>> {
            for i in 0..n {
                scratch_in[i] = v[i] / weight[i];
            }
            if !matvec(scratch_in, scratch_out) {
                return None;
            }
            let mut out = DVector::zeros(n);
            for i in 0..n {
                out[i] = scratch_out[i] * weight[i];
            }
            Some(out)
        };

        let mut residual = f64::INFINITY;
        let mut tol = tol;
        for outer in 0..self.max_restarts {
            // r = W (b - A x)
            let xs = DVector::from_fn(n, |i, _| x[i] * weight[i]);
            let ax = match apply(&xs, &mut scratch_in, &mut scratch_out, &mut matvec) {
                Some(v) => v,
                None => return GmresStatus::OperatorFailure,
            };
            let r = DVector::from_fn(n, |i, _| b[i] * weight[i] - ax[i]);
            let beta = r.norm();
            residual = beta;
            if outer == 0 {
                // the requested absolute tolerance may lie below what
                // floating point can deliver for strongly weighted systems;
                // a 1e-13 relative reduction is direct-solve quality
                tol = tol.max(beta * 1e-13);
            }
            if beta <= tol {
                return GmresStatus::Converged {
                    iterations: total_iters,
                    residual: beta,
                };
            }

            let mut v_basis: Vec<DVector<f64>> = Vec::with_capacity(m + 1);
            v_basis.push(&r / beta);

            let ldh = m + 1;
            let mut h = vec![0.0; ldh * m];
            let mut cs = vec![0.0; m];
            let mut sn = vec![0.0; m];
            let mut g = vec![0.0; m + 1];
            g[0] = beta;

            let mut j = 0;
            let mut converged_inner = false;
            while j < m {
                let w_next =
                    match apply(&v_basis[j], &mut scratch_in, &mut scratch_out, &mut matvec) {
                        Some(v) => v,
                        None => return GmresStatus::OperatorFailure,
                    };
                let mut w = w_next;

                // modified Gram-Schmidt
                for i in 0..=j {
                    let hij = v_basis[i].dot(&w);
                    h[i + j * ldh] = hij;
                    w -= hij * &v_basis[i];
                }
                let h_next = w.norm();
                h[(j + 1) + j * ldh] = h_next;
                let breakdown = h_next < 1e-14;
                if !breakdown {
                    v_basis.push(w / h_next);
                }

                // previously computed Givens rotations
                for i in 0..j {
                    let temp = cs[i] * h[i + j * ldh] + sn[i] * h[(i + 1) + j * ldh];
                    h[(i + 1) + j * ldh] =
                        -sn[i] * h[i + j * ldh] + cs[i] * h[(i + 1) + j * ldh];
                    h[i + j * ldh] = temp;
                }

                // new rotation annihilating the subdiagonal
                let h_jj = h[j + j * ldh];
                let h_j1j = h[(j + 1) + j * ldh];
                let norm = (h_jj * h_jj + h_j1j * h_j1j).sqrt();
                if norm > 1e-300 {
                    cs[j] = h_jj / norm;
                    sn[j] = h_j1j / norm;
                } else {
                    cs[j] = 1.0;
                    sn[j] = 0.0;
                }
                h[j + j * ldh] = cs[j] * h_jj + sn[j] * h_j1j;
                h[(j + 1) + j * ldh] = 0.0;

                let temp = cs[j] * g[j];
                g[j + 1] = -sn[j] * g[j];
                g[j] = temp;

                residual = g[j + 1].abs();
                j += 1;
                total_iters += 1;

                if residual <= tol || breakdown {
                    converged_inner = true;
                    break;
                }
            }

            // back-substitute H y = g and update x (in the unscaled space)
            let mut y = vec![0.0; j];
            for i in (0..j).rev() {
                let mut acc = g[i];
                for k in (i + 1)..j {
                    acc -= h[i + k * ldh] * y[k];
                }
                y[i] = acc / h[i + i * ldh];
            }
            for i in 0..j {
                for (row, xv) in x.iter_mut().enumerate() {
                    *xv += y[i] * v_basis[i][row] / weight[row];
                }
            }

            if converged_inner {
                return GmresStatus::Converged {
                    iterations: total_iters,
                    residual,
                };
            }
        }

        GmresStatus::MaxIterations { residual }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn dense_matvec(a: &DMatrix<f64>) -> impl FnMut(&[f64], &mut [f64]) -> bool + '_ {
        move |x: &[f64], y: &mut [f64]| {
            for r in 0..a.nrows() {
                let mut acc = 0.0;
                for c in 0..a.ncols() {
                    acc += a[(r, c)] * x[c];
                }
                y[r] = acc;
            }
            true
        }
    }

    #[test]
    fn test_gmres_identity_plus_perturbation() {
        // the Schur complement is I minus a small coupling term, which is the
        // regime this solver runs in
        let n = 10;
        let mut a = DMatrix::identity(n, n);
        for i in 0..n {
            for jj in 0..n {
                a[(i, jj)] += 0.05 / ((i + jj + 1) as f64);
            }
        }
        let b: Vec<f64> = (0..n).map(|i| (i as f64 * 0.4).cos()).collect();
        let mut x = vec![0.0; n];
        let weight = vec![1.0; n];
        let solver = Gmres::default();
        let status = solver.solve(dense_matvec(&a), &b, &mut x, &weight, 1e-10);
        assert!(status.converged(), "status = {:?}", status);

        let x_ref = a
            .clone()
            .lu()
            .solve(&nalgebra::DVector::from_vec(b))
            .unwrap();
        for i in 0..n {
            assert_relative_eq!(x[i], x_ref[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn test_gmres_weighted_norm_convergence() {
        // strongly nonuniform weights must not break the solve
        let n = 6;
        let mut a = DMatrix::identity(n, n);
        a[(0, 5)] = 0.3;
        a[(3, 1)] = -0.2;
        let b = vec![1.0, -2.0, 0.5, 3.0, 0.0, 1.0];
        let weight: Vec<f64> = (0..n).map(|i| 10f64.powi(i as i32 - 3)).collect();
        let mut x = vec![0.0; n];
        let solver = Gmres::default();
        let status = solver.solve(dense_matvec(&a), &b, &mut x, &weight, 1e-12);
        assert!(status.converged());
        let x_ref = a
            .clone()
            .lu()
            .solve(&nalgebra::DVector::from_vec(b.clone()))
            .unwrap();
        for i in 0..n {
            assert_relative_eq!(x[i], x_ref[i], epsilon = 1e-7);
        }
    }

    #[test]
    fn test_gmres_nonzero_initial_guess() {
        let n = 4;
        let a = DMatrix::identity(n, n) * 2.0;
        let b = vec![2.0, 4.0, 6.0, 8.0];
        let mut x = vec![0.9, 1.9, 2.9, 3.9];
        let weight = vec![1.0; n];
        let status = Gmres::default().solve(dense_matvec(&a), &b, &mut x, &weight, 1e-12);
        assert!(status.converged());
        for i in 0..n {
            assert_relative_eq!(x[i], (i + 1) as f64, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_gmres_operator_failure() {
        let b = vec![1.0, 1.0];
        let mut x = vec![0.0, 0.0];
        let weight = vec![1.0, 1.0];
        let status = Gmres::default().solve(|_x, _y| false, &b, &mut x, &weight, 1e-10);
        assert_eq!(status, GmresStatus::OperatorFailure);
    }

    #[test]
    fn test_gmres_iteration_cap() {
        // an ill-conditioned system with a tiny budget must report
        // MaxIterations rather than spin
        let n = 8;
        let mut a = DMatrix::identity(n, n);
        for i in 0..n {
            a[(i, i)] = 10f64.powi(-(i as i32));
        }
        let b = vec![1.0; n];
        let mut x = vec![0.0; n];
        let weight = vec![1.0; n];
        let solver = Gmres {
            restart: 2,
            max_restarts: 1,
        };
        let status = solver.solve(dense_matvec(&a), &b, &mut x, &weight, 1e-14);
        assert!(matches!(status, GmresStatus::MaxIterations { .. }));
    }
}
