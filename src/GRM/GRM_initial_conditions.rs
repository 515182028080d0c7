//! # Consistent initialization
//!
//! Given the DAE `F(t, y, y') = 0`, the initial values `(y0, y0')` must be
//! consistent before the BDF stepper starts. The standard procedure:
//!
//! 1. Solve the algebraic equations: the quasi-stationary binding states of
//!    every particle shell (damped Newton per shell, in parallel over column
//!    cells), then the film fluxes `j_f = k_f (c - c_p)` (linear, via the
//!    pre-assembled coupling matrices).
//! 2. Solve for `y0'`: the residual without time-derivative contributions is
//!    the right-hand side of a block-linear system whose blocks are
//!    `dF/dy'`; rows belonging to algebraic equations are replaced by their
//!    `dF/dy` rows with zero right-hand side (time-differentiated
//!    constraints). The system is solved with the positive residual and the
//!    result negated at the end, exploiting linearity.
//!
//! The lean variant skips the algebraic solve and only fixes the bulk block
//! and the fluxes. Sensitivity subsystems are initialized by the linearized
//! analogue of the same procedure.
//!
//! All of these scribble over the discretized Jacobian storage, so they
//! finish by setting `factorize_jacobian`.

use log::warn;
use rayon::prelude::*;

use crate::autodiff::Active;
use crate::global::SimulatorError;
use crate::simulator::parameters::ParameterProvider;
use crate::somelinalg::dense_matrix::DenseMatrixView;
use crate::GRM::binding::BindingModel;
use crate::GRM::GRM_model::GeneralRateModel;

impl GeneralRateModel {
    /// Fills `y` (and possibly `ydot`) from the provider: `INIT_STATE`
    /// (full state, optionally followed by its time derivative) takes
    /// precedence over `INIT_C` / `INIT_Q` / optional `INIT_CP`.
    pub fn apply_initial_condition(
        &self,
        provider: &mut dyn ParameterProvider,
        y: &mut [f64],
        ydot: &mut [f64],
    ) -> Result<(), SimulatorError> {
        let idxr = self.indexer();
        let num_dofs = idxr.num_dofs();
        let disc = &self.disc;

        if provider.exists("INIT_STATE") {
            let init_state = provider.get_double_array("INIT_STATE")?;
            if init_state.len() < num_dofs {
                return Err(SimulatorError::InvalidParameter(
                    "INIT_STATE does not contain enough values".to_string(),
                ));
            }
            y.copy_from_slice(&init_state[..num_dofs]);
            if init_state.len() >= 2 * num_dofs {
                ydot.copy_from_slice(&init_state[num_dofs..2 * num_dofs]);
            }
            return Ok(());
        }

        let init_c = provider.get_double_array("INIT_C")?;
        if init_c.len() < disc.n_comp {
            return Err(SimulatorError::InvalidParameter(
                "INIT_C does not contain enough values for all components".to_string(),
            ));
        }
        let init_q = if disc.stride_bound > 0 {
            let q = provider.get_double_array("INIT_Q")?;
            if q.len() < disc.stride_bound {
                return Err(SimulatorError::InvalidParameter(
                    "INIT_Q does not contain enough values for all bound states".to_string(),
                ));
            }
            q
        } else {
            Vec::new()
        };
        let init_cp = if provider.exists("INIT_CP") {
            Some(provider.get_double_array("INIT_CP")?)
        } else {
            None
        };
        let cp_source: &[f64] = init_cp.as_deref().unwrap_or(&init_c);

        for comp in 0..disc.n_comp {
            for col in 0..disc.n_col {
                y[idxr.offset_c(comp, col)] = init_c[comp];
            }
        }
        let sps = idxr.stride_par_shell();
        for col in 0..disc.n_col {
            let offset = idxr.offset_cp(col);
            for shell in 0..disc.n_par {
                let shell_off = offset + shell * sps;
                for comp in 0..disc.n_comp {
                    y[shell_off + comp] = cp_source[comp];
                }
                for bnd in 0..disc.stride_bound {
                    y[shell_off + disc.n_comp + bnd] = init_q[bnd];
                }
            }
        }
        Ok(())
    }

    /// Solves the linear flux closure in place:
    /// `j_f <- v_f - jacFC v - sum_i jacFP_i v_i` which, with `v_f = 0`,
    /// equals `k_f (c - c_p)`. Serial: the flux slice is a shared target.
    pub fn solve_for_fluxes(&self, v: &mut [f64]) {
        let idxr = self.indexer();
        let n_flux = self.disc.n_comp * self.disc.n_col;
        let par_rows = idxr.stride_par_block();
        let (rest, flux) = v.split_at_mut(idxr.offset_jf());
        self.jac_fc.multiply_subtract(&rest[..n_flux], flux);
        for col in 0..self.disc.n_col {
            let off = idxr.offset_cp(col);
            self.jac_fp[col].multiply_subtract(&rest[off..off + par_rows], flux);
        }
    }

    /// Step 1 of the standard consistent initialization: quasi-stationary
    /// binding states and fluxes (see module docs).
    pub fn consistent_initial_state(
        &mut self,
        t: f64,
        sec: usize,
        y: &mut [f64],
        error_tol: f64,
    ) -> Result<(), SimulatorError> {
        let idxr = self.indexer();
        let disc = self.disc.clone();
        let sps = idxr.stride_par_shell();
        let n_comp = disc.n_comp;
        let par_rows = idxr.stride_par_block();

        if self.binding.has_algebraic_equations() {
            let required = self.binding.consistent_initialization_workspace_size();
            let binding = &self.binding;

            // each cell owns a disjoint slice of _tempState when it fits,
            // otherwise the tasks allocate their own scratch
            let use_shared = disc.n_col * required <= self.temp_state.len();
            let temp_chunks: Vec<&mut [f64]> = if use_shared {
                self.temp_state.chunks_mut(required.max(1)).take(disc.n_col).collect()
            } else {
                Vec::new()
            };

            let par_region =
                &mut y[idxr.offset_cp(0)..idxr.offset_cp(0) + disc.n_col * par_rows];

            let results: Vec<Result<(), (usize, usize, String)>> = if use_shared {
                par_region
                    .par_chunks_mut(par_rows)
                    .zip(self.jac_p_disc.par_iter_mut())
                    .zip(temp_chunks.into_par_iter())
                    .enumerate()
                    .map(|(col, ((block, fbm), workspace))| {
                        let z = (0.5 + col as f64) / disc.n_col as f64;
                        let (jac_data, pivots) = fbm.scratch();
                        solve_shells_in_cell(
                            binding, &disc, t, z, sec, col, sps, n_comp, block, error_tol,
                            workspace, jac_data, pivots,
                        )
                    })
                    .collect()
            } else {
                par_region
                    .par_chunks_mut(par_rows)
                    .zip(self.jac_p_disc.par_iter_mut())
                    .enumerate()
                    .map(|(col, (block, fbm))| {
                        let z = (0.5 + col as f64) / disc.n_col as f64;
                        let mut workspace = vec![0.0; required];
                        let (jac_data, pivots) = fbm.scratch();
                        solve_shells_in_cell(
                            binding, &disc, t, z, sec, col, sps, n_comp, block, error_tol,
                            &mut workspace, jac_data, pivots,
                        )
                    })
                    .collect()
            };
            for r in results {
                if let Err((cell, shell, msg)) = r {
                    warn!(
                        "consistent initialization failed in cell {} shell {}: {}",
                        cell, shell, msg
                    );
                    return Err(SimulatorError::AlgebraicSolveFailure {
                        cell,
                        shell,
                        residual: f64::NAN,
                    });
                }
            }

            // the discretized matrices were used as scratch
            self.factorize_jacobian = true;
        }

        // Step 1b: fluxes
        let idx_jf = idxr.offset_jf();
        for v in y[idx_jf..].iter_mut() {
            *v = 0.0;
        }
        self.solve_for_fluxes(y);
        Ok(())
    }

    /// Step 2 of the standard consistent initialization. On entry `ydot`
    /// holds the residual evaluated without time-derivative contributions;
    /// on exit it holds consistent state time derivatives.
    pub fn consistent_initial_time_derivative(&mut self, time_factor: f64, ydot: &mut [f64]) {
        let idxr = self.indexer();
        let disc = self.disc.clone();
        let n_comp = disc.n_comp;
        let n_col = disc.n_col;
        let n_flux = n_comp * n_col;
        let par_rows = idxr.stride_par_block();
        let sps = idxr.stride_par_shell();
        let inv_beta_p = 1.0 / disc.par_porosity - 1.0;

        // bulk blocks: dF/dy' is timeFactor * I
        {
            let (bulk, rest) = ydot.split_at_mut(n_flux);
            let (particles, _) = rest.split_at_mut(n_col * par_rows);

            bulk.par_chunks_mut(n_col)
                .zip(self.jac_c_disc.par_iter_mut())
                .for_each(|(slice, fbm)| {
                    fbm.set_all(0.0);
                    Self::add_time_derivative_column_block(fbm, 1.0, time_factor);
                    if !fbm.factorize() {
                        warn!("factorize() failed for a bulk block in consistent init");
                        return;
                    }
                    if !fbm.solve(slice) {
                        warn!("solve() failed for a bulk block in consistent init");
                    }
                });

            // particle blocks: dF/dy' plus the algebraic rows overwritten
            // with the original Jacobian rows and zeroed right-hand side
            let binding = &self.binding;
            let jac_p = &self.jac_p;
            let (alg_start, alg_len) = binding.algebraic_block();
            let has_alg = binding.has_algebraic_equations();
            particles
                .par_chunks_mut(par_rows)
                .zip(self.jac_p_disc.par_iter_mut())
                .zip(jac_p.par_iter())
                .for_each(|((slice, fbm), jac_orig)| {
                    fbm.set_all(0.0);
                    Self::add_time_derivative_particle_block(
                        fbm,
                        binding,
                        n_comp,
                        disc.n_par,
                        &disc.n_bound,
                        &disc.bound_offset,
                        inv_beta_p,
                        1.0,
                        time_factor,
                    );
                    if has_alg {
                        for shell in 0..disc.n_par {
                            let row0 = shell * sps + n_comp + alg_start;
                            for alg_row in 0..alg_len {
                                fbm.copy_row_from(row0 + alg_row, jac_orig, row0 + alg_row);
                                // RHS is -dF/dt, zero while the binding has
                                // no explicit time dependence
                                slice[row0 + alg_row] = 0.0;
                            }
                        }
                    }
                    if !fbm.factorize() {
                        warn!("factorize() failed for a particle block in consistent init");
                        return;
                    }
                    if !fbm.solve(slice) {
                        warn!("solve() failed for a particle block in consistent init");
                    }
                });
        }

        // fluxes, then flip the sign of everything (we solved with the
        // positive residual)
        let idx_jf = idxr.offset_jf();
        for v in ydot[idx_jf..].iter_mut() {
            *v = 0.0;
        }
        self.solve_for_fluxes(ydot);

        ydot.par_iter_mut().for_each(|v| *v = -*v);

        self.factorize_jacobian = true;
    }

    /// Full consistent initialization: algebraic state, then time
    /// derivatives (see module docs).
    pub fn consistent_initial_conditions(
        &mut self,
        t: f64,
        sec: usize,
        time_factor: f64,
        y: &mut [f64],
        ydot: &mut [f64],
        error_tol: f64,
    ) -> Result<(), SimulatorError> {
        self.consistent_initial_state(t, sec, y, error_tol)?;

        // residual without y' contributions is the (positive) right-hand
        // side of the y' system; also refresh the Jacobian at the new state
        let mut res = vec![0.0; self.num_dofs()];
        self.residual(t, sec, time_factor, y, None, &mut res, true);
        ydot.copy_from_slice(&res);

        self.consistent_initial_time_derivative(time_factor, ydot);
        Ok(())
    }

    /// Lean variant: keeps `y` as provided (no algebraic solve), only
    /// recomputes fluxes and the bulk-block time derivatives.
    pub fn lean_consistent_initial_conditions(
        &mut self,
        t: f64,
        sec: usize,
        time_factor: f64,
        y: &mut [f64],
        ydot: &mut [f64],
    ) -> Result<(), SimulatorError> {
        if self.has_section_dependent_particle_transport() {
            warn!(
                "lean consistent initialization is not appropriate for section-dependent pore and surface diffusion"
            );
        }
        let idxr = self.indexer();
        let n_col = self.disc.n_col;
        let n_flux = self.disc.n_comp * n_col;

        // Step 1: fluxes only
        let idx_jf = idxr.offset_jf();
        for v in y[idx_jf..].iter_mut() {
            *v = 0.0;
        }
        self.solve_for_fluxes(y);

        // Step 2: bulk blocks only
        let mut res = vec![0.0; self.num_dofs()];
        self.residual(t, sec, time_factor, y, None, &mut res, true);

        res[..n_flux]
            .par_chunks_mut(n_col)
            .zip(self.jac_c_disc.par_iter_mut())
            .for_each(|(slice, fbm)| {
                fbm.set_all(0.0);
                Self::add_time_derivative_column_block(fbm, 1.0, time_factor);
                if !fbm.factorize() {
                    warn!("factorize() failed for a bulk block in lean consistent init");
                    return;
                }
                if !fbm.solve(slice) {
                    warn!("solve() failed for a bulk block in lean consistent init");
                }
            });
        for i in 0..n_flux {
            ydot[i] = -res[i];
        }

        for v in ydot[idx_jf..].iter_mut() {
            *v = 0.0;
        }
        self.solve_for_fluxes(ydot);

        self.factorize_jacobian = true;
        Ok(())
    }

    /// Consistent initialization of the forward sensitivity subsystems.
    /// Requires consistent `(y, ydot)`; updates each pair in
    /// `(sens_y, sens_ydot)` in place.
    pub fn consistent_initial_sensitivity(
        &mut self,
        t: Active,
        sec: usize,
        time_factor: Active,
        y: &[f64],
        ydot: &[f64],
        sens_y: &mut [Vec<f64>],
        sens_ydot: &mut [Vec<f64>],
    ) -> Result<(), SimulatorError> {
        // parameter derivative columns via AD, Jacobian refreshed alongside
        self.residual_with_param_sens(t, sec, time_factor, y, Some(ydot), true);

        let idxr = self.indexer();
        let disc = self.disc.clone();
        let n_comp = disc.n_comp;
        let num_dofs = idxr.num_dofs();
        let sps = idxr.stride_par_shell();
        let par_rows = idxr.stride_par_block();
        let tf = time_factor.value();

        for dir in 0..sens_y.len() {
            let s = &mut sens_y[dir];
            let sdot = &mut sens_ydot[dir];

            // sdot starts as -dF/dp
            for i in 0..num_dofs {
                sdot[i] = -self.ad_res[i].get_ad_value(dir);
            }

            // Step 1a: algebraic part of each particle shell as a linear
            // sub-problem on the original Jacobian
            if self.binding.has_algebraic_equations() {
                let (alg_start, alg_len) = self.binding.algebraic_block();
                let jac_p = &self.jac_p;
                let sdot_ref: &[f64] = sdot;
                let s_par =
                    &mut s[idxr.offset_cp(0)..idxr.offset_cp(0) + disc.n_col * par_rows];
                s_par
                    .par_chunks_mut(par_rows)
                    .zip(self.jac_p_disc.par_iter_mut())
                    .zip(jac_p.par_iter())
                    .enumerate()
                    .for_each(|(col, ((block, fbm), jac_orig))| {
                        let (jac_data, pivots) = fbm.scratch();
                        for shell in 0..disc.n_par {
                            let row0 = shell * sps + n_comp + alg_start;
                            let shell_off = shell * sps;
                            // rhs = -dF/dp - [c_p | q_diff left | 0 | q_diff right] * s
                            let dfdp_off = idxr.offset_cp(col) + row0;
                            for i in 0..alg_len {
                                block[row0 + i] = sdot_ref[dfdp_off + i];
                            }
                            // subtract [c_p | leading q] * s
                            let lead = n_comp + alg_start;
                            let x_lead: Vec<f64> =
                                block[shell_off..shell_off + lead].to_vec();
                            let mut target: Vec<f64> =
                                block[row0..row0 + alg_len].to_vec();
                            jac_orig.submatrix_multiply_vector(
                                &x_lead,
                                row0,
                                -(lead as isize),
                                alg_len,
                                lead,
                                -1.0,
                                1.0,
                                &mut target,
                            );
                            // subtract trailing differential bound states
                            let trail = disc.stride_bound - alg_start - alg_len;
                            if trail > 0 {
                                let x_trail: Vec<f64> = block
                                    [row0 + alg_len..row0 + alg_len + trail]
                                    .to_vec();
                                jac_orig.submatrix_multiply_vector(
                                    &x_trail,
                                    row0,
                                    alg_len as isize,
                                    alg_len,
                                    trail,
                                    -1.0,
                                    1.0,
                                    &mut target,
                                );
                            }
                            block[row0..row0 + alg_len].copy_from_slice(&target);

                            // dense solve on the algebraic square block
                            let mut dense = DenseMatrixView::new(jac_data, pivots, alg_len);
                            dense.copy_submatrix_from_banded(
                                jac_orig, row0, 0, alg_len, alg_len,
                            );
                            if !dense.factorize()
                                || !dense.solve(&mut block[row0..row0 + alg_len])
                            {
                                warn!(
                                    "sensitivity algebraic solve failed in cell {} shell {}",
                                    col, shell
                                );
                            }
                        }
                    });
            }

            // Step 1b: fluxes, right-hand side is -dF/dp
            let idx_jf = idxr.offset_jf();
            s[idx_jf..].copy_from_slice(&sdot[idx_jf..]);
            self.solve_for_fluxes(s);

            // Step 2: sdot <- -dF/dp - J s, then the block solve
            self.multiply_with_jacobian(s, -1.0, 1.0, sdot);
            self.consistent_sensitivity_time_derivative_blocks(tf, sdot);
            self.solve_for_fluxes(sdot);
        }

        self.factorize_jacobian = true;
        Ok(())
    }

    /// Shared block solve of the y'-structure system for sensitivities:
    /// same assembly as `consistent_initial_time_derivative` but the
    /// right-hand side is already negated, so no sign flip afterwards.
    fn consistent_sensitivity_time_derivative_blocks(
        &mut self,
        time_factor: f64,
        sdot: &mut [f64],
    ) {
        let idxr = self.indexer();
        let disc = self.disc.clone();
        let n_comp = disc.n_comp;
        let n_col = disc.n_col;
        let n_flux = n_comp * n_col;
        let par_rows = idxr.stride_par_block();
        let sps = idxr.stride_par_shell();
        let inv_beta_p = 1.0 / disc.par_porosity - 1.0;

        let (bulk, rest) = sdot.split_at_mut(n_flux);
        let (particles, _) = rest.split_at_mut(n_col * par_rows);

        bulk.par_chunks_mut(n_col)
            .zip(self.jac_c_disc.par_iter_mut())
            .for_each(|(slice, fbm)| {
                fbm.set_all(0.0);
                Self::add_time_derivative_column_block(fbm, 1.0, time_factor);
                if !fbm.factorize() {
                    warn!("factorize() failed for a bulk block in sensitivity init");
                    return;
                }
                if !fbm.solve(slice) {
                    warn!("solve() failed for a bulk block in sensitivity init");
                }
            });

        let binding = &self.binding;
        let jac_p = &self.jac_p;
        let (alg_start, alg_len) = binding.algebraic_block();
        let has_alg = binding.has_algebraic_equations();
        particles
            .par_chunks_mut(par_rows)
            .zip(self.jac_p_disc.par_iter_mut())
            .zip(jac_p.par_iter())
            .for_each(|((slice, fbm), jac_orig)| {
                fbm.set_all(0.0);
                Self::add_time_derivative_particle_block(
                    fbm,
                    binding,
                    n_comp,
                    disc.n_par,
                    &disc.n_bound,
                    &disc.bound_offset,
                    inv_beta_p,
                    1.0,
                    time_factor,
                );
                if has_alg {
                    for shell in 0..disc.n_par {
                        let row0 = shell * sps + n_comp + alg_start;
                        for alg_row in 0..alg_len {
                            fbm.copy_row_from(row0 + alg_row, jac_orig, row0 + alg_row);
                            slice[row0 + alg_row] = 0.0;
                        }
                    }
                }
                if !fbm.factorize() {
                    warn!("factorize() failed for a particle block in sensitivity init");
                    return;
                }
                if !fbm.solve(slice) {
                    warn!("solve() failed for a particle block in sensitivity init");
                }
            });
    }

    /// Lean sensitivity initialization: bulk blocks and fluxes only.
    pub fn lean_consistent_initial_sensitivity(
        &mut self,
        t: Active,
        sec: usize,
        time_factor: Active,
        y: &[f64],
        ydot: &[f64],
        sens_y: &mut [Vec<f64>],
        sens_ydot: &mut [Vec<f64>],
    ) -> Result<(), SimulatorError> {
        if self.has_section_dependent_particle_transport() {
            warn!(
                "lean consistent initialization is not appropriate for section-dependent pore and surface diffusion"
            );
        }
        self.residual_with_param_sens(t, sec, time_factor, y, Some(ydot), true);

        let idxr = self.indexer();
        let n_col = self.disc.n_col;
        let n_flux = self.disc.n_comp * n_col;
        let idx_jf = idxr.offset_jf();
        let num_dofs = idxr.num_dofs();
        let tf = time_factor.value();

        for dir in 0..sens_y.len() {
            let s = &mut sens_y[dir];
            let sdot = &mut sens_ydot[dir];

            for i in 0..n_flux {
                sdot[i] = -self.ad_res[i].get_ad_value(dir);
            }
            for i in idx_jf..num_dofs {
                sdot[i] = -self.ad_res[i].get_ad_value(dir);
            }

            s[idx_jf..].copy_from_slice(&sdot[idx_jf..]);
            self.solve_for_fluxes(s);

            self.multiply_with_jacobian(s, -1.0, 1.0, sdot);

            sdot[..n_flux]
                .par_chunks_mut(n_col)
                .zip(self.jac_c_disc.par_iter_mut())
                .for_each(|(slice, fbm)| {
                    fbm.set_all(0.0);
                    Self::add_time_derivative_column_block(fbm, 1.0, tf);
                    if !fbm.factorize() {
                        warn!("factorize() failed in lean sensitivity init");
                        return;
                    }
                    if !fbm.solve(slice) {
                        warn!("solve() failed in lean sensitivity init");
                    }
                });

            self.solve_for_fluxes(sdot);
        }

        self.factorize_jacobian = true;
        Ok(())
    }
}

/// Algebraic binding solve for every shell of one column cell (sequential
/// within the cell, the cells run in parallel).
#[allow(clippy::too_many_arguments)]
fn solve_shells_in_cell(
    binding: &crate::GRM::binding::BindingVariant,
    disc: &crate::GRM::disc::Discretization,
    t: f64,
    z: f64,
    sec: usize,
    col: usize,
    sps: usize,
    n_comp: usize,
    block: &mut [f64],
    error_tol: f64,
    workspace: &mut [f64],
    jac_data: &mut [f64],
    pivots: &mut [usize],
) -> Result<(), (usize, usize, String)> {
    for shell in 0..disc.n_par {
        let shell_off = shell * sps;
        let (cp, q) = block[shell_off..shell_off + sps].split_at_mut(n_comp);
        binding
            .consistent_initial_state(
                t,
                z,
                disc.par_center_radius[shell],
                sec,
                cp,
                q,
                error_tol,
                workspace,
                jac_data,
                pivots,
            )
            .map_err(|e| (col, shell, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::parameters::{InMemoryParameterProvider, ParameterId};
    use crate::GRM::GRM_model::GeneralRateModel;
    use approx::assert_relative_eq;

    fn make_provider(kinetic: bool) -> InMemoryParameterProvider {
        let mut p = InMemoryParameterProvider::new();
        p.set_int("NCOMP", 2);
        p.set_int("NCOL", 5);
        p.set_int("NPAR", 3);
        p.set_double_array("NBOUND", vec![1.0, 1.0]);
        p.set_double("COL_LENGTH", 1.0);
        p.set_double("COL_POROSITY", 0.4);
        p.set_double("PAR_RADIUS", 1e-3);
        p.set_double("PAR_POROSITY", 0.5);
        p.set_double_array("VELOCITY", vec![0.5]);
        p.set_double_array("COL_DISPERSION", vec![1e-3]);
        p.set_double_array("FILM_DIFFUSION", vec![1e-3, 8e-4]);
        p.set_double_array("PAR_DIFFUSION", vec![1e-6, 2e-6]);
        p.set_string("adsorption/ADSORPTION_MODEL", "MULTI_COMPONENT_LANGMUIR");
        p.set_bool("adsorption/IS_KINETIC", kinetic);
        p.set_double_array("adsorption/MCL_KA", vec![1.5, 0.8]);
        p.set_double_array("adsorption/MCL_KD", vec![0.5, 1.2]);
        p.set_double_array("adsorption/MCL_QMAX", vec![10.0, 8.0]);
        p.set_double_array("inlet/sec_000/CONST_COEFF", vec![1.0, 0.5]);
        p.set_double_array("INIT_C", vec![0.4, 0.2]);
        p.set_double_array("INIT_Q", vec![0.0, 0.0]);
        p
    }

    #[test]
    fn test_apply_initial_condition_layout() {
        let mut provider = make_provider(true);
        let model = GeneralRateModel::configure(&mut provider, 1).unwrap();
        let n = model.num_dofs();
        let mut y = vec![0.0; n];
        let mut ydot = vec![0.0; n];
        model
            .apply_initial_condition(&mut provider, &mut y, &mut ydot)
            .unwrap();
        let idxr = model.indexer();
        assert_relative_eq!(y[idxr.offset_c(0, 3)], 0.4);
        assert_relative_eq!(y[idxr.offset_c(1, 0)], 0.2);
        // particle liquid and bound states
        let sps = idxr.stride_par_shell();
        assert_relative_eq!(y[idxr.offset_cp(2) + sps + 1], 0.2);
        assert_relative_eq!(y[idxr.offset_cp(2) + sps + 2], 0.0);
        // fluxes untouched
        assert_relative_eq!(y[idxr.offset_jf()], 0.0);
    }

    #[test]
    fn test_init_state_takes_precedence() {
        let mut provider = make_provider(true);
        let model = GeneralRateModel::configure(&mut provider, 1).unwrap();
        let n = model.num_dofs();
        let mut state: Vec<f64> = (0..2 * n).map(|i| i as f64).collect();
        provider.set_double_array("INIT_STATE", state.clone());
        let mut y = vec![0.0; n];
        let mut ydot = vec![0.0; n];
        model
            .apply_initial_condition(&mut provider, &mut y, &mut ydot)
            .unwrap();
        assert_relative_eq!(y[5], 5.0);
        assert_relative_eq!(ydot[0], n as f64);
        state.truncate(n - 1);
        provider.set_double_array("INIT_STATE", state);
        assert!(model
            .apply_initial_condition(&mut provider, &mut y, &mut ydot)
            .is_err());
    }

    #[test]
    fn test_solve_for_fluxes_closure_and_idempotency() {
        let mut provider = make_provider(true);
        let mut model = GeneralRateModel::configure(&mut provider, 1).unwrap();
        model.set_section(0, crate::autodiff::Active::constant(0.0), 1.0);
        let idxr = model.indexer();
        let n = model.num_dofs();
        let mut y: Vec<f64> = (0..n).map(|i| 0.1 + 0.03 * ((i % 6) as f64)).collect();

        for v in y[idxr.offset_jf()..].iter_mut() {
            *v = 0.0;
        }
        model.solve_for_fluxes(&mut y);

        // the closure j_f = k_f (c - c_p|surface) holds...
        let kf = [1e-3, 8e-4];
        for comp in 0..2 {
            for col in 0..model.disc.n_col {
                let c = y[idxr.offset_c(comp, col)];
                let cp = y[idxr.offset_cp(col) + comp];
                let jf = y[idxr.offset_jf_comp(comp, col)];
                assert_relative_eq!(jf, kf[comp] * (c - cp), epsilon = 1e-14);
            }
        }

        // ...and re-running the zero-then-solve operation reproduces it
        let snapshot = y.clone();
        for v in y[idxr.offset_jf()..].iter_mut() {
            *v = 0.0;
        }
        model.solve_for_fluxes(&mut y);
        for i in 0..n {
            assert_relative_eq!(y[i], snapshot[i]);
        }
    }

    #[test]
    fn test_consistent_init_residual_is_zero() {
        let mut provider = make_provider(false); // quasi-stationary Langmuir
        let mut model = GeneralRateModel::configure(&mut provider, 1).unwrap();
        let tf = 10.0;
        model.set_section(0, crate::autodiff::Active::constant(0.0), tf);
        let n = model.num_dofs();
        let mut y = vec![0.0; n];
        let mut ydot = vec![0.0; n];
        model
            .apply_initial_condition(&mut provider, &mut y, &mut ydot)
            .unwrap();

        model
            .consistent_initial_conditions(0.0, 0, tf, &mut y, &mut ydot, 1e-12)
            .unwrap();

        let mut res = vec![0.0; n];
        model.residual(0.0, 0, tf, &y, Some(&ydot), &mut res, false);
        let max = res.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(max < 1e-7, "residual after consistent init: {}", max);

        // algebraic rows are zero within the algebraic tolerance
        let idxr = model.indexer();
        let sps = idxr.stride_par_shell();
        for col in 0..model.disc.n_col {
            for shell in 0..model.disc.n_par {
                let off = idxr.offset_cp(col) + shell * sps + model.disc.n_comp;
                for b in 0..model.disc.stride_bound {
                    assert!(
                        res[off + b].abs() < 1e-10,
                        "algebraic row residual {} in cell {} shell {}",
                        res[off + b],
                        col,
                        shell
                    );
                }
            }
        }
    }

    #[test]
    fn test_consistent_init_kinetic_binding() {
        // no algebraic equations: step 1 only fills fluxes, step 2 still
        // produces a zero residual
        let mut provider = make_provider(true);
        let mut model = GeneralRateModel::configure(&mut provider, 1).unwrap();
        let tf = 5.0;
        model.set_section(0, crate::autodiff::Active::constant(0.0), tf);
        let n = model.num_dofs();
        let mut y = vec![0.0; n];
        let mut ydot = vec![0.0; n];
        model
            .apply_initial_condition(&mut provider, &mut y, &mut ydot)
            .unwrap();
        model
            .consistent_initial_conditions(0.0, 0, tf, &mut y, &mut ydot, 1e-12)
            .unwrap();
        let mut res = vec![0.0; n];
        model.residual(0.0, 0, tf, &y, Some(&ydot), &mut res, false);
        let max = res.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(max < 1e-8, "residual after consistent init: {}", max);
    }

    #[test]
    fn test_lean_matches_full_on_already_consistent_state() {
        // when INIT_Q is the binding equilibrium, full and lean agree on
        // the bulk time derivatives
        let mut provider = make_provider(false);
        // equilibrium for cp = [0.4, 0.2]:
        // b_i = ka_i cp_i / kd_i, q_i = qmax_i b_i / (1 + sum b)
        let b0 = 1.5 * 0.4 / 0.5;
        let b1 = 0.8 * 0.2 / 1.2;
        let denom = 1.0 + b0 + b1;
        provider.set_double_array(
            "INIT_Q",
            vec![10.0 * b0 / denom, 8.0 * b1 / denom],
        );
        let tf = 10.0;

        let mut model_full = GeneralRateModel::configure(&mut provider, 1).unwrap();
        model_full.set_section(0, crate::autodiff::Active::constant(0.0), tf);
        let n = model_full.num_dofs();
        let mut y_full = vec![0.0; n];
        let mut ydot_full = vec![0.0; n];
        model_full
            .apply_initial_condition(&mut provider, &mut y_full, &mut ydot_full)
            .unwrap();
        model_full
            .consistent_initial_conditions(0.0, 0, tf, &mut y_full, &mut ydot_full, 1e-12)
            .unwrap();

        let mut model_lean = GeneralRateModel::configure(&mut provider, 1).unwrap();
        model_lean.set_section(0, crate::autodiff::Active::constant(0.0), tf);
        let mut y_lean = vec![0.0; n];
        let mut ydot_lean = vec![0.0; n];
        model_lean
            .apply_initial_condition(&mut provider, &mut y_lean, &mut ydot_lean)
            .unwrap();
        model_lean
            .lean_consistent_initial_conditions(0.0, 0, tf, &mut y_lean, &mut ydot_lean)
            .unwrap();

        let n_flux = model_full.disc.n_comp * model_full.disc.n_col;
        for i in 0..n {
            assert_relative_eq!(y_full[i], y_lean[i], epsilon = 1e-9);
        }
        for i in 0..n_flux {
            assert_relative_eq!(ydot_full[i], ydot_lean[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_consistent_sensitivity_vs_finite_differences() {
        // sensitivity of the consistent initialization with respect to
        // MCL_KA of component 0 (exercises the algebraic sub-solve)
        let tf = 10.0;
        let id = ParameterId::new("MCL_KA").with_component(0);

        let run_init = |ka: f64| -> (Vec<f64>, Vec<f64>) {
            let mut provider = make_provider(false);
            provider.set_double_array("adsorption/MCL_KA", vec![ka, 0.8]);
            let mut model = GeneralRateModel::configure(&mut provider, 1).unwrap();
            model.set_section(0, crate::autodiff::Active::constant(0.0), tf);
            let n = model.num_dofs();
            let mut y = vec![0.0; n];
            let mut ydot = vec![0.0; n];
            model
                .apply_initial_condition(&mut provider, &mut y, &mut ydot)
                .unwrap();
            model
                .consistent_initial_conditions(0.0, 0, tf, &mut y, &mut ydot, 1e-13)
                .unwrap();
            (y, ydot)
        };

        // AD-based consistent sensitivity
        let mut provider = make_provider(false);
        let mut model = GeneralRateModel::configure(&mut provider, 1).unwrap();
        model.set_num_sens(1).unwrap();
        assert!(model.set_parameter_ad_seed(&id, 0, 1.0));
        model.set_section(0, crate::autodiff::Active::constant(0.0), tf);
        let n = model.num_dofs();
        let mut y = vec![0.0; n];
        let mut ydot = vec![0.0; n];
        model
            .apply_initial_condition(&mut provider, &mut y, &mut ydot)
            .unwrap();
        model
            .consistent_initial_conditions(0.0, 0, tf, &mut y, &mut ydot, 1e-13)
            .unwrap();
        let mut sens_y = vec![vec![0.0; n]];
        let mut sens_ydot = vec![vec![0.0; n]];
        model
            .consistent_initial_sensitivity(
                crate::autodiff::Active::constant(0.0),
                0,
                crate::autodiff::Active::constant(tf),
                &y,
                &ydot,
                &mut sens_y,
                &mut sens_ydot,
            )
            .unwrap();

        // central finite differences over the full initialization
        let eps = 1e-6;
        let (y_p, ydot_p) = run_init(1.5 + eps);
        let (y_m, ydot_m) = run_init(1.5 - eps);

        let scale_y = sens_y[0].iter().fold(1e-8f64, |m, v| m.max(v.abs()));
        let scale_yd = sens_ydot[0].iter().fold(1e-8f64, |m, v| m.max(v.abs()));
        for i in 0..n {
            let fd = (y_p[i] - y_m[i]) / (2.0 * eps);
            assert!(
                (sens_y[0][i] - fd).abs() <= 1e-3 * scale_y,
                "s[{}] = {} vs FD {}",
                i,
                sens_y[0][i],
                fd
            );
            let fd_dot = (ydot_p[i] - ydot_m[i]) / (2.0 * eps);
            assert!(
                (sens_ydot[0][i] - fd_dot).abs() <= 1e-3 * scale_yd,
                "sdot[{}] = {} vs FD {}",
                i,
                sens_ydot[0][i],
                fd_dot
            );
        }
    }
}
