//! # General rate model of packed-bed chromatography
//!
//! Method-of-lines discretization of the coupled column/particle transport
//! equations with film mass transfer and adsorption. State vector layout
//! (component-major bulk, then per-cell particle blocks, then fluxes):
//!
//! ```text
//! y = [ c (nComp * nCol) | c_p,q per cell (nCol * nPar * (nComp + strideBound)) | j_f (nComp * nCol) ]
//! ```
//!
//! The DAE is marched on the transformed (unit-section) clock, so every
//! differential row is stated pre-multiplied by the time transformation
//! derivative `tf`:
//!
//! ```text
//! bulk:    tf c' + tf^2 [ u dc/dz - D_ax d2c/dz2 + f_acc j_f ] = 0
//! liquid:  tf (c_p' + (1/eps_p - 1) sum q') - tf^2 G_shell = 0
//! bound:   tf q' - tf^2 f_bind = 0         (kinetic)
//!          -f_bind = 0                     (quasi-stationary, algebraic)
//! flux:    j_f - k_f (c - c_p|surface) = 0 (algebraic)
//! ```
//!
//! Scaling a row by a constant moves nothing but the residual magnitude; the
//! payoff is that the time-discretized Jacobian blocks are exactly
//! `jac + alpha tf I` (plus the porosity coupling), and the section length
//! rides through `tf` as a differentiable parameter.
//!
//! The system Jacobian splits into per-component bulk bands `jacC`,
//! per-cell particle bands `jacP`, and the four sparse flux couplings; the
//! time-discretized copies `jacCdisc`/`jacPdisc` receive `alpha dF/dy'` and
//! get factorized. `factorize_jacobian` is true whenever any of that storage
//! has been mutated since the last factorization.

use std::collections::HashMap;

use log::info;
use rayon::prelude::*;

use crate::autodiff::{Active, SimReal, MAX_AD_DIRECTIONS};
use crate::global::SimulatorError;
use crate::simulator::parameters::{ParameterId, ParameterProvider, ANY_INDEX};
use crate::somelinalg::band_matrix::{BandMatrix, FactorizableBandMatrix};
use crate::somelinalg::coupling_matrix::CouplingMatrix;
use crate::GRM::binding::{
    BindingModel, BindingVariant, LangmuirBinding, LinearBinding, NoBinding,
};
use crate::GRM::disc::{Discretization, Indexer};

/// Scalar the residual is generic over; dispatches the binding flux to the
/// plain or the AD evaluation.
pub trait ResidualScalar: SimReal {
    fn binding_flux(
        binding: &BindingVariant,
        t: Self,
        z: f64,
        r: f64,
        sec: usize,
        cp: &[Self],
        q: &[Self],
        out: &mut [Self],
    );
}

impl ResidualScalar for f64 {
    fn binding_flux(
        binding: &BindingVariant,
        t: f64,
        z: f64,
        r: f64,
        sec: usize,
        cp: &[f64],
        q: &[f64],
        out: &mut [f64],
    ) {
        binding.flux(t, z, r, sec, cp, q, out);
    }
}

impl ResidualScalar for Active {
    fn binding_flux(
        binding: &BindingVariant,
        t: Active,
        z: f64,
        r: f64,
        sec: usize,
        cp: &[Active],
        q: &[Active],
        out: &mut [Active],
    ) {
        binding.flux_active(t, z, r, sec, cp, q, out);
    }
}

pub struct GeneralRateModel {
    pub disc: Discretization,
    n_sections: usize,

    // transport parameters; arrays are either single-valued or
    // section-dependent (see `sec_dep`)
    velocity: Vec<Active>,
    col_dispersion: Vec<Active>,
    film_diffusion: Vec<Active>,
    par_diffusion: Vec<Active>,
    par_surf_diffusion: Vec<Active>,

    // inlet polynomial coefficients, n_sections * n_comp each
    inlet_const: Vec<Active>,
    inlet_lin: Vec<Active>,
    inlet_quad: Vec<Active>,
    inlet_cube: Vec<Active>,

    pub binding: BindingVariant,

    // Jacobian storage
    pub(crate) jac_c: Vec<BandMatrix>,
    pub(crate) jac_c_disc: Vec<FactorizableBandMatrix>,
    pub(crate) jac_p: Vec<BandMatrix>,
    pub(crate) jac_p_disc: Vec<FactorizableBandMatrix>,
    pub(crate) jac_fc: CouplingMatrix,
    pub(crate) jac_cf: CouplingMatrix,
    pub(crate) jac_fp: Vec<CouplingMatrix>,
    pub(crate) jac_pf: Vec<CouplingMatrix>,
    /// true iff any Jacobian block was mutated since the last factorization
    pub(crate) factorize_jacobian: bool,

    pub(crate) temp_state: Vec<f64>,
    /// AD residual holding the parameter-sensitivity columns
    pub(crate) ad_res: Vec<Active>,
    n_sens: usize,

    pub schur_safety: f64,
    pub gmres_restart: usize,
    pub gmres_max_restarts: usize,

    pub(crate) cur_section: usize,
    pub(crate) cur_time_factor: f64,
    section_start: Active,
}

impl GeneralRateModel {
    /// Reads sizes and transport parameters from the provider (current
    /// scope) and allocates all Jacobian storage and working vectors.
    pub fn configure(
        provider: &mut dyn ParameterProvider,
        n_sections: usize,
    ) -> Result<Self, SimulatorError> {
        let n_comp = provider.get_int("NCOMP")? as usize;
        let n_col = provider.get_int("NCOL")? as usize;
        let n_par = provider.get_int("NPAR")? as usize;
        if n_comp == 0 || n_col == 0 || n_par == 0 {
            return Err(SimulatorError::InvalidParameter(
                "NCOMP, NCOL and NPAR must be positive".to_string(),
            ));
        }
        let n_bound: Vec<usize> = provider
            .get_double_array("NBOUND")?
            .iter()
            .map(|v| *v as usize)
            .collect();
        if n_bound.len() < n_comp {
            return Err(SimulatorError::InvalidParameter(
                "NBOUND does not contain enough values for all components".to_string(),
            ));
        }

        let disc = Discretization::new(
            n_comp,
            n_col,
            n_par,
            n_bound[..n_comp].to_vec(),
            provider.get_double("COL_LENGTH")?,
            provider.get_double("COL_POROSITY")?,
            provider.get_double("PAR_RADIUS")?,
            provider.get_double("PAR_POROSITY")?,
        );
        let stride_bound = disc.stride_bound;

        let read_sec_dep = |provider: &mut dyn ParameterProvider,
                            name: &str,
                            base: usize,
                            required: bool|
         -> Result<Vec<Active>, SimulatorError> {
            if !provider.exists(name) {
                if required {
                    return Err(SimulatorError::InvalidParameter(format!(
                        "missing {}",
                        name
                    )));
                }
                return Ok(vec![Active::constant(0.0); base.max(1)]);
            }
            let arr = provider.get_double_array(name)?;
            if arr.len() != base && arr.len() != base * n_sections {
                return Err(SimulatorError::InvalidParameter(format!(
                    "{} must have {} or {} entries, found {}",
                    name,
                    base,
                    base * n_sections,
                    arr.len()
                )));
            }
            Ok(arr.into_iter().map(Active::constant).collect())
        };

        let velocity = read_sec_dep(provider, "VELOCITY", 1, true)?;
        let col_dispersion = read_sec_dep(provider, "COL_DISPERSION", 1, true)?;
        let film_diffusion = read_sec_dep(provider, "FILM_DIFFUSION", n_comp, true)?;
        let par_diffusion = read_sec_dep(provider, "PAR_DIFFUSION", n_comp, true)?;
        let par_surf_diffusion = if stride_bound > 0 {
            read_sec_dep(provider, "PAR_SURFDIFFUSION", stride_bound, false)?
        } else {
            Vec::new()
        };

        // inlet polynomial, one scope per section
        let mut inlet_const = vec![Active::constant(0.0); n_sections * n_comp];
        let mut inlet_lin = vec![Active::constant(0.0); n_sections * n_comp];
        let mut inlet_quad = vec![Active::constant(0.0); n_sections * n_comp];
        let mut inlet_cube = vec![Active::constant(0.0); n_sections * n_comp];
        if provider.push_scope("inlet").is_ok() {
            for sec in 0..n_sections {
                let scope = format!("sec_{:03}", sec);
                if provider.push_scope(&scope).is_err() {
                    continue;
                }
                let coeffs = [
                    ("CONST_COEFF", &mut inlet_const),
                    ("LIN_COEFF", &mut inlet_lin),
                    ("QUAD_COEFF", &mut inlet_quad),
                    ("CUBE_COEFF", &mut inlet_cube),
                ];
                for (name, target) in coeffs {
                    if provider.exists(name) {
                        let arr = provider.get_double_array(name)?;
                        if arr.len() < n_comp {
                            provider.pop_scope();
                            provider.pop_scope();
                            return Err(SimulatorError::InvalidParameter(format!(
                                "inlet {} of section {} needs {} entries",
                                name, sec, n_comp
                            )));
                        }
                        for comp in 0..n_comp {
                            target[sec * n_comp + comp] = Active::constant(arr[comp]);
                        }
                    }
                }
                provider.pop_scope();
            }
            provider.pop_scope();
        }

        // binding model
        let binding = if provider.push_scope("adsorption").is_ok() {
            let model = provider.get_string("ADSORPTION_MODEL")?;
            let kinetic = if provider.exists("IS_KINETIC") {
                provider.get_bool("IS_KINETIC")?
            } else {
                true
            };
            let b = match model.as_str() {
                "NONE" => BindingVariant::from(NoBinding::new(n_comp)),
                "LINEAR" => BindingVariant::from(LinearBinding::new(
                    disc.n_bound.clone(),
                    kinetic,
                    provider.get_double_array("LIN_KA")?,
                    provider.get_double_array("LIN_KD")?,
                )),
                "MULTI_COMPONENT_LANGMUIR" => BindingVariant::from(LangmuirBinding::new(
                    disc.n_bound.clone(),
                    kinetic,
                    provider.get_double_array("MCL_KA")?,
                    provider.get_double_array("MCL_KD")?,
                    provider.get_double_array("MCL_QMAX")?,
                )),
                other => {
                    provider.pop_scope();
                    return Err(SimulatorError::InvalidParameter(format!(
                        "unknown ADSORPTION_MODEL {}",
                        other
                    )));
                }
            };
            provider.pop_scope();
            b
        } else {
            if stride_bound > 0 {
                return Err(SimulatorError::InvalidParameter(
                    "NBOUND requests bound states but no adsorption scope is present"
                        .to_string(),
                ));
            }
            BindingVariant::from(NoBinding::new(n_comp))
        };
        if binding.stride_bound() != stride_bound {
            return Err(SimulatorError::InvalidParameter(
                "binding model bound states do not match NBOUND".to_string(),
            ));
        }

        let schur_safety = if provider.exists("SCHUR_SAFETY") {
            provider.get_double("SCHUR_SAFETY")?
        } else {
            1e-8
        };
        let gmres_restart = if provider.exists("MAX_KRYLOV") {
            provider.get_int("MAX_KRYLOV")? as usize
        } else {
            30
        };

        let idxr = Indexer::new(&disc);
        let sps = idxr.stride_par_shell();
        let par_rows = idxr.stride_par_block();
        // particle stencil: +-1 shell for liquid/surface diffusion plus the
        // in-shell binding couplings
        let par_kl = sps;
        let par_ku = 2 * sps - 1;

        let jac_c = (0..n_comp).map(|_| BandMatrix::new(n_col, 1, 1)).collect();
        let jac_c_disc = (0..n_comp)
            .map(|_| FactorizableBandMatrix::new(n_col, 1, 1))
            .collect();
        let jac_p = (0..n_col)
            .map(|_| BandMatrix::new(par_rows, par_kl, par_ku))
            .collect();
        let jac_p_disc = (0..n_col)
            .map(|_| FactorizableBandMatrix::new(par_rows, par_kl, par_ku))
            .collect();

        let num_dofs = idxr.num_dofs();
        info!(
            "GRM configured: {} components, {} column cells, {} shells, {} DOFs",
            n_comp, n_col, n_par, num_dofs
        );

        let mut model = GeneralRateModel {
            disc,
            n_sections,
            velocity,
            col_dispersion,
            film_diffusion,
            par_diffusion,
            par_surf_diffusion,
            inlet_const,
            inlet_lin,
            inlet_quad,
            inlet_cube,
            binding,
            jac_c,
            jac_c_disc,
            jac_p,
            jac_p_disc,
            jac_fc: CouplingMatrix::from_triplets(0, 0, &[]),
            jac_cf: CouplingMatrix::from_triplets(0, 0, &[]),
            jac_fp: Vec::new(),
            jac_pf: Vec::new(),
            factorize_jacobian: true,
            temp_state: vec![0.0; num_dofs],
            ad_res: Vec::new(),
            n_sens: 0,
            schur_safety,
            gmres_restart,
            gmres_max_restarts: 10,
            cur_section: 0,
            cur_time_factor: 1.0,
            section_start: Active::constant(0.0),
        };
        model.assemble_couplings(0, 1.0);
        Ok(model)
    }

    pub fn num_dofs(&self) -> usize {
        Indexer::new(&self.disc).num_dofs()
    }

    pub fn indexer(&self) -> Indexer {
        Indexer::new(&self.disc)
    }

    pub fn num_sections(&self) -> usize {
        self.n_sections
    }

    pub fn num_sens(&self) -> usize {
        self.n_sens
    }

    /// Allocates the AD residual workspace for `n` sensitivity directions.
    pub fn set_num_sens(&mut self, n: usize) -> Result<(), SimulatorError> {
        if n > MAX_AD_DIRECTIONS {
            return Err(SimulatorError::InvalidParameter(format!(
                "{} sensitivity directions requested, compiled cap is {}",
                n, MAX_AD_DIRECTIONS
            )));
        }
        self.n_sens = n;
        self.ad_res = vec![Active::constant(0.0); if n > 0 { self.num_dofs() } else { 0 }];
        Ok(())
    }

    /// AD residual of the last `residual_with_param_sens` call; column
    /// `dir` of the parameter Jacobian is `ad_res()[i].get_ad_value(dir)`.
    pub fn ad_res(&self) -> &[Active] {
        &self.ad_res
    }

    /// Marks the time-discretized blocks stale (e.g. after the step size
    /// and thus `alpha` changed).
    pub fn invalidate_factorization(&mut self) {
        self.factorize_jacobian = true;
    }

    /// True when pore or surface diffusion is section-dependent; lean
    /// consistent initialization is then inappropriate.
    pub fn has_section_dependent_particle_transport(&self) -> bool {
        self.par_diffusion.len() > self.disc.n_comp
            || self.par_surf_diffusion.len() > self.disc.stride_bound.max(1)
                && !self.par_surf_diffusion.is_empty()
    }

    /// Section transition: remembers the section index, its (AD-active)
    /// start time and the time factor, and reassembles the time-factor
    /// dependent couplings.
    pub fn set_section(&mut self, sec: usize, section_start: Active, time_factor: f64) {
        self.cur_section = sec;
        self.section_start = section_start;
        self.assemble_couplings(sec, time_factor);
        self.factorize_jacobian = true;
    }

    #[inline]
    fn sec_dep<'a>(&self, arr: &'a [Active], base: usize, sec: usize, idx: usize) -> Active {
        if arr.len() > base {
            arr[sec * base + idx]
        } else {
            arr[idx]
        }
    }

    fn velocity_at<T: SimReal>(&self, sec: usize) -> T {
        T::from_active(self.sec_dep(&self.velocity, 1, sec, 0))
    }

    fn dispersion_at<T: SimReal>(&self, sec: usize) -> T {
        T::from_active(self.sec_dep(&self.col_dispersion, 1, sec, 0))
    }

    fn film_diffusion_at<T: SimReal>(&self, sec: usize, comp: usize) -> T {
        T::from_active(self.sec_dep(&self.film_diffusion, self.disc.n_comp, sec, comp))
    }

    fn par_diffusion_at<T: SimReal>(&self, sec: usize, comp: usize) -> T {
        T::from_active(self.sec_dep(&self.par_diffusion, self.disc.n_comp, sec, comp))
    }

    fn par_surf_diffusion_at<T: SimReal>(&self, sec: usize, bnd: usize) -> T {
        if self.par_surf_diffusion.is_empty() {
            return T::constant(0.0);
        }
        T::from_active(self.sec_dep(
            &self.par_surf_diffusion,
            self.disc.stride_bound,
            sec,
            bnd,
        ))
    }

    /// Inlet concentration of `comp` at real time `t` (cubic polynomial in
    /// the time since the section started).
    pub fn inlet_concentration<T: SimReal>(&self, sec: usize, comp: usize, t: T) -> T {
        let n_comp = self.disc.n_comp;
        let dt = t - T::from_active(self.section_start);
        let a0 = T::from_active(self.inlet_const[sec * n_comp + comp]);
        let a1 = T::from_active(self.inlet_lin[sec * n_comp + comp]);
        let a2 = T::from_active(self.inlet_quad[sec * n_comp + comp]);
        let a3 = T::from_active(self.inlet_cube[sec * n_comp + comp]);
        a0 + dt * (a1 + dt * (a2 + dt * a3))
    }

    fn acc_factor(&self) -> f64 {
        (1.0 - self.disc.col_porosity) / self.disc.col_porosity * 3.0 / self.disc.par_radius
    }

    fn inv_beta_p(&self) -> f64 {
        1.0 / self.disc.par_porosity - 1.0
    }

    // ------------------------------------------------------------------
    // residual
    // ------------------------------------------------------------------

    /// DAE residual. With `want_jac` the analytic system Jacobian `dF/dy`
    /// is reassembled at `(t, y)` as a side effect (and the discretized
    /// blocks are invalidated). `ydot = None` drops the time-derivative
    /// contribution, which is how the right-hand side of the consistent
    /// initialization is obtained.
    pub fn residual(
        &mut self,
        t: f64,
        sec: usize,
        time_factor: f64,
        y: &[f64],
        ydot: Option<&[f64]>,
        res: &mut [f64],
        want_jac: bool,
    ) {
        if want_jac {
            self.assemble_jacobian(t, sec, time_factor, y);
        }
        self.cur_time_factor = time_factor;
        self.residual_impl::<f64>(t, sec, time_factor, y, ydot, res);
    }

    /// AD residual: evaluates with `Active` arithmetic so that afterwards
    /// `ad_res[i].get_ad_value(dir)` is the parameter derivative
    /// `dF_i/dp_dir`. The state stays `f64`; only parameters (and the time
    /// transformation) carry directions.
    pub fn residual_with_param_sens(
        &mut self,
        t: Active,
        sec: usize,
        time_factor: Active,
        y: &[f64],
        ydot: Option<&[f64]>,
        want_jac: bool,
    ) {
        if want_jac {
            self.assemble_jacobian(t.value(), sec, time_factor.value(), y);
        }
        self.cur_time_factor = time_factor.value();
        if self.n_sens == 0 {
            return;
        }
        let mut ad = std::mem::take(&mut self.ad_res);
        self.residual_impl::<Active>(t, sec, time_factor, y, ydot, &mut ad);
        self.ad_res = ad;
    }

    fn residual_impl<T: ResidualScalar>(
        &self,
        t: T,
        sec: usize,
        tf: T,
        y: &[f64],
        ydot: Option<&[f64]>,
        res: &mut [T],
    ) {
        let disc = &self.disc;
        let idxr = self.indexer();
        let n_comp = disc.n_comp;
        let n_col = disc.n_col;
        let n_par = disc.n_par;
        let sps = idxr.stride_par_shell();
        let stride_bound = disc.stride_bound;

        let tf2 = tf * tf;
        let inv_dz = 1.0 / disc.col_cell_size();
        let inv_dr = 1.0 / disc.par_shell_size();
        let acc = self.acc_factor();
        let inv_beta = self.inv_beta_p();
        let inv_eps_p = 1.0 / disc.par_porosity;

        let u: T = self.velocity_at(sec);
        let dax: T = self.dispersion_at(sec);

        let dot = |i: usize| -> f64 {
            match ydot {
                Some(v) => v[i],
                None => 0.0,
            }
        };

        // ---- bulk convection-dispersion
        for comp in 0..n_comp {
            let c_in: T = self.inlet_concentration(sec, comp, t);
            for col in 0..n_col {
                let idx = idxr.offset_c(comp, col);
                let c = T::constant(y[idx]);
                let c_prev: T = if col == 0 {
                    c_in
                } else {
                    T::constant(y[idx - 1])
                };
                let conv = u * (c - c_prev) * inv_dz;
                let disp: T = if n_col == 1 {
                    T::constant(0.0)
                } else if col == 0 {
                    dax * (T::constant(y[idx + 1]) - c) * inv_dz * inv_dz
                } else if col == n_col - 1 {
                    dax * (T::constant(y[idx - 1]) - c) * inv_dz * inv_dz
                } else {
                    dax * (T::constant(y[idx + 1]) - c * 2.0 + T::constant(y[idx - 1]))
                        * inv_dz
                        * inv_dz
                };
                let jf = T::constant(y[idxr.offset_jf_comp(comp, col)]);
                res[idx] = tf * dot(idx) + tf2 * (conv - disp + jf * acc);
            }
        }

        // ---- particles
        let mut cp = vec![T::constant(0.0); n_comp];
        let mut q = vec![T::constant(0.0); stride_bound.max(1)];
        let mut f_bind = vec![T::constant(0.0); stride_bound.max(1)];
        let kinetic = self.binding.is_kinetic();

        for col in 0..n_col {
            let z = (0.5 + col as f64) / n_col as f64;
            let par_off = idxr.offset_cp(col);
            for shell in 0..n_par {
                let shell_off = par_off + shell * sps;
                for comp in 0..n_comp {
                    cp[comp] = T::constant(y[shell_off + comp]);
                }
                for b in 0..stride_bound {
                    q[b] = T::constant(y[shell_off + n_comp + b]);
                }
                if stride_bound > 0 {
                    T::binding_flux(
                        &self.binding,
                        t,
                        z,
                        disc.par_center_radius[shell],
                        sec,
                        &cp[..n_comp],
                        &q[..stride_bound],
                        &mut f_bind[..stride_bound],
                    );
                }

                let outer_apv = disc.par_outer_surf_area_per_volume[shell];
                let inner_apv = disc.par_inner_surf_area_per_volume[shell];

                for comp in 0..n_comp {
                    let row = shell_off + comp;
                    let dp: T = self.par_diffusion_at(sec, comp);

                    // combined (liquid + solid) transport across the shell faces
                    let mut transport = T::constant(0.0);
                    if shell == 0 {
                        let jf = T::constant(y[idxr.offset_jf_comp(comp, col)]);
                        transport = transport + jf * (outer_apv * inv_eps_p);
                    } else {
                        let cp_out = T::constant(y[row - sps]);
                        let mut face = dp * (cp_out - cp[comp]) * inv_dr;
                        for b in 0..disc.n_bound[comp] {
                            let bnd = disc.bound_offset[comp] + b;
                            let ds: T = self.par_surf_diffusion_at(sec, bnd);
                            let q_out = T::constant(y[row - sps + n_comp - comp + bnd]);
                            face = face + ds * (q_out - q[bnd]) * (inv_beta * inv_dr);
                        }
                        transport = transport + face * outer_apv;
                    }
                    if shell + 1 < n_par {
                        let cp_in = T::constant(y[row + sps]);
                        let mut face = dp * (cp[comp] - cp_in) * inv_dr;
                        for b in 0..disc.n_bound[comp] {
                            let bnd = disc.bound_offset[comp] + b;
                            let ds: T = self.par_surf_diffusion_at(sec, bnd);
                            let q_in = T::constant(y[row + sps + n_comp - comp + bnd]);
                            face = face + ds * (q[bnd] - q_in) * (inv_beta * inv_dr);
                        }
                        transport = transport - face * inner_apv;
                    }

                    let mut dot_term = dot(row);
                    for b in 0..disc.n_bound[comp] {
                        let bnd = disc.bound_offset[comp] + b;
                        dot_term += inv_beta * dot(shell_off + n_comp + bnd);
                    }
                    res[row] = tf * dot_term - tf2 * transport;
                }

                for b in 0..stride_bound {
                    let row = shell_off + n_comp + b;
                    if kinetic {
                        res[row] = tf * dot(row) - tf2 * f_bind[b];
                    } else {
                        res[row] = -f_bind[b];
                    }
                }
            }
        }

        // ---- film fluxes
        for comp in 0..n_comp {
            let kf: T = self.film_diffusion_at(sec, comp);
            for col in 0..n_col {
                let idx = idxr.offset_jf_comp(comp, col);
                let c = T::constant(y[idxr.offset_c(comp, col)]);
                let cp_surf = T::constant(y[idxr.offset_cp(col) + comp]);
                res[idx] = T::constant(y[idx]) - kf * (c - cp_surf);
            }
        }
    }

    // ------------------------------------------------------------------
    // Jacobian assembly
    // ------------------------------------------------------------------

    /// Assembles `dF/dy` into `jacC`/`jacP` and the flux couplings.
    pub(crate) fn assemble_jacobian(&mut self, t: f64, sec: usize, tf: f64, y: &[f64]) {
        let idxr = self.indexer();
        let disc = self.disc.clone();
        let n_comp = disc.n_comp;
        let n_col = disc.n_col;
        let tf2 = tf * tf;
        let inv_dz = 1.0 / disc.col_cell_size();
        let u: f64 = self.velocity_at(sec);
        let dax: f64 = self.dispersion_at(sec);

        // bulk blocks, one tridiagonal band per component
        self.jac_c.par_iter_mut().for_each(|jac| {
            jac.set_all(0.0);
            for col in 0..n_col {
                let mut row = jac.row_mut(col);
                let conv = u * inv_dz;
                let disp = dax * inv_dz * inv_dz;
                if col > 0 {
                    row[-1] = tf2 * (-conv - disp);
                }
                let disp_terms = if n_col == 1 {
                    0.0
                } else if col == 0 || col == n_col - 1 {
                    disp
                } else {
                    2.0 * disp
                };
                row[0] = tf2 * (conv + disp_terms);
                if col + 1 < n_col {
                    row[1] = tf2 * (-disp);
                }
            }
        });

        // particle blocks
        let binding = &self.binding;
        let sps = idxr.stride_par_shell();
        let stride_bound = disc.stride_bound;
        let kinetic = binding.is_kinetic();
        let inv_dr = 1.0 / disc.par_shell_size();
        let inv_beta = self.inv_beta_p();
        let n_par = disc.n_par;
        let par_diffusion: Vec<f64> = (0..n_comp)
            .map(|c| self.par_diffusion_at::<f64>(sec, c))
            .collect();
        let par_surf_diffusion: Vec<f64> = (0..stride_bound)
            .map(|b| self.par_surf_diffusion_at::<f64>(sec, b))
            .collect();

        self.jac_p
            .par_iter_mut()
            .enumerate()
            .for_each(|(col, jac)| {
                jac.set_all(0.0);
                let z = (0.5 + col as f64) / n_col as f64;
                let par_off = idxr.offset_cp(col);
                let mut local_jac = vec![0.0; stride_bound * (n_comp + stride_bound)];
                for shell in 0..n_par {
                    let shell_row0 = shell * sps;
                    let outer_apv = disc.par_outer_surf_area_per_volume[shell];
                    let inner_apv = disc.par_inner_surf_area_per_volume[shell];

                    for comp in 0..n_comp {
                        let r = shell_row0 + comp;
                        let dp = par_diffusion[comp];
                        let mut row = jac.row_mut(r);
                        let mut diag = 0.0;
                        if shell > 0 {
                            // flux across the outer face
                            row[-(sps as isize)] = -tf2 * outer_apv * dp * inv_dr;
                            diag += outer_apv * dp * inv_dr;
                            for b in 0..disc.n_bound[comp] {
                                let bnd = disc.bound_offset[comp] + b;
                                let ds = par_surf_diffusion[bnd] * inv_beta;
                                let off = n_comp - comp + bnd;
                                row[-(sps as isize) + off as isize] =
                                    -tf2 * outer_apv * ds * inv_dr;
                                row[off as isize] += tf2 * outer_apv * ds * inv_dr;
                            }
                        }
                        if shell + 1 < n_par {
                            row[sps as isize] = -tf2 * inner_apv * dp * inv_dr;
                            diag += inner_apv * dp * inv_dr;
                            for b in 0..disc.n_bound[comp] {
                                let bnd = disc.bound_offset[comp] + b;
                                let ds = par_surf_diffusion[bnd] * inv_beta;
                                let off = n_comp - comp + bnd;
                                row[sps as isize + off as isize] =
                                    -tf2 * inner_apv * ds * inv_dr;
                                row[off as isize] += tf2 * inner_apv * ds * inv_dr;
                            }
                        }
                        row[0] += tf2 * diag;
                    }

                    if stride_bound > 0 {
                        let shell_off = par_off + shell * sps;
                        let cp = &y[shell_off..shell_off + n_comp];
                        let q = &y[shell_off + n_comp..shell_off + sps];
                        binding.jacobian(
                            t,
                            z,
                            disc.par_center_radius[shell],
                            sec,
                            cp,
                            q,
                            &mut local_jac,
                        );
                        let cols = n_comp + stride_bound;
                        let scale = if kinetic { tf2 } else { 1.0 };
                        for b in 0..stride_bound {
                            let r = shell_row0 + n_comp + b;
                            let mut row = jac.row_mut(r);
                            for comp in 0..n_comp {
                                let off = comp as isize - (n_comp + b) as isize;
                                row[off] -= scale * local_jac[b * cols + comp];
                            }
                            for b2 in 0..stride_bound {
                                let off = b2 as isize - b as isize;
                                row[off] -= scale * local_jac[b * cols + n_comp + b2];
                            }
                        }
                    }
                }
            });

        self.assemble_couplings(sec, tf);
        self.factorize_jacobian = true;
    }

    /// Rebuilds the four sparse flux couplings for the given section /
    /// time factor.
    pub(crate) fn assemble_couplings(&mut self, sec: usize, tf: f64) {
        let idxr = self.indexer();
        let disc = &self.disc;
        let n_comp = disc.n_comp;
        let n_col = disc.n_col;
        let n_flux = n_comp * n_col;
        let tf2 = tf * tf;
        let acc = self.acc_factor();
        let outer_apv0 = disc.par_outer_surf_area_per_volume[0];
        let inv_eps_p = 1.0 / disc.par_porosity;

        // jacFC: flux rows vs bulk columns, holds -k_f
        // jacCF: bulk rows vs flux columns, holds tf^2 * f_acc
        let mut fc = Vec::with_capacity(n_flux);
        let mut cf = Vec::with_capacity(n_flux);
        for comp in 0..n_comp {
            let kf: f64 = self.film_diffusion_at(sec, comp);
            for col in 0..n_col {
                let idx = comp * n_col + col;
                fc.push((idx, idx, -kf));
                cf.push((idx, idx, tf2 * acc));
            }
        }
        self.jac_fc = CouplingMatrix::from_triplets(n_flux, n_flux, &fc);
        self.jac_cf = CouplingMatrix::from_triplets(n_flux, n_flux, &cf);

        // per-cell couplings to/from the particle blocks (surface shell only)
        let par_rows = idxr.stride_par_block();
        self.jac_fp = (0..n_col)
            .map(|col| {
                let triplets: Vec<(usize, usize, f64)> = (0..n_comp)
                    .map(|comp| {
                        let kf: f64 = self.film_diffusion_at(sec, comp);
                        (comp * n_col + col, comp, kf)
                    })
                    .collect();
                CouplingMatrix::from_triplets(n_flux, par_rows, &triplets)
            })
            .collect();
        self.jac_pf = (0..n_col)
            .map(|col| {
                let triplets: Vec<(usize, usize, f64)> = (0..n_comp)
                    .map(|comp| {
                        (comp, comp * n_col + col, -tf2 * outer_apv0 * inv_eps_p)
                    })
                    .collect();
                CouplingMatrix::from_triplets(par_rows, n_flux, &triplets)
            })
            .collect();
        self.factorize_jacobian = true;
    }

    // ------------------------------------------------------------------
    // Jacobian products
    // ------------------------------------------------------------------

    /// `out <- alpha * (dF/dy) * s + beta * out` over the full system.
    pub fn multiply_with_jacobian(&self, s: &[f64], alpha: f64, beta: f64, out: &mut [f64]) {
        let idxr = self.indexer();
        let n_comp = self.disc.n_comp;
        let n_col = self.disc.n_col;
        let n_flux = n_comp * n_col;
        let par_rows = idxr.stride_par_block();
        let s_flux = &s[idxr.offset_jf()..];

        // bulk rows
        let mut tmp = vec![0.0; n_flux.max(par_rows)];
        for comp in 0..n_comp {
            let rows = comp * n_col..(comp + 1) * n_col;
            self.jac_c[comp].multiply_vector(
                &s[rows.clone()],
                alpha,
                beta,
                &mut out[rows],
            );
        }
        tmp[..n_flux].iter_mut().for_each(|v| *v = 0.0);
        self.jac_cf.multiply_add(s_flux, &mut tmp[..n_flux]);
        for i in 0..n_flux {
            out[i] += alpha * tmp[i];
        }

        // particle rows
        for col in 0..n_col {
            let off = idxr.offset_cp(col);
            self.jac_p[col].multiply_vector(
                &s[off..off + par_rows],
                alpha,
                beta,
                &mut out[off..off + par_rows],
            );
            tmp[..par_rows].iter_mut().for_each(|v| *v = 0.0);
            self.jac_pf[col].multiply_add(s_flux, &mut tmp[..par_rows]);
            for i in 0..par_rows {
                out[off + i] += alpha * tmp[i];
            }
        }

        // flux rows: J_f = I plus the couplings to bulk and particles
        let off_jf = idxr.offset_jf();
        tmp[..n_flux].iter_mut().for_each(|v| *v = 0.0);
        self.jac_fc.multiply_add(&s[..n_flux], &mut tmp[..n_flux]);
        for col in 0..n_col {
            let off = idxr.offset_cp(col);
            self.jac_fp[col].multiply_add(&s[off..off + par_rows], &mut tmp[..n_flux]);
        }
        for i in 0..n_flux {
            out[off_jf + i] = alpha * (s_flux[i] + tmp[i]) + beta * out[off_jf + i];
        }
    }

    /// `out <- (dF/dy') * sdot` (overwrites `out`). Algebraic rows are zero.
    pub fn multiply_with_derivative_jacobian(
        &self,
        sdot: &[f64],
        time_factor: f64,
        out: &mut [f64],
    ) {
        let idxr = self.indexer();
        let disc = &self.disc;
        let n_comp = disc.n_comp;
        let n_col = disc.n_col;
        let n_par = disc.n_par;
        let sps = idxr.stride_par_shell();
        let inv_beta = self.inv_beta_p();
        let kinetic = self.binding.is_kinetic();

        for i in 0..n_comp * n_col {
            out[i] = time_factor * sdot[i];
        }
        for col in 0..n_col {
            let par_off = idxr.offset_cp(col);
            for shell in 0..n_par {
                let shell_off = par_off + shell * sps;
                for comp in 0..n_comp {
                    let mut acc = sdot[shell_off + comp];
                    for b in 0..disc.n_bound[comp] {
                        let bnd = disc.bound_offset[comp] + b;
                        acc += inv_beta * sdot[shell_off + n_comp + bnd];
                    }
                    out[shell_off + comp] = time_factor * acc;
                }
                for b in 0..disc.stride_bound {
                    let row = shell_off + n_comp + b;
                    out[row] = if kinetic { time_factor * sdot[row] } else { 0.0 };
                }
            }
        }
        for i in idxr.offset_jf()..idxr.num_dofs() {
            out[i] = 0.0;
        }
    }

    // ------------------------------------------------------------------
    // parameters
    // ------------------------------------------------------------------

    fn param_slot(&mut self, id: &ParameterId) -> Option<(&mut Vec<Active>, usize, usize)> {
        let n_comp = self.disc.n_comp;
        let stride_bound = self.disc.stride_bound;
        match id.name.as_str() {
            "VELOCITY" => Some((&mut self.velocity, 1, 0)),
            "COL_DISPERSION" => Some((&mut self.col_dispersion, 1, 0)),
            "FILM_DIFFUSION" => Some((&mut self.film_diffusion, n_comp, id.component)),
            "PAR_DIFFUSION" => Some((&mut self.par_diffusion, n_comp, id.component)),
            "PAR_SURFDIFFUSION" => {
                Some((&mut self.par_surf_diffusion, stride_bound, id.bound_state))
            }
            "CONST_COEFF" => Some((&mut self.inlet_const, n_comp, id.component)),
            "LIN_COEFF" => Some((&mut self.inlet_lin, n_comp, id.component)),
            "QUAD_COEFF" => Some((&mut self.inlet_quad, n_comp, id.component)),
            "CUBE_COEFF" => Some((&mut self.inlet_cube, n_comp, id.component)),
            _ => None,
        }
    }

    fn param_index(arr_len: usize, base: usize, sec: usize, idx: usize) -> Option<usize> {
        let idx = if idx == ANY_INDEX { 0 } else { idx };
        let flat = if arr_len > base { sec * base + idx } else { idx };
        if flat < arr_len {
            Some(flat)
        } else {
            None
        }
    }

    pub fn has_parameter(&self, id: &ParameterId) -> bool {
        match id.name.as_str() {
            "VELOCITY" | "COL_DISPERSION" | "FILM_DIFFUSION" | "PAR_DIFFUSION"
            | "PAR_SURFDIFFUSION" | "CONST_COEFF" | "LIN_COEFF" | "QUAD_COEFF"
            | "CUBE_COEFF" => true,
            _ => {
                let comp = if id.component == ANY_INDEX {
                    0
                } else {
                    id.component
                };
                self.binding.get_parameter_value(&id.name, comp).is_some()
            }
        }
    }

    pub fn set_parameter_value(&mut self, id: &ParameterId, value: f64) -> bool {
        let sec = if id.section == ANY_INDEX { 0 } else { id.section };
        if let Some((arr, base, idx)) = self.param_slot(id) {
            let len = arr.len();
            if let Some(flat) = Self::param_index(len, base, sec, idx) {
                arr[flat] = Active::constant(value);
                self.factorize_jacobian = true;
                return true;
            }
            return false;
        }
        let comp = if id.component == ANY_INDEX {
            0
        } else {
            id.component
        };
        if self.binding.set_parameter_value(&id.name, comp, value) {
            self.factorize_jacobian = true;
            return true;
        }
        false
    }

    pub fn set_parameter_ad_seed(&mut self, id: &ParameterId, dir: usize, seed: f64) -> bool {
        let sec = if id.section == ANY_INDEX { 0 } else { id.section };
        if let Some((arr, base, idx)) = self.param_slot(id) {
            let len = arr.len();
            if let Some(flat) = Self::param_index(len, base, sec, idx) {
                arr[flat].set_ad_value(dir, seed);
                return true;
            }
            return false;
        }
        let comp = if id.component == ANY_INDEX {
            0
        } else {
            id.component
        };
        self.binding.set_parameter_ad_seed(&id.name, comp, dir, seed)
    }

    pub fn clear_parameter_seeds(&mut self) {
        for arr in [
            &mut self.velocity,
            &mut self.col_dispersion,
            &mut self.film_diffusion,
            &mut self.par_diffusion,
            &mut self.par_surf_diffusion,
            &mut self.inlet_const,
            &mut self.inlet_lin,
            &mut self.inlet_quad,
            &mut self.inlet_cube,
        ] {
            for v in arr.iter_mut() {
                v.clear_gradient();
            }
        }
        self.binding.clear_parameter_seeds();
    }

    pub fn all_parameter_values(&self) -> HashMap<String, Vec<f64>> {
        let mut map = HashMap::new();
        let grab = |arr: &[Active]| arr.iter().map(|a| a.value()).collect::<Vec<f64>>();
        map.insert("VELOCITY".to_string(), grab(&self.velocity));
        map.insert("COL_DISPERSION".to_string(), grab(&self.col_dispersion));
        map.insert("FILM_DIFFUSION".to_string(), grab(&self.film_diffusion));
        map.insert("PAR_DIFFUSION".to_string(), grab(&self.par_diffusion));
        map.insert(
            "PAR_SURFDIFFUSION".to_string(),
            grab(&self.par_surf_diffusion),
        );
        map
    }
}
