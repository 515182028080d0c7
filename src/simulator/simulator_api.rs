//! # Simulator / time driver
//!
//! Owns the state vectors and runs the section-wise time integration: each
//! section `[t_i, t_{i+1}]` is mapped onto a unit interval of the
//! transformed clock, the BDF stepper marches the transformed time, and the
//! callbacks translate back to real time via the (AD-active) section times.
//! Because the section times are `Active`, declaring `SECTION_TIMES` as a
//! sensitive parameter makes `d/d t_i` flow through the time factor into
//! the forward sensitivities.
//!
//! At every section boundary whose transition is flagged discontinuous the
//! integrator history is discarded and the consistent initialization is
//! redone (full, lean or skipped, per configuration).

use std::time::Instant;

use log::{info, warn};

use crate::autodiff::Active;
use crate::global::{LinearSolveStatus, SimulatorError};
use crate::numerical::DAE_BDF::common::NumberOrVec;
use crate::numerical::DAE_BDF::DAE_solver::{DAESystem, StepResult, DAE_BDF};
use crate::simulator::parameters::{ParameterId, ParameterProvider, SlicedVector, ANY_INDEX};
use crate::simulator::recorder::SolutionRecorder;
use crate::GRM::GRM_model::GeneralRateModel;

/// matching tolerance on the transformed clock
const TAU_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistentInitialization {
    Full,
    Lean,
    None,
}

/// Bridges the BDF callback surface to the model: transformed time in, real
/// time and section data out.
struct GrmSystem<'a> {
    model: &'a mut GeneralRateModel,
    sec: usize,
    sec_start: Active,
    time_factor: Active,
    tau_offset: f64,
    scratch: Vec<f64>,
}

impl<'a> GrmSystem<'a> {
    fn real_time(&self, tau: f64) -> Active {
        self.sec_start + self.time_factor * (tau - self.tau_offset)
    }
}

impl<'a> DAESystem for GrmSystem<'a> {
    fn num_dofs(&self) -> usize {
        self.model.num_dofs()
    }

    fn num_sens(&self) -> usize {
        self.model.num_sens()
    }

    fn residual(
        &mut self,
        tau: f64,
        y: &[f64],
        ydot: &[f64],
        res: &mut [f64],
    ) -> Result<(), String> {
        let t = self.real_time(tau).value();
        let tf = self.time_factor.value();
        self.model
            .residual(t, self.sec, tf, y, Some(ydot), res, false);
        Ok(())
    }

    fn update_jacobian(&mut self, tau: f64, y: &[f64], ydot: &[f64]) -> Result<(), String> {
        let t = self.real_time(tau).value();
        let tf = self.time_factor.value();
        let model = &mut *self.model;
        model.residual(t, self.sec, tf, y, Some(ydot), &mut self.scratch, true);
        Ok(())
    }

    fn notify_step_size_changed(&mut self) {
        self.model.invalidate_factorization();
    }

    fn linear_solve(
        &mut self,
        tau: f64,
        alpha: f64,
        outer_tol: f64,
        rhs: &mut [f64],
        weight: &[f64],
        _y: &[f64],
        _ydot: &[f64],
    ) -> LinearSolveStatus {
        let t = self.real_time(tau).value();
        self.model.linear_solve(t, alpha, outer_tol, rhs, weight)
    }

    fn prepare_sensitivity_rhs(&mut self, tau: f64, y: &[f64], ydot: &[f64]) {
        let t = self.real_time(tau);
        let tf = self.time_factor;
        self.model
            .residual_with_param_sens(t, self.sec, tf, y, Some(ydot), true);
    }

    fn sensitivity_rhs(
        &mut self,
        dir: usize,
        _tau: f64,
        _y: &[f64],
        _ydot: &[f64],
        s: &[f64],
        sdot: &[f64],
        rhs: &mut [f64],
    ) {
        let tf = self.time_factor.value();
        let model = &*self.model;
        model.multiply_with_jacobian(s, 1.0, 0.0, rhs);
        model.multiply_with_derivative_jacobian(sdot, tf, &mut self.scratch);
        let ad = model.ad_res();
        for i in 0..rhs.len() {
            rhs[i] = -(rhs[i] + self.scratch[i] + ad[i].get_ad_value(dir));
        }
    }
}

pub struct Simulator {
    model: GeneralRateModel,

    /// AD-active section time points; SECTION_TIMES sensitivities seed here
    section_times: Vec<Active>,
    /// `section_continuity[i]` describes the transition i -> i+1
    section_continuity: Vec<bool>,

    solution_times: Vec<f64>,
    solution_times_transformed: Vec<f64>,

    pub y: Vec<f64>,
    pub ydot: Vec<f64>,
    sens_y: Vec<Vec<f64>>,
    sens_ydot: Vec<Vec<f64>>,

    /// fused sensitive parameter groups with their linear factors
    sensitive_params: SlicedVector<(ParameterId, f64)>,

    rel_tol: f64,
    abs_tol: NumberOrVec,
    rel_tol_sens: f64,
    abs_tol_sens: f64,
    alg_tol: f64,
    /// one entry (applied to every section) or one entry per section
    init_step_size: Vec<f64>,
    max_steps: usize,
    pub sens_error_control: bool,

    consistent_init_mode: ConsistentInitialization,
    consistent_init_mode_sens: ConsistentInitialization,

    last_int_time: f64,
    total_int_time: f64,
}

impl Simulator {
    pub fn new(model: GeneralRateModel) -> Self {
        Simulator {
            model,
            section_times: Vec::new(),
            section_continuity: Vec::new(),
            solution_times: Vec::new(),
            solution_times_transformed: Vec::new(),
            y: Vec::new(),
            ydot: Vec::new(),
            sens_y: Vec::new(),
            sens_ydot: Vec::new(),
            sensitive_params: SlicedVector::new(),
            rel_tol: 1e-8,
            abs_tol: NumberOrVec::Number(1e-10),
            rel_tol_sens: 1e-6,
            abs_tol_sens: 1e-8,
            alg_tol: 1e-10,
            init_step_size: vec![1e-6],
            max_steps: 100_000,
            sens_error_control: true,
            consistent_init_mode: ConsistentInitialization::Full,
            consistent_init_mode_sens: ConsistentInitialization::Full,
            last_int_time: 0.0,
            total_int_time: 0.0,
        }
    }

    pub fn model(&self) -> &GeneralRateModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut GeneralRateModel {
        &mut self.model
    }

    /// Reads driver-level settings (section times, solution times,
    /// tolerances) from the provider's current scope.
    pub fn configure(
        &mut self,
        provider: &mut dyn ParameterProvider,
    ) -> Result<(), SimulatorError> {
        let times = provider.get_double_array("SECTION_TIMES")?;
        let continuity = if provider.exists("SECTION_CONTINUITY") {
            provider
                .get_double_array("SECTION_CONTINUITY")?
                .iter()
                .map(|v| *v != 0.0)
                .collect()
        } else {
            vec![false; times.len().saturating_sub(2)]
        };
        self.set_section_times(&times, &continuity)?;

        if provider.exists("USER_SOLUTION_TIMES") {
            self.solution_times = provider.get_double_array("USER_SOLUTION_TIMES")?;
        }
        if provider.exists("RELTOL") {
            self.rel_tol = provider.get_double("RELTOL")?;
        }
        if provider.exists("ABSTOL") {
            let a = provider.get_double_array("ABSTOL")?;
            self.abs_tol = if a.len() == 1 {
                NumberOrVec::Number(a[0])
            } else {
                NumberOrVec::Vec(a)
            };
        }
        if provider.exists("ALGTOL") {
            self.alg_tol = provider.get_double("ALGTOL")?;
        }
        if provider.exists("INIT_STEP_SIZE") {
            self.init_step_size = provider.get_double_array("INIT_STEP_SIZE")?;
        }
        if provider.exists("MAX_STEPS") {
            self.max_steps = provider.get_int("MAX_STEPS")? as usize;
        }
        Ok(())
    }

    pub fn set_section_times(
        &mut self,
        times: &[f64],
        continuity: &[bool],
    ) -> Result<(), SimulatorError> {
        if times.len() < 2 {
            return Err(SimulatorError::InvalidParameter(
                "SECTION_TIMES needs at least two entries".to_string(),
            ));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SimulatorError::InvalidParameter(
                "SECTION_TIMES must be strictly increasing".to_string(),
            ));
        }
        if !continuity.is_empty() && continuity.len() != times.len() - 2 {
            return Err(SimulatorError::InvalidParameter(
                "SECTION_CONTINUITY must have nsec - 1 entries".to_string(),
            ));
        }
        self.section_times = times.iter().map(|t| Active::constant(*t)).collect();
        self.section_continuity = if continuity.is_empty() {
            vec![false; times.len() - 2]
        } else {
            continuity.to_vec()
        };
        // AD directions on the fresh Active values must be restored
        self.reset_sens_params();
        Ok(())
    }

    pub fn set_solution_times(&mut self, times: &[f64]) {
        self.solution_times = times.to_vec();
    }

    pub fn num_sections(&self) -> usize {
        self.section_times.len().saturating_sub(1)
    }

    pub fn set_relative_error_tolerance(&mut self, rel_tol: f64) {
        self.rel_tol = rel_tol;
    }

    pub fn set_absolute_error_tolerance(&mut self, abs_tol: f64) {
        self.abs_tol = NumberOrVec::Number(abs_tol);
    }

    pub fn set_absolute_error_tolerance_vec(&mut self, abs_tol: Vec<f64>) {
        self.abs_tol = NumberOrVec::Vec(abs_tol);
    }

    pub fn set_sensitivity_error_tolerance(&mut self, rel_tol: f64, abs_tol: f64) {
        self.rel_tol_sens = rel_tol;
        self.abs_tol_sens = abs_tol;
    }

    pub fn set_algebraic_error_tolerance(&mut self, alg_tol: f64) {
        self.alg_tol = alg_tol;
    }

    pub fn set_initial_step_size(&mut self, h0: f64) {
        self.init_step_size = vec![h0];
    }

    pub fn set_initial_step_sizes(&mut self, h0: Vec<f64>) {
        self.init_step_size = h0;
    }

    pub fn set_maximum_steps(&mut self, max_steps: usize) {
        self.max_steps = max_steps;
    }

    pub fn set_consistent_initialization(&mut self, mode: ConsistentInitialization) {
        self.consistent_init_mode = mode;
    }

    pub fn set_consistent_initialization_sens(&mut self, mode: ConsistentInitialization) {
        self.consistent_init_mode_sens = mode;
    }

    pub fn skip_consistent_initialization(&mut self) {
        self.consistent_init_mode = ConsistentInitialization::None;
        self.consistent_init_mode_sens = ConsistentInitialization::None;
    }

    pub fn last_simulation_duration(&self) -> f64 {
        self.last_int_time
    }

    pub fn total_simulation_duration(&self) -> f64 {
        self.total_int_time
    }

    // ------------------------------------------------------------------
    // initial conditions
    // ------------------------------------------------------------------

    pub fn set_initial_condition(
        &mut self,
        provider: &mut dyn ParameterProvider,
    ) -> Result<(), SimulatorError> {
        let n = self.model.num_dofs();
        self.y = vec![0.0; n];
        self.ydot = vec![0.0; n];
        self.model
            .apply_initial_condition(provider, &mut self.y, &mut self.ydot)
    }

    pub fn set_initial_condition_state(&mut self, y0: &[f64], ydot0: Option<&[f64]>) {
        self.y = y0.to_vec();
        self.ydot = match ydot0 {
            Some(v) => v.to_vec(),
            None => vec![0.0; y0.len()],
        };
    }

    /// Allocates zero-initialized forward sensitivity state vectors, one
    /// pair per declared AD direction.
    pub fn initialize_fwd_sensitivities(&mut self) {
        let n = self.model.num_dofs();
        let n_sens = self.sensitive_params.slices();
        self.sens_y = (0..n_sens).map(|_| vec![0.0; n]).collect();
        self.sens_ydot = (0..n_sens).map(|_| vec![0.0; n]).collect();
    }

    pub fn last_solution(&self) -> &[f64] {
        &self.y
    }

    pub fn last_solution_derivative(&self) -> &[f64] {
        &self.ydot
    }

    pub fn last_sensitivities(&self) -> &[Vec<f64>] {
        &self.sens_y
    }

    // ------------------------------------------------------------------
    // sensitive parameters
    // ------------------------------------------------------------------

    /// Declares one sensitive parameter (a group of size one).
    pub fn set_sensitive_parameter(&mut self, id: ParameterId) -> Result<(), SimulatorError> {
        self.set_sensitive_parameter_group(vec![id], vec![1.0])
    }

    /// Declares a fused group: all ids share one AD direction with the
    /// given linear factors.
    pub fn set_sensitive_parameter_group(
        &mut self,
        ids: Vec<ParameterId>,
        factors: Vec<f64>,
    ) -> Result<(), SimulatorError> {
        if ids.is_empty() || ids.len() != factors.len() {
            return Err(SimulatorError::InvalidParameter(
                "sensitive parameter group must pair every id with a factor".to_string(),
            ));
        }
        let dir = self.sensitive_params.slices();
        if dir >= crate::autodiff::MAX_AD_DIRECTIONS {
            return Err(SimulatorError::InvalidParameter(format!(
                "{} sensitivity directions requested, compiled cap is {}",
                dir + 1,
                crate::autodiff::MAX_AD_DIRECTIONS
            )));
        }
        for (id, factor) in ids.iter().zip(factors.iter()) {
            if !self.seed_parameter(id, dir, *factor) {
                return Err(SimulatorError::InvalidParameter(format!(
                    "unknown sensitive parameter {}",
                    id.name
                )));
            }
        }
        self.sensitive_params
            .push_back_slice(ids.into_iter().zip(factors).collect());
        self.model.set_num_sens(self.sensitive_params.slices())?;
        Ok(())
    }

    pub fn num_sens_params(&self) -> usize {
        self.sensitive_params.slices()
    }

    pub fn clear_sens_params(&mut self) {
        self.sensitive_params.clear();
        for t in self.section_times.iter_mut() {
            t.clear_gradient();
        }
        self.model.clear_parameter_seeds();
        let _ = self.model.set_num_sens(0);
        self.sens_y.clear();
        self.sens_ydot.clear();
    }

    fn seed_parameter(&mut self, id: &ParameterId, dir: usize, factor: f64) -> bool {
        if id.name == "SECTION_TIMES" {
            if id.section == ANY_INDEX || id.section >= self.section_times.len() {
                return false;
            }
            self.section_times[id.section].set_ad_value(dir, factor);
            return true;
        }
        self.model.set_parameter_ad_seed(id, dir, factor)
    }

    /// Re-seeds every declared AD direction (necessary after the underlying
    /// Active values were replaced).
    fn reset_sens_params(&mut self) {
        let groups: Vec<(usize, Vec<(ParameterId, f64)>)> = (0..self.sensitive_params.slices())
            .map(|dir| (dir, self.sensitive_params.get_slice(dir).to_vec()))
            .collect();
        for (dir, group) in groups {
            for (id, factor) in group {
                self.seed_parameter(&id, dir, factor);
            }
        }
    }

    pub fn has_parameter(&self, id: &ParameterId) -> bool {
        id.name == "SECTION_TIMES" || self.model.has_parameter(id)
    }

    /// Writes a parameter value; section times keep their AD seeds.
    pub fn set_parameter_value(
        &mut self,
        id: &ParameterId,
        value: f64,
    ) -> Result<(), SimulatorError> {
        if id.name == "SECTION_TIMES" {
            if id.section == ANY_INDEX || id.section >= self.section_times.len() {
                return Err(SimulatorError::InvalidParameter(
                    "SECTION_TIMES index out of range".to_string(),
                ));
            }
            let mut t = Active::constant(value);
            for dir in 0..self.sensitive_params.slices() {
                t.set_ad_value(dir, self.section_times[id.section].get_ad_value(dir));
            }
            self.section_times[id.section] = t;
            return Ok(());
        }
        if self.model.set_parameter_value(id, value) {
            // the constant write wiped the seeds of that slot
            self.reset_sens_params();
            Ok(())
        } else {
            Err(SimulatorError::InvalidParameter(format!(
                "unknown parameter {}",
                id.name
            )))
        }
    }

    /// Writes through a fused group: every member gets `value * factor`.
    pub fn set_sensitive_parameter_value(
        &mut self,
        dir: usize,
        value: f64,
    ) -> Result<(), SimulatorError> {
        let group = self.sensitive_params.get_slice(dir).to_vec();
        for (id, factor) in group {
            self.set_parameter_value(&id, value * factor)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // time transformation
    // ------------------------------------------------------------------

    fn time_factor(&self, sec: usize) -> Active {
        self.section_times[sec + 1] - self.section_times[sec]
    }

    /// Transformed image of a real time point (sections map to unit
    /// intervals).
    pub fn to_transformed_time(&self, t: f64) -> f64 {
        let n_sec = self.num_sections();
        for sec in 0..n_sec {
            let t0 = self.section_times[sec].value();
            let t1 = self.section_times[sec + 1].value();
            if t <= t1 || sec == n_sec - 1 {
                return sec as f64 + (t - t0) / (t1 - t0);
            }
        }
        unreachable!()
    }

    /// Lowest section index i with `sectionTimes[i] <= t <= sectionTimes[i+1]`.
    pub fn get_current_section(&self, t: f64) -> usize {
        let n_sec = self.num_sections();
        for sec in 0..n_sec {
            if t >= self.section_times[sec].value() && t <= self.section_times[sec + 1].value()
            {
                return sec;
            }
        }
        n_sec - 1
    }

    /// Lowest section index i (at or after `start_idx`) whose start time is
    /// at or after `t`.
    pub fn get_next_section(&self, t: f64, start_idx: usize) -> usize {
        for sec in start_idx..self.num_sections() {
            if self.section_times[sec].value() >= t {
                return sec;
            }
        }
        self.num_sections()
    }

    fn transform_solution_times(&mut self) {
        self.solution_times_transformed = self
            .solution_times
            .iter()
            .map(|t| self.to_transformed_time(*t))
            .collect();
    }

    // ------------------------------------------------------------------
    // consistent initialization dispatch
    // ------------------------------------------------------------------

    fn run_consistent_init(&mut self, sec: usize) -> Result<(), SimulatorError> {
        let t_real = self.section_times[sec].value();
        let tf = self.time_factor(sec);
        match self.consistent_init_mode {
            ConsistentInitialization::Full => {
                self.model.consistent_initial_conditions(
                    t_real,
                    sec,
                    tf.value(),
                    &mut self.y,
                    &mut self.ydot,
                    self.alg_tol,
                )?;
            }
            ConsistentInitialization::Lean => {
                self.model.lean_consistent_initial_conditions(
                    t_real,
                    sec,
                    tf.value(),
                    &mut self.y,
                    &mut self.ydot,
                )?;
            }
            ConsistentInitialization::None => {}
        }

        if !self.sens_y.is_empty() {
            let t_active = self.section_times[sec];
            match self.consistent_init_mode_sens {
                ConsistentInitialization::Full => {
                    self.model.consistent_initial_sensitivity(
                        t_active,
                        sec,
                        tf,
                        &self.y,
                        &self.ydot,
                        &mut self.sens_y,
                        &mut self.sens_ydot,
                    )?;
                }
                ConsistentInitialization::Lean => {
                    self.model.lean_consistent_initial_sensitivity(
                        t_active,
                        sec,
                        tf,
                        &self.y,
                        &self.ydot,
                        &mut self.sens_y,
                        &mut self.sens_ydot,
                    )?;
                }
                ConsistentInitialization::None => {}
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // main loop
    // ------------------------------------------------------------------

    pub fn integrate(
        &mut self,
        recorder: &mut dyn SolutionRecorder,
    ) -> Result<(), SimulatorError> {
        let start = Instant::now();
        let n_sec = self.num_sections();
        if n_sec == 0 {
            return Err(SimulatorError::InvalidParameter(
                "no section times set".to_string(),
            ));
        }
        let num_dofs = self.model.num_dofs();
        if self.y.len() != num_dofs {
            return Err(SimulatorError::InvalidParameter(
                "initial conditions not set".to_string(),
            ));
        }
        let n_sens = self.sensitive_params.slices();
        if n_sens > 0 && self.sens_y.is_empty() {
            self.initialize_fwd_sensitivities();
        }
        self.transform_solution_times();

        let mut bdf = DAE_BDF::new(
            num_dofs,
            NumberOrVec::Number(self.rel_tol),
            self.abs_tol.clone(),
            1.0,
        )
        .map_err(SimulatorError::InvalidParameter)?;
        bdf.sens_error_control = self.sens_error_control;
        bdf.set_sensitivity_tolerances(
            NumberOrVec::Number(self.rel_tol_sens),
            NumberOrVec::Number(self.abs_tol_sens),
        );

        let mut sol_idx = 0usize;

        for sec in 0..n_sec {
            let tf = self.time_factor(sec);
            let sec_start = self.section_times[sec];
            self.model.set_section(sec, sec_start, tf.value());

            let needs_reset = sec == 0 || !self.section_continuity[sec - 1];
            if sec > 0 {
                // pull the state reached at the boundary out of the stepper
                self.y.copy_from_slice(bdf.y.as_slice());
                self.ydot.copy_from_slice(bdf.ydot.as_slice());
                for dir in 0..n_sens {
                    let (s, sdot) = bdf.sens_state(dir);
                    self.sens_y[dir].copy_from_slice(s.as_slice());
                    self.sens_ydot[dir].copy_from_slice(sdot.as_slice());
                }
            }

            if needs_reset {
                info!("section {}: (re)initializing consistently", sec);
                self.run_consistent_init(sec)?;
                if n_sens > 0 {
                    bdf.set_sens_initial(
                        self.sens_y
                            .iter()
                            .map(|v| nalgebra::DVector::from_column_slice(v))
                            .collect(),
                        self.sens_ydot
                            .iter()
                            .map(|v| nalgebra::DVector::from_column_slice(v))
                            .collect(),
                    );
                }
                let first_step = if self.init_step_size.len() > 1 {
                    self.init_step_size.get(sec).copied()
                } else {
                    self.init_step_size.first().copied()
                }
                .filter(|h| *h > 0.0)
                // initial step sizes are specified in real time
                .map(|h| h / tf.value());
                bdf.reset(
                    sec as f64,
                    &self.y,
                    &self.ydot,
                    (sec + 1) as f64,
                    first_step,
                )
                .map_err(SimulatorError::InvalidParameter)?;
            }

            let mut system = GrmSystem {
                model: &mut self.model,
                sec,
                sec_start,
                time_factor: tf,
                tau_offset: sec as f64,
                scratch: vec![0.0; num_dofs],
            };
            // section coefficients changed in any case
            system
                .update_jacobian(bdf.t, bdf.y.clone().as_slice(), bdf.ydot.clone().as_slice())
                .map_err(|e| SimulatorError::Internal(e))?;
            bdf.set_t_bound((sec + 1) as f64);

            let sec_end = (sec + 1) as f64;
            let sec_timer = Instant::now();

            // march through the solution times inside this section
            while sol_idx < self.solution_times_transformed.len()
                && self.solution_times_transformed[sol_idx] <= sec_end + TAU_EPS
            {
                let target = self.solution_times_transformed[sol_idx];
                if target < bdf.t - TAU_EPS {
                    warn!(
                        "solution time {} lies before the integrator, skipping",
                        self.solution_times[sol_idx]
                    );
                    sol_idx += 1;
                    continue;
                }
                if (target - bdf.t).abs() > TAU_EPS {
                    bdf.set_t_bound(target);
                    Self::march(&mut bdf, &mut system, self.max_steps, &self.section_times)?;
                }
                Self::write_solution(
                    recorder,
                    system.model,
                    self.solution_times[sol_idx],
                    &bdf,
                    n_sens,
                );
                sol_idx += 1;
            }

            // finish the section
            bdf.set_t_bound(sec_end);
            Self::march(&mut bdf, &mut system, self.max_steps, &self.section_times)?;
            info!(
                "section {} finished in {} ms ({} steps total)",
                sec,
                sec_timer.elapsed().as_millis(),
                bdf.nsteps
            );
        }

        // expose the final state
        self.y.copy_from_slice(bdf.y.as_slice());
        self.ydot.copy_from_slice(bdf.ydot.as_slice());
        for dir in 0..n_sens {
            let (s, sdot) = bdf.sens_state(dir);
            self.sens_y[dir].copy_from_slice(s.as_slice());
            self.sens_ydot[dir].copy_from_slice(sdot.as_slice());
        }

        self.last_int_time = start.elapsed().as_secs_f64();
        self.total_int_time += self.last_int_time;
        info!(
            "integration finished in {:.3} s, {} steps, {} residual evaluations",
            self.last_int_time, bdf.nsteps, bdf.nfev
        );
        Ok(())
    }

    fn march(
        bdf: &mut DAE_BDF,
        system: &mut GrmSystem,
        max_steps: usize,
        section_times: &[Active],
    ) -> Result<(), SimulatorError> {
        while !bdf.finished() {
            if bdf.nsteps > max_steps {
                return Err(SimulatorError::IntegrationFailure {
                    message: format!("maximum number of steps ({}) exceeded", max_steps),
                    t_reached: real_time_of(bdf.t, section_times),
                });
            }
            match bdf.step(system) {
                StepResult::Accepted => {}
                StepResult::Failed(msg) => {
                    return Err(SimulatorError::IntegrationFailure {
                        message: msg,
                        t_reached: real_time_of(bdf.t, section_times),
                    });
                }
            }
        }
        Ok(())
    }

    fn write_solution(
        recorder: &mut dyn SolutionRecorder,
        model: &GeneralRateModel,
        t: f64,
        bdf: &DAE_BDF,
        n_sens: usize,
    ) {
        let idxr = model.indexer();
        let n_flux = model.disc.n_comp * model.disc.n_col;
        let y = bdf.y.as_slice();
        recorder.record_solution(
            t,
            &y[..n_flux],
            &y[n_flux..idxr.offset_jf()],
            &y[idxr.offset_jf()..],
        );
        if n_sens > 0 {
            let slices: Vec<&[f64]> = (0..n_sens)
                .map(|dir| bdf.sens_state(dir).0.as_slice())
                .collect();
            recorder.record_sensitivities(t, &slices);
        }
    }
}

fn real_time_of(tau: f64, section_times: &[Active]) -> f64 {
    let n_sec = section_times.len() - 1;
    let sec = (tau.floor() as usize).min(n_sec - 1);
    let t0 = section_times[sec].value();
    let t1 = section_times[sec + 1].value();
    t0 + (tau - sec as f64) * (t1 - t0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::parameters::InMemoryParameterProvider;
    use crate::simulator::recorder::InMemoryRecorder;
    use crate::GRM::binding::BindingModel;
    use approx::assert_relative_eq;

    fn pulse_provider(
        n_comp: usize,
        n_col: usize,
        n_par: usize,
        adsorption: &str,
        kinetic: bool,
    ) -> InMemoryParameterProvider {
        let mut p = InMemoryParameterProvider::new();
        p.set_int("NCOMP", n_comp as i64);
        p.set_int("NCOL", n_col as i64);
        p.set_int("NPAR", n_par as i64);
        let nbound = if adsorption == "NONE" { 0.0 } else { 1.0 };
        p.set_double_array("NBOUND", vec![nbound; n_comp]);
        p.set_double("COL_LENGTH", 1.0);
        p.set_double("COL_POROSITY", 0.4);
        p.set_double("PAR_RADIUS", 1e-3);
        p.set_double("PAR_POROSITY", 0.5);
        p.set_double_array("VELOCITY", vec![0.5]);
        p.set_double_array("COL_DISPERSION", vec![1e-3]);
        p.set_double_array("FILM_DIFFUSION", vec![1e-3; n_comp]);
        p.set_double_array("PAR_DIFFUSION", vec![1e-6; n_comp]);
        if adsorption != "NONE" {
            p.set_string("adsorption/ADSORPTION_MODEL", adsorption);
            p.set_bool("adsorption/IS_KINETIC", kinetic);
            match adsorption {
                "LINEAR" => {
                    p.set_double_array("adsorption/LIN_KA", vec![2.0; n_comp]);
                    p.set_double_array("adsorption/LIN_KD", vec![1.0; n_comp]);
                }
                "MULTI_COMPONENT_LANGMUIR" => {
                    p.set_double_array("adsorption/MCL_KA", vec![1.0; n_comp]);
                    p.set_double_array("adsorption/MCL_KD", vec![1.0; n_comp]);
                    p.set_double_array("adsorption/MCL_QMAX", vec![5.0; n_comp]);
                }
                _ => unreachable!(),
            }
        }
        // load on [0, 10), wash on [10, 20)
        p.set_double_array("inlet/sec_000/CONST_COEFF", vec![1.0; n_comp]);
        p.set_double_array("inlet/sec_001/CONST_COEFF", vec![0.0; n_comp]);
        p.set_double_array("INIT_C", vec![0.0; n_comp]);
        if adsorption != "NONE" {
            p.set_double_array("INIT_Q", vec![0.0; n_comp]);
        }
        p
    }

    fn run_pulse(
        provider: &mut InMemoryParameterProvider,
        solution_times: &[f64],
    ) -> (Simulator, InMemoryRecorder) {
        let model = crate::GRM::GRM_model::GeneralRateModel::configure(provider, 2).unwrap();
        let mut sim = Simulator::new(model);
        sim.set_section_times(&[0.0, 10.0, 20.0], &[false]).unwrap();
        sim.set_solution_times(solution_times);
        sim.set_relative_error_tolerance(1e-6);
        sim.set_absolute_error_tolerance(1e-9);
        sim.set_initial_condition(provider).unwrap();
        let mut rec = InMemoryRecorder::new();
        sim.integrate(&mut rec).unwrap();
        (sim, rec)
    }

    #[test]
    fn test_pulse_through_column_without_binding() {
        let mut provider = pulse_provider(1, 8, 3, "NONE", true);
        let times: Vec<f64> = (0..=40).map(|i| i as f64 * 0.5).collect();
        let (sim, rec) = run_pulse(&mut provider, &times);
        assert_eq!(rec.len(), times.len());

        let n_col = sim.model().disc.n_col;
        let outlet = rec.chromatogram(0, n_col);
        assert!(outlet.iter().all(|v| v.is_finite()));
        // breakthrough: outlet approaches the inlet concentration within
        // the loading section and washes out afterwards
        assert!(outlet[0].abs() < 1e-6);
        let at_load_end = outlet[20]; // t = 10
        assert!(
            at_load_end > 0.5 && at_load_end < 1.0 + 1e-4,
            "outlet at end of loading: {}",
            at_load_end
        );
        let at_end = outlet[40]; // t = 20
        assert!(at_end < 0.5, "outlet after washout: {}", at_end);
        // concentrations stay inside the physical bounds
        for b in rec.bulk.iter() {
            for v in b.iter() {
                assert!(*v > -1e-6 && *v < 1.0 + 1e-3);
            }
        }
    }

    #[test]
    fn test_quasi_stationary_langmuir_stays_on_isotherm() {
        let mut provider = pulse_provider(2, 6, 2, "MULTI_COMPONENT_LANGMUIR", false);
        let times: Vec<f64> = (0..=20).map(|i| i as f64).collect();
        let (sim, rec) = run_pulse(&mut provider, &times);

        let model = sim.model();
        let idxr = model.indexer();
        let disc = &model.disc;
        let sps = idxr.stride_par_shell();
        let par_off0 = idxr.offset_cp(0);
        for (ti, particles) in rec.particles.iter().enumerate() {
            for col in 0..disc.n_col {
                for shell in 0..disc.n_par {
                    // recorder particle slice starts at offset_cp(0)
                    let off = idxr.offset_cp(col) - par_off0 + shell * sps;
                    let cp = &particles[off..off + disc.n_comp];
                    let q = &particles[off + disc.n_comp..off + sps];
                    let mut f = vec![0.0; disc.stride_bound];
                    model.binding.flux(
                        rec.times[ti],
                        0.5,
                        disc.par_center_radius[shell],
                        0,
                        cp,
                        q,
                        &mut f,
                    );
                    for v in f.iter() {
                        assert!(
                            v.abs() < 1e-5,
                            "algebraic residual {} at t = {}",
                            v,
                            rec.times[ti]
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_section_discontinuity_resets_cleanly() {
        let mut provider = pulse_provider(1, 6, 2, "MULTI_COMPONENT_LANGMUIR", false);
        let times: Vec<f64> = vec![5.0, 9.9, 10.1, 11.0, 15.0, 20.0];
        let (_sim, rec) = run_pulse(&mut provider, &times);
        assert_eq!(rec.len(), times.len());
        for b in rec.bulk.iter().chain(rec.particles.iter()).chain(rec.fluxes.iter()) {
            for v in b.iter() {
                assert!(v.is_finite(), "NaN in output after section reset");
            }
        }
        // concentrations stay inside the physical bounds through the reset
        for b in rec.bulk.iter() {
            for v in b.iter() {
                assert!(*v > -1e-6 && *v < 1.0 + 1e-3, "out of bounds: {}", v);
            }
        }
    }

    #[test]
    fn test_forward_sensitivity_matches_finite_differences() {
        // sensitivity with respect to COL_DISPERSION on a small column
        let times: Vec<f64> = vec![2.0, 5.0, 8.0];
        let id = ParameterId::new("COL_DISPERSION");

        let run = |dax: f64, sens: bool| -> (Vec<Vec<f64>>, Vec<Vec<Vec<f64>>>) {
            let mut provider = pulse_provider(1, 6, 2, "LINEAR", true);
            provider.set_double_array("COL_DISPERSION", vec![dax]);
            let model =
                crate::GRM::GRM_model::GeneralRateModel::configure(&mut provider, 2).unwrap();
            let mut sim = Simulator::new(model);
            sim.set_section_times(&[0.0, 10.0, 20.0], &[false]).unwrap();
            sim.set_solution_times(&times);
            sim.set_relative_error_tolerance(1e-8);
            sim.set_absolute_error_tolerance(1e-11);
            if sens {
                sim.set_sensitive_parameter(id.clone()).unwrap();
                sim.initialize_fwd_sensitivities();
            }
            sim.set_initial_condition(&mut provider).unwrap();
            let mut rec = InMemoryRecorder::new();
            sim.integrate(&mut rec).unwrap();
            (rec.bulk, rec.sensitivities)
        };

        let base = 1e-3;
        let (_, sens) = run(base, true);
        let eps = 1e-6;
        let (bulk_p, _) = run(base + eps, false);
        let (bulk_m, _) = run(base - eps, false);

        for ti in 0..times.len() {
            let s = &sens[ti][0];
            let scale = s.iter().fold(1e-8f64, |m, v| m.max(v.abs()));
            for i in 0..bulk_p[ti].len() {
                let fd = (bulk_p[ti][i] - bulk_m[ti][i]) / (2.0 * eps);
                assert!(
                    (s[i] - fd).abs() <= 5e-2 * scale,
                    "t = {}, dof {}: sens = {} vs FD = {}",
                    times[ti],
                    i,
                    s[i],
                    fd
                );
            }
        }
    }

    #[test]
    fn test_single_thread_matches_default_pool() {
        let run = || -> Vec<Vec<f64>> {
            let mut provider = pulse_provider(2, 6, 2, "LINEAR", true);
            let (_sim, rec) = run_pulse(&mut provider, &[2.0, 6.0, 12.0, 18.0]);
            rec.bulk
        };
        let default_pool = run();
        let single = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap()
            .install(run);
        assert_eq!(default_pool.len(), single.len());
        for (a, b) in default_pool.iter().zip(single.iter()) {
            for (x, y) in a.iter().zip(b.iter()) {
                assert_relative_eq!(x, y, epsilon = 1e-12, max_relative = 1e-10);
            }
        }
    }

    #[test]
    fn test_time_transformation_roundtrip() {
        let mut provider = pulse_provider(1, 4, 2, "NONE", true);
        let model = crate::GRM::GRM_model::GeneralRateModel::configure(&mut provider, 2).unwrap();
        let mut sim = Simulator::new(model);
        sim.set_section_times(&[0.0, 10.0, 30.0], &[false]).unwrap();
        assert_relative_eq!(sim.to_transformed_time(0.0), 0.0);
        assert_relative_eq!(sim.to_transformed_time(5.0), 0.5);
        assert_relative_eq!(sim.to_transformed_time(10.0), 1.0);
        assert_relative_eq!(sim.to_transformed_time(20.0), 1.5);
        assert_relative_eq!(sim.to_transformed_time(30.0), 2.0);
        assert_eq!(sim.get_current_section(5.0), 0);
        assert_eq!(sim.get_current_section(15.0), 1);
        assert_eq!(sim.get_next_section(10.0, 0), 1);
        // the time factors are the section lengths
        assert_relative_eq!(sim.time_factor(0).value(), 10.0);
        assert_relative_eq!(sim.time_factor(1).value(), 20.0);
    }

    #[test]
    fn test_section_times_validation() {
        let mut provider = pulse_provider(1, 4, 2, "NONE", true);
        let model = crate::GRM::GRM_model::GeneralRateModel::configure(&mut provider, 2).unwrap();
        let mut sim = Simulator::new(model);
        assert!(sim.set_section_times(&[0.0, 10.0, 10.0], &[false]).is_err());
        assert!(sim.set_section_times(&[0.0], &[]).is_err());
        assert!(sim.set_section_times(&[0.0, 1.0, 2.0], &[false, true]).is_err());
    }

    #[test]
    fn test_section_time_sensitivity_declaration() {
        let mut provider = pulse_provider(1, 4, 2, "NONE", true);
        let model = crate::GRM::GRM_model::GeneralRateModel::configure(&mut provider, 2).unwrap();
        let mut sim = Simulator::new(model);
        sim.set_section_times(&[0.0, 10.0, 20.0], &[false]).unwrap();
        let id = ParameterId::new("SECTION_TIMES").with_section(1);
        sim.set_sensitive_parameter(id).unwrap();
        assert_eq!(sim.num_sens_params(), 1);
        // the AD direction rides on the section time and thus on the factor
        assert_relative_eq!(sim.time_factor(0).get_ad_value(0), 1.0);
        assert_relative_eq!(sim.time_factor(1).get_ad_value(0), -1.0);
    }
}
