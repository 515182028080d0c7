//! Solution recording interface.
//!
//! The time driver notifies a recorder at every user solution time with
//! slices into the state vector (bulk, particle, flux) plus the forward
//! sensitivity states. The in-memory recorder keeps everything and offers a
//! chromatogram view (outlet concentrations over time).

pub trait SolutionRecorder {
    fn record_solution(&mut self, t: f64, bulk: &[f64], particles: &[f64], fluxes: &[f64]);

    fn record_sensitivities(&mut self, _t: f64, _sens: &[&[f64]]) {}
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    pub times: Vec<f64>,
    pub bulk: Vec<Vec<f64>>,
    pub particles: Vec<Vec<f64>>,
    pub fluxes: Vec<Vec<f64>>,
    pub sensitivities: Vec<Vec<Vec<f64>>>,
    pub store_particles: bool,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        InMemoryRecorder {
            store_particles: true,
            ..Default::default()
        }
    }

    /// Outlet (last column cell) concentration of `comp` at every recorded
    /// time; `n_col` is the number of column cells.
    pub fn chromatogram(&self, comp: usize, n_col: usize) -> Vec<f64> {
        self.bulk
            .iter()
            .map(|b| b[comp * n_col + n_col - 1])
            .collect()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

impl SolutionRecorder for InMemoryRecorder {
    fn record_solution(&mut self, t: f64, bulk: &[f64], particles: &[f64], fluxes: &[f64]) {
        self.times.push(t);
        self.bulk.push(bulk.to_vec());
        if self.store_particles {
            self.particles.push(particles.to_vec());
        }
        self.fluxes.push(fluxes.to_vec());
    }

    fn record_sensitivities(&mut self, _t: f64, sens: &[&[f64]]) {
        self.sensitivities
            .push(sens.iter().map(|s| s.to_vec()).collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chromatogram_extraction() {
        let mut rec = InMemoryRecorder::new();
        // 2 components, 3 cells, component-major
        rec.record_solution(0.0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[], &[]);
        rec.record_solution(1.0, &[10.0, 20.0, 30.0, 40.0, 50.0, 60.0], &[], &[]);
        assert_eq!(rec.chromatogram(0, 3), vec![3.0, 30.0]);
        assert_eq!(rec.chromatogram(1, 3), vec![6.0, 60.0]);
    }
}
