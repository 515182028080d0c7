//! Spatial discretization sizes and the state vector indexer.
//!
//! DOF layout of the state vector (see the module docs of `GRM_model`):
//!
//! ```text
//! [ bulk: nComp blocks of nCol cells (component-major) |
//!   particles: nCol blocks of nPar shells, each shell nComp liquid + strideBound bound |
//!   fluxes: nComp blocks of nCol cells ]
//! ```

/// Immutable discretization data, populated by `configure`.
#[derive(Debug, Clone)]
pub struct Discretization {
    pub n_comp: usize,
    pub n_col: usize,
    pub n_par: usize,
    /// number of bound states per component (0 or 1 for the shipped models)
    pub n_bound: Vec<usize>,
    /// total bound states per shell
    pub stride_bound: usize,
    /// first bound-state index of each component within a shell
    pub bound_offset: Vec<usize>,
    pub col_length: f64,
    pub col_porosity: f64,
    pub par_radius: f64,
    pub par_porosity: f64,
    /// shell midpoint radii, ordered surface -> center
    pub par_center_radius: Vec<f64>,
    /// outer shell surface area divided by shell volume
    pub par_outer_surf_area_per_volume: Vec<f64>,
    /// inner shell surface area divided by shell volume
    pub par_inner_surf_area_per_volume: Vec<f64>,
}

impl Discretization {
    pub fn new(
        n_comp: usize,
        n_col: usize,
        n_par: usize,
        n_bound: Vec<usize>,
        col_length: f64,
        col_porosity: f64,
        par_radius: f64,
        par_porosity: f64,
    ) -> Self {
        assert_eq!(n_bound.len(), n_comp);
        let stride_bound: usize = n_bound.iter().sum();
        let mut bound_offset = Vec::with_capacity(n_comp);
        let mut acc = 0;
        for nb in n_bound.iter() {
            bound_offset.push(acc);
            acc += nb;
        }

        // equidistant spherical shells, shell 0 at the particle surface
        let dr = par_radius / n_par as f64;
        let mut par_center_radius = Vec::with_capacity(n_par);
        let mut outer_apv = Vec::with_capacity(n_par);
        let mut inner_apv = Vec::with_capacity(n_par);
        for j in 0..n_par {
            let r_out = par_radius - j as f64 * dr;
            let r_in = r_out - dr;
            let vol = (r_out.powi(3) - r_in.powi(3)) / 3.0;
            par_center_radius.push(0.5 * (r_out + r_in));
            outer_apv.push(r_out * r_out / vol);
            inner_apv.push(r_in * r_in / vol);
        }

        Discretization {
            n_comp,
            n_col,
            n_par,
            n_bound,
            stride_bound,
            bound_offset,
            col_length,
            col_porosity,
            par_radius,
            par_porosity,
            par_center_radius,
            par_outer_surf_area_per_volume: outer_apv,
            par_inner_surf_area_per_volume: inner_apv,
        }
    }

    pub fn col_cell_size(&self) -> f64 {
        self.col_length / self.n_col as f64
    }

    pub fn par_shell_size(&self) -> f64 {
        self.par_radius / self.n_par as f64
    }
}

/// Offsets and strides into the global state vector.
#[derive(Debug, Clone, Copy)]
pub struct Indexer {
    n_comp: usize,
    n_col: usize,
    n_par: usize,
    stride_bound: usize,
}

impl Indexer {
    pub fn new(disc: &Discretization) -> Self {
        Indexer {
            n_comp: disc.n_comp,
            n_col: disc.n_col,
            n_par: disc.n_par,
            stride_bound: disc.stride_bound,
        }
    }

    pub fn num_dofs(&self) -> usize {
        2 * self.n_col * self.n_comp + self.n_col * self.stride_par_block()
    }

    /// bulk entry (comp, col)
    pub fn offset_c(&self, comp: usize, col: usize) -> usize {
        comp * self.stride_col_comp() + col
    }

    /// start of the particle block of column cell `col`
    pub fn offset_cp(&self, col: usize) -> usize {
        self.n_col * self.n_comp + col * self.stride_par_block()
    }

    /// start of the flux block
    pub fn offset_jf(&self) -> usize {
        self.n_col * self.n_comp + self.n_col * self.stride_par_block()
    }

    /// flux entry (comp, col), same component-major layout as the bulk
    pub fn offset_jf_comp(&self, comp: usize, col: usize) -> usize {
        self.offset_jf() + comp * self.stride_col_comp() + col
    }

    pub fn stride_col_comp(&self) -> usize {
        self.n_col
    }

    pub fn stride_par_shell(&self) -> usize {
        self.n_comp + self.stride_bound
    }

    pub fn stride_par_liquid(&self) -> usize {
        self.n_comp
    }

    pub fn stride_par_bound(&self) -> usize {
        self.stride_bound
    }

    pub fn stride_par_block(&self) -> usize {
        self.n_par * self.stride_par_shell()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn disc() -> Discretization {
        Discretization::new(2, 4, 3, vec![1, 0], 1.0, 0.4, 1e-5, 0.6)
    }

    #[test]
    fn test_indexer_layout() {
        let d = disc();
        let idxr = Indexer::new(&d);
        assert_eq!(d.stride_bound, 1);
        assert_eq!(d.bound_offset, vec![0, 1]);
        assert_eq!(idxr.stride_par_shell(), 3);
        assert_eq!(idxr.stride_par_block(), 9);
        // 2*4 bulk + 4*9 particle + 2*4 flux
        assert_eq!(idxr.num_dofs(), 8 + 36 + 8);
        assert_eq!(idxr.offset_cp(0), 8);
        assert_eq!(idxr.offset_cp(3), 8 + 27);
        assert_eq!(idxr.offset_jf(), 44);
        assert_eq!(idxr.offset_c(1, 2), 6);
        assert_eq!(idxr.offset_jf_comp(1, 2), 44 + 6);
    }

    #[test]
    fn test_shell_geometry_sums_to_particle_volume() {
        let d = disc();
        // sum of shell volumes (reconstructed from the area/volume ratios)
        // equals r_p^3 / 3
        let mut vol = 0.0;
        for j in 0..d.n_par {
            let r_out = d.par_radius - j as f64 * d.par_shell_size();
            vol += r_out * r_out / d.par_outer_surf_area_per_volume[j];
        }
        assert_relative_eq!(vol, d.par_radius.powi(3) / 3.0, epsilon = 1e-20);
    }

    #[test]
    fn test_innermost_shell_has_no_inner_area() {
        let d = disc();
        assert_relative_eq!(d.par_inner_surf_area_per_volume[d.n_par - 1], 0.0);
    }
}
