//! Sparse coupling blocks between the flux rows and the bulk / particle
//! blocks of the system Jacobian (`jacFC`, `jacCF`, `jacFP`, `jacPF`).
//!
//! The only operations the solver ever needs are `y += M x` and `y -= M x`,
//! so the wrapper exposes nothing else.

use sprs::{CsMat, TriMat};

#[derive(Debug, Clone)]
pub struct CouplingMatrix {
    mat: CsMat<f64>,
}

impl CouplingMatrix {
    pub fn from_triplets(
        n_rows: usize,
        n_cols: usize,
        triplets: &[(usize, usize, f64)],
    ) -> Self {
        let mut tri = TriMat::new((n_rows, n_cols));
        for &(r, c, v) in triplets.iter() {
            tri.add_triplet(r, c, v);
        }
        CouplingMatrix {
            mat: tri.to_csr(),
        }
    }

    pub fn rows(&self) -> usize {
        self.mat.rows()
    }

    pub fn cols(&self) -> usize {
        self.mat.cols()
    }

    /// `y += M x`
    pub fn multiply_add(&self, x: &[f64], y: &mut [f64]) {
        for (r, row) in self.mat.outer_iterator().enumerate() {
            let mut acc = 0.0;
            for (c, &v) in row.iter() {
                acc += v * x[c];
            }
            y[r] += acc;
        }
    }

    /// `y -= M x`
    pub fn multiply_subtract(&self, x: &[f64], y: &mut [f64]) {
        for (r, row) in self.mat.outer_iterator().enumerate() {
            let mut acc = 0.0;
            for (c, &v) in row.iter() {
                acc += v * x[c];
            }
            y[r] -= acc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_multiply_add_subtract() {
        // 3 x 4 with a few entries
        let m = CouplingMatrix::from_triplets(
            3,
            4,
            &[(0, 0, 2.0), (0, 3, -1.0), (1, 1, 0.5), (2, 2, 3.0), (2, 0, 1.0)],
        );
        let x = vec![1.0, 2.0, -1.0, 4.0];
        let mut y = vec![10.0, 10.0, 10.0];
        m.multiply_add(&x, &mut y);
        assert_relative_eq!(y[0], 10.0 + 2.0 - 4.0);
        assert_relative_eq!(y[1], 10.0 + 1.0);
        assert_relative_eq!(y[2], 10.0 - 3.0 + 1.0);

        m.multiply_subtract(&x, &mut y);
        assert_relative_eq!(y[0], 10.0);
        assert_relative_eq!(y[1], 10.0);
        assert_relative_eq!(y[2], 10.0);
    }
}
