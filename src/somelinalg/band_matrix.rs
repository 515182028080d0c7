//! # Banded matrix kernels
//!
//! Row-stencil banded storage for the diagonal Jacobian blocks of the
//! general rate model. An `n x n` matrix with `kl` sub- and `ku`
//! superdiagonals stores each row as a contiguous stencil,
//!
//! ```text
//! element (r, c) with  -kl <= c - r <= ku   at   data[r * stride + (c - r + kl)]
//! ```
//!
//! so that assembling a discretization writes one stencil per row in place.
//! `FactorizableBandMatrix` carries `kl` additional superdiagonals for the
//! fill-in produced by partial (row) pivoting, the same trick as LAPACK's
//! `dgbtrf` and the banded LU rewrite in RustedLINPACK. The factorization is
//! faster than a dense LU by N / bandwidth.

use std::ops::{Index, IndexMut};

/// Banded matrix without factorization support. Holds the "original"
/// Jacobian blocks that survive a linear solve unchanged.
#[derive(Debug, Clone)]
pub struct BandMatrix {
    rows: usize,
    kl: usize,
    ku: usize,
    data: Vec<f64>,
}

/// Mutable view of one stencil row, indexed by the diagonal offset
/// `c - r` (0 is the main diagonal).
pub struct BandRowMut<'a> {
    data: &'a mut [f64],
    kl: usize,
}

impl<'a> Index<isize> for BandRowMut<'a> {
    type Output = f64;
    fn index(&self, offset: isize) -> &f64 {
        &self.data[(offset + self.kl as isize) as usize]
    }
}

impl<'a> IndexMut<isize> for BandRowMut<'a> {
    fn index_mut(&mut self, offset: isize) -> &mut f64 {
        &mut self.data[(offset + self.kl as isize) as usize]
    }
}

impl BandMatrix {
    pub fn new(rows: usize, kl: usize, ku: usize) -> Self {
        BandMatrix {
            rows,
            kl,
            ku,
            data: vec![0.0; rows * (kl + ku + 1)],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn lower_bandwidth(&self) -> usize {
        self.kl
    }

    pub fn upper_bandwidth(&self) -> usize {
        self.ku
    }

    fn stride(&self) -> usize {
        self.kl + self.ku + 1
    }

    pub fn set_all(&mut self, value: f64) {
        for v in self.data.iter_mut() {
            *v = value;
        }
    }

    /// Element (r, r + offset); zero outside the band.
    pub fn get(&self, r: usize, offset: isize) -> f64 {
        if offset < -(self.kl as isize) || offset > self.ku as isize {
            return 0.0;
        }
        self.data[r * self.stride() + (offset + self.kl as isize) as usize]
    }

    pub fn row_mut(&mut self, r: usize) -> BandRowMut {
        let stride = self.stride();
        BandRowMut {
            data: &mut self.data[r * stride..(r + 1) * stride],
            kl: self.kl,
        }
    }

    pub(crate) fn row_data(&self, r: usize) -> &[f64] {
        let stride = self.stride();
        &self.data[r * stride..(r + 1) * stride]
    }

    /// `y <- alpha * M * x + beta * y` over the full matrix.
    pub fn multiply_vector(&self, x: &[f64], alpha: f64, beta: f64, y: &mut [f64]) {
        let stride = self.stride();
        for r in 0..self.rows {
            let mut acc = 0.0;
            let lo = r.saturating_sub(self.kl);
            let hi = (r + self.ku + 1).min(self.rows);
            for c in lo..hi {
                acc += self.data[r * stride + (c + self.kl - r)] * x[c];
            }
            y[r] = alpha * acc + beta * y[r];
        }
    }

    /// `y <- alpha * M_sub * x + beta * y` for the submatrix whose element
    /// (i, j) is the global element (row_off + i, row_off + diag_off + j).
    /// `diag_off` is the diagonal offset of the submatrix's first column
    /// relative to the first row. Entries outside the band count as zero.
    pub fn submatrix_multiply_vector(
        &self,
        x: &[f64],
        row_off: usize,
        diag_off: isize,
        n_rows: usize,
        n_cols: usize,
        alpha: f64,
        beta: f64,
        y: &mut [f64],
    ) {
        let stride = self.stride();
        let col0 = row_off as isize + diag_off;
        for i in 0..n_rows {
            let r = row_off + i;
            let mut acc = 0.0;
            for j in 0..n_cols {
                let c = col0 + j as isize;
                if c < 0 || c >= self.rows as isize {
                    continue;
                }
                let offset = c - r as isize;
                if offset < -(self.kl as isize) || offset > self.ku as isize {
                    continue;
                }
                acc += self.data[r * stride + (offset + self.kl as isize) as usize] * x[j];
            }
            y[i] = alpha * acc + beta * y[i];
        }
    }
}

/// Banded matrix with `kl` extra superdiagonals for pivoting fill-in,
/// in-place banded LU and solve. Receives the time-discretized Jacobian
/// blocks; its storage doubles as the dense scratch arena during algebraic
/// consistent initialization.
#[derive(Debug, Clone)]
pub struct FactorizableBandMatrix {
    rows: usize,
    kl: usize,
    ku: usize,
    data: Vec<f64>,
    pivot: Vec<usize>,
    factorized: bool,
}

impl FactorizableBandMatrix {
    pub fn new(rows: usize, kl: usize, ku: usize) -> Self {
        FactorizableBandMatrix {
            rows,
            kl,
            ku,
            data: vec![0.0; rows * (2 * kl + ku + 1)],
            pivot: vec![0; rows],
            factorized: false,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn lower_bandwidth(&self) -> usize {
        self.kl
    }

    pub fn upper_bandwidth(&self) -> usize {
        self.ku
    }

    /// Width of the stored stencil, including the fill-in diagonals.
    fn stride(&self) -> usize {
        2 * self.kl + self.ku + 1
    }

    #[inline]
    fn at(&self, r: usize, offset: isize) -> f64 {
        self.data[r * self.stride() + (offset + self.kl as isize) as usize]
    }

    #[inline]
    fn at_mut(&mut self, r: usize, offset: isize) -> &mut f64 {
        let stride = self.stride();
        &mut self.data[r * stride + (offset + self.kl as isize) as usize]
    }

    pub fn set_all(&mut self, value: f64) {
        for v in self.data.iter_mut() {
            *v = value;
        }
        self.factorized = false;
    }

    pub fn row_mut(&mut self, r: usize) -> BandRowMut {
        let stride = self.stride();
        self.factorized = false;
        BandRowMut {
            data: &mut self.data[r * stride..(r + 1) * stride],
            kl: self.kl,
        }
    }

    /// Copies a plain band matrix over, zeroing the fill-in diagonals.
    /// Bandwidths must match.
    pub fn copy_over(&mut self, other: &BandMatrix) {
        assert_eq!(self.rows, other.rows());
        assert_eq!(self.kl, other.lower_bandwidth());
        assert_eq!(self.ku, other.upper_bandwidth());
        let stride = self.stride();
        let src_stride = self.kl + self.ku + 1;
        for v in self.data.iter_mut() {
            *v = 0.0;
        }
        for r in 0..self.rows {
            let src = other.row_data(r);
            self.data[r * stride..r * stride + src_stride].copy_from_slice(src);
        }
        self.factorized = false;
    }

    /// Overwrites row `r` with row `src_row` of `other` (used to replace
    /// time-derivative rows with the algebraic Jacobian rows during
    /// consistent initialization). Fill-in entries are zeroed.
    pub fn copy_row_from(&mut self, r: usize, other: &BandMatrix, src_row: usize) {
        let stride = self.stride();
        let src_stride = other.lower_bandwidth() + other.upper_bandwidth() + 1;
        let row = &mut self.data[r * stride..(r + 1) * stride];
        for v in row.iter_mut() {
            *v = 0.0;
        }
        row[..src_stride].copy_from_slice(other.row_data(src_row));
        self.factorized = false;
    }

    /// Banded LU decomposition with partial (row) pivoting, in place.
    /// Returns `false` on a zero pivot; the caller reports a recoverable
    /// error to the integrator.
    pub fn factorize(&mut self) -> bool {
        let n = self.rows;
        let kl = self.kl;
        let width = self.ku + self.kl; // widest reach of U after fill-in
        for i in 0..n {
            // pivot search in column i, rows i..=i+kl
            let r_end = (i + kl + 1).min(n);
            let mut piv = i;
            let mut piv_val = self.at(i, 0).abs();
            for r in (i + 1)..r_end {
                let v = self.at(r, i as isize - r as isize).abs();
                if v > piv_val {
                    piv_val = v;
                    piv = r;
                }
            }
            if piv_val == 0.0 {
                self.factorized = false;
                return false;
            }
            self.pivot[i] = piv;

            if piv != i {
                // swap rows i and piv on columns i..=i+width
                let c_end = (i + width + 1).min(n);
                for c in i..c_end {
                    let oi = c as isize - i as isize;
                    let op = c as isize - piv as isize;
                    let a = self.at(i, oi);
                    let b = self.at(piv, op);
                    *self.at_mut(i, oi) = b;
                    *self.at_mut(piv, op) = a;
                }
            }

            // Gaussian elimination on rows below the pivot
            let diag = self.at(i, 0);
            let inv_diag = 1.0 / diag;
            let c_end = (i + width + 1).min(n);
            for r in (i + 1)..r_end {
                let l = self.at(r, i as isize - r as isize) * inv_diag;
                *self.at_mut(r, i as isize - r as isize) = l;
                for c in (i + 1)..c_end {
                    let pr = self.at(i, c as isize - i as isize);
                    *self.at_mut(r, c as isize - r as isize) -= l * pr;
                }
            }
        }
        self.factorized = true;
        true
    }

    /// Solves `L U x = P b` in place. `factorize` must have succeeded.
    pub fn solve(&self, b: &mut [f64]) -> bool {
        if !self.factorized {
            return false;
        }
        let n = self.rows;
        let kl = self.kl;
        let width = self.ku + self.kl;

        // forward substitution with interleaved row interchanges
        for i in 0..n {
            let piv = self.pivot[i];
            if piv != i {
                b.swap(i, piv);
            }
            let r_end = (i + kl + 1).min(n);
            for r in (i + 1)..r_end {
                b[r] -= self.at(r, i as isize - r as isize) * b[i];
            }
        }

        // backward substitution
        for i in (0..n).rev() {
            let c_end = (i + width + 1).min(n);
            let mut acc = b[i];
            for c in (i + 1)..c_end {
                acc -= self.at(i, c as isize - i as isize) * b[c];
            }
            let diag = self.at(i, 0);
            if diag == 0.0 {
                return false;
            }
            b[i] = acc / diag;
        }
        true
    }

    /// Raw storage and pivot buffer, reused as a dense scratch arena by the
    /// algebraic consistent initialization. Invalidates any factorization.
    pub fn scratch(&mut self) -> (&mut [f64], &mut [usize]) {
        self.factorized = false;
        (&mut self.data, &mut self.pivot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    fn fill_test_band(n: usize, kl: usize, ku: usize) -> (BandMatrix, DMatrix<f64>) {
        let mut bm = BandMatrix::new(n, kl, ku);
        let mut dm = DMatrix::zeros(n, n);
        for r in 0..n {
            let mut row = bm.row_mut(r);
            for off in -(kl as isize)..=(ku as isize) {
                let c = r as isize + off;
                if c < 0 || c >= n as isize {
                    continue;
                }
                // deterministic, diagonally dominant-ish entries
                let v = if off == 0 {
                    4.0 + (r as f64) * 0.1
                } else {
                    ((r * 7 + (off + 3) as usize * 13) % 11) as f64 * 0.3 - 1.2
                };
                row[off] = v;
                dm[(r, c as usize)] = v;
            }
        }
        (bm, dm)
    }

    #[test]
    fn test_banded_lu_vs_dense() {
        let (bm, dm) = fill_test_band(20, 2, 3);
        let mut fbm = FactorizableBandMatrix::new(20, 2, 3);
        fbm.copy_over(&bm);
        assert!(fbm.factorize());

        let b: Vec<f64> = (0..20).map(|i| (i as f64 * 0.37).sin() + 1.0).collect();
        let mut x = b.clone();
        assert!(fbm.solve(&mut x));

        let x_ref = dm
            .clone()
            .lu()
            .solve(&DVector::from_vec(b.clone()))
            .unwrap();
        for i in 0..20 {
            assert_relative_eq!(x[i], x_ref[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_banded_lu_needs_pivoting() {
        // zero on the first diagonal entry forces a row swap
        let n = 6;
        let mut bm = BandMatrix::new(n, 1, 1);
        let mut dm = DMatrix::zeros(n, n);
        let entries = [
            (0, 0, 0.0),
            (0, 1, 2.0),
            (1, 0, 3.0),
            (1, 1, 1.0),
            (1, 2, -1.0),
            (2, 1, 1.0),
            (2, 2, 5.0),
            (2, 3, 0.5),
            (3, 2, -2.0),
            (3, 3, 4.0),
            (3, 4, 1.0),
            (4, 3, 1.0),
            (4, 4, 3.0),
            (4, 5, -1.0),
            (5, 4, 2.0),
            (5, 5, 2.0),
        ];
        for &(r, c, v) in entries.iter() {
            bm.row_mut(r)[c as isize - r as isize] = v;
            dm[(r, c)] = v;
        }
        let mut fbm = FactorizableBandMatrix::new(n, 1, 1);
        fbm.copy_over(&bm);
        assert!(fbm.factorize());
        let b = vec![1.0, -1.0, 2.0, 0.0, 1.0, 3.0];
        let mut x = b.clone();
        assert!(fbm.solve(&mut x));
        let x_ref = dm.lu().solve(&DVector::from_vec(b)).unwrap();
        for i in 0..n {
            assert_relative_eq!(x[i], x_ref[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_singular_factorization_fails() {
        let bm = BandMatrix::new(4, 1, 1); // all zeros
        let mut fbm = FactorizableBandMatrix::new(4, 1, 1);
        fbm.copy_over(&bm);
        assert!(!fbm.factorize());
    }

    #[test]
    fn test_multiply_vector() {
        let (bm, dm) = fill_test_band(12, 1, 2);
        let x: Vec<f64> = (0..12).map(|i| (i as f64 + 1.0) * 0.25).collect();
        let mut y = vec![1.0; 12];
        bm.multiply_vector(&x, 2.0, -1.0, &mut y);
        let y_ref = 2.0 * &dm * DVector::from_vec(x) - DVector::from_element(12, 1.0);
        for i in 0..12 {
            assert_relative_eq!(y[i], y_ref[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_submatrix_multiply_vector() {
        let (bm, dm) = fill_test_band(15, 3, 3);
        // submatrix rows 6..9, first column at global column 4 (diag_off -2)
        let x = vec![0.5, -1.0, 2.0, 1.5, 0.25];
        let mut y = vec![0.0; 3];
        bm.submatrix_multiply_vector(&x, 6, -2, 3, 5, 1.0, 0.0, &mut y);
        for i in 0..3 {
            let mut acc = 0.0;
            for j in 0..5 {
                acc += dm[(6 + i, 4 + j)] * x[j];
            }
            assert_relative_eq!(y[i], acc, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_copy_row_from() {
        let (bm, _) = fill_test_band(10, 2, 2);
        let mut fbm = FactorizableBandMatrix::new(10, 2, 2);
        fbm.set_all(7.0);
        fbm.copy_row_from(4, &bm, 4);
        for off in -2isize..=2 {
            assert_relative_eq!(fbm.at(4, off), bm.get(4, off));
        }
        // fill-in part of the row is zeroed
        assert_relative_eq!(fbm.at(4, 3), 0.0);
        assert_relative_eq!(fbm.at(4, 4), 0.0);
    }
}
