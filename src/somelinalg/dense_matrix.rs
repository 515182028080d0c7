//! Dense LU over borrowed scratch storage.
//!
//! During the algebraic step of consistent initialization every particle
//! shell needs a small dense Jacobian of the binding equations. Instead of
//! allocating one per shell, the factorizable band matrix of the particle
//! block lends out its storage and pivot buffer; `DenseMatrixView` is the
//! typed view over that arena.

use super::band_matrix::BandMatrix;

pub struct DenseMatrixView<'a> {
    n: usize,
    data: &'a mut [f64],
    pivot: &'a mut [usize],
}

impl<'a> DenseMatrixView<'a> {
    /// Borrows `n * n` doubles and `n` pivots from the given scratch slices.
    pub fn new(data: &'a mut [f64], pivot: &'a mut [usize], n: usize) -> Self {
        assert!(data.len() >= n * n, "dense scratch too small");
        assert!(pivot.len() >= n, "pivot scratch too small");
        DenseMatrixView {
            n,
            data: &mut data[..n * n],
            pivot: &mut pivot[..n],
        }
    }

    pub fn order(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.n + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.n + c] = v;
    }

    pub fn set_all(&mut self, v: f64) {
        for x in self.data.iter_mut() {
            *x = v;
        }
    }

    /// Copies the `n_rows x n_cols` submatrix of `src` starting at
    /// (`row_off`, `row_off + diag_off`) into the top-left corner of this
    /// view. Band entries outside the stencil read as zero.
    pub fn copy_submatrix_from_banded(
        &mut self,
        src: &BandMatrix,
        row_off: usize,
        diag_off: isize,
        n_rows: usize,
        n_cols: usize,
    ) {
        assert!(n_rows <= self.n && n_cols <= self.n);
        for i in 0..n_rows {
            let r = row_off + i;
            for j in 0..n_cols {
                let c = row_off as isize + diag_off + j as isize;
                let v = if c < 0 || c >= src.rows() as isize {
                    0.0
                } else {
                    src.get(r, c - r as isize)
                };
                self.data[i * self.n + j] = v;
            }
        }
    }

    /// In-place LU with partial pivoting. Returns `false` on a zero pivot.
    pub fn factorize(&mut self) -> bool {
        let n = self.n;
        for i in 0..n {
            let mut piv = i;
            let mut piv_val = self.data[i * n + i].abs();
            for r in (i + 1)..n {
                let v = self.data[r * n + i].abs();
                if v > piv_val {
                    piv_val = v;
                    piv = r;
                }
            }
            if piv_val == 0.0 {
                return false;
            }
            self.pivot[i] = piv;
            if piv != i {
                for c in 0..n {
                    self.data.swap(i * n + c, piv * n + c);
                }
            }
            let inv_diag = 1.0 / self.data[i * n + i];
            for r in (i + 1)..n {
                let l = self.data[r * n + i] * inv_diag;
                self.data[r * n + i] = l;
                for c in (i + 1)..n {
                    self.data[r * n + c] -= l * self.data[i * n + c];
                }
            }
        }
        true
    }

    /// Solves in place using the factorization from `factorize`.
    pub fn solve(&self, b: &mut [f64]) -> bool {
        let n = self.n;
        for i in 0..n {
            let piv = self.pivot[i];
            if piv != i {
                b.swap(i, piv);
            }
            for r in (i + 1)..n {
                b[r] -= self.data[r * n + i] * b[i];
            }
        }
        for i in (0..n).rev() {
            let mut acc = b[i];
            for c in (i + 1)..n {
                acc -= self.data[i * n + c] * b[c];
            }
            let diag = self.data[i * n + i];
            if diag == 0.0 {
                return false;
            }
            b[i] = acc / diag;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn test_dense_lu_vs_nalgebra() {
        let n = 5;
        let vals = [
            2.0, -1.0, 0.5, 0.0, 1.0, //
            -3.0, 4.0, 1.0, 0.2, 0.0, //
            0.0, 1.5, -2.0, 1.0, 0.3, //
            1.0, 0.0, 2.0, 3.0, -1.0, //
            0.5, 0.5, 0.0, -1.0, 2.5,
        ];
        let mut data = vals.to_vec();
        let mut pivot = vec![0usize; n];
        let mut view = DenseMatrixView::new(&mut data, &mut pivot, n);
        assert!(view.factorize());
        let b = vec![1.0, 0.0, -2.0, 3.0, 0.5];
        let mut x = b.clone();
        assert!(view.solve(&mut x));

        let dm = DMatrix::from_row_slice(n, n, &vals);
        let x_ref = dm.lu().solve(&DVector::from_vec(b)).unwrap();
        for i in 0..n {
            assert_relative_eq!(x[i], x_ref[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_copy_submatrix_from_banded() {
        let mut bm = BandMatrix::new(8, 2, 2);
        for r in 0..8 {
            let mut row = bm.row_mut(r);
            for off in -2isize..=2 {
                let c = r as isize + off;
                if c < 0 || c >= 8 {
                    continue;
                }
                row[off] = (r * 10) as f64 + c as f64;
            }
        }
        let mut data = vec![0.0; 16];
        let mut pivot = vec![0usize; 4];
        let mut view = DenseMatrixView::new(&mut data, &mut pivot, 3);
        view.copy_submatrix_from_banded(&bm, 3, -1, 3, 3);
        // element (0, 0) of the view is global (3, 2)
        assert_relative_eq!(view.get(0, 0), 32.0);
        assert_relative_eq!(view.get(1, 1), 43.0);
        // global (3, 4) is inside the band, (5, 2) is on the edge
        assert_relative_eq!(view.get(0, 2), 34.0);
        assert_relative_eq!(view.get(2, 0), 52.0);
    }
}
