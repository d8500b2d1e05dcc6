//! Cholesky factorization of small symmetric positive definite `ndarray`
//! matrices through faer.
//!
//! The matrices factorized here are posterior curvatures and IRLS Hessians
//! with one row per model parameter, so inputs are copied into faer storage.

use faer::linalg::solvers::{self, Solve};
use faer::linalg::triangular_solve;
use faer::{Mat, Par, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("triangular factor has a zero on its diagonal at position {0}")]
    SingularFactor(usize),
}

/// `A = L Lᵀ` for a symmetric positive definite `A`.
pub struct FaerCholeskyFactor {
    llt: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    /// Solves `A x = rhs`.
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let column = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let solution = self.llt.solve(column.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| solution[(i, 0)])
    }

    pub fn lower(&self) -> Array2<f64> {
        let l = self.llt.L();
        Array2::from_shape_fn((l.nrows(), l.ncols()), |(i, j)| l[(i, j)])
    }

    /// Returns `L⁻ᵀ`, the matrix `W` with `W Wᵀ = A⁻¹`.
    ///
    /// Solves the upper-triangular system `Lᵀ W = I` with faer.
    pub fn inverse_transpose_factor(&self) -> Result<Array2<f64>, FaerLinalgError> {
        let l = self.llt.L();
        let n = l.nrows();
        if let Some(row) = (0..n).find(|&i| {
            let pivot = l[(i, i)];
            pivot == 0.0 || !pivot.is_finite()
        }) {
            return Err(FaerLinalgError::SingularFactor(row));
        }
        let mut w = Mat::<f64>::identity(n, n);
        triangular_solve::solve_upper_triangular_in_place(l.transpose(), w.as_mut(), Par::Seq);
        Ok(Array2::from_shape_fn((n, n), |(i, j)| w[(i, j)]))
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let (rows, cols) = self.dim();
        let mat = Mat::from_fn(rows, cols, |i, j| self[(i, j)]);
        let llt = mat.as_ref().llt(side).map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { llt })
    }
}
