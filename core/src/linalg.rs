//! Covariance-oriented linear algebra helpers.
//!
//! The unscented filter needs two factorization-backed operations per step: the scaled
//! square root of the state covariance (for sigma-point generation) and an SPD solve
//! against the innovation covariance (for the Kalman gain). Covariance matrices are
//! symmetric positive semi-definite in exact arithmetic but drift under the a-posteriori
//! downdate, so both operations run through [spd_cholesky]: a Cholesky factorization
//! that, on failure, symmetrizes its input and inflates the diagonal by the smallest
//! escalating increment that makes the factorization succeed. Persistent failure is
//! reported as [FilterError::Divergence] rather than papered over.

use log::{debug, warn};
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, Dyn};

use crate::{FilterError, Real};

/// Number of diagonal-inflation attempts before a factorization is declared divergent.
const REGULARISATION_ATTEMPTS: usize = 8;

/// Returns the symmetric part of a square matrix, `(M + M^T) / 2`.
pub fn symmetrize(matrix: &DMatrix<Real>) -> DMatrix<Real> {
    (matrix + matrix.transpose()) * (0.5 as Real)
}

/// Cholesky factorization of a nominally-SPD matrix, with recovery.
///
/// Attempts the factorization directly first. If that fails the matrix is symmetrized
/// and its diagonal inflated by an escalating epsilon, starting from a small multiple of
/// the largest diagonal magnitude (or machine epsilon for an all-zero diagonal) and
/// growing by a decade per attempt. Each recovery is logged through the `log` facade at
/// `debug` level, with a `warn` once recovery has failed.
///
/// # Errors
/// [FilterError::Divergence] when the matrix still has no Cholesky factor after
/// [REGULARISATION_ATTEMPTS] inflations. `context` names the caller's computation and is
/// carried into the error.
pub fn spd_cholesky(
    matrix: &DMatrix<Real>,
    context: &'static str,
) -> Result<Cholesky<Real, Dyn>, FilterError> {
    if let Some(chol) = matrix.clone().cholesky() {
        return Ok(chol);
    }

    let mut candidate = symmetrize(matrix);
    let diag_scale = candidate
        .diagonal()
        .iter()
        .fold(0.0 as Real, |acc, d| acc.max(d.abs()))
        .max(Real::EPSILON);
    let mut epsilon = diag_scale * (1.0e-12 as Real).max(Real::EPSILON);
    for attempt in 0..REGULARISATION_ATTEMPTS {
        for i in 0..candidate.nrows() {
            candidate[(i, i)] += epsilon;
        }
        if let Some(chol) = candidate.clone().cholesky() {
            debug!(
                "{context}: covariance regularised with epsilon {epsilon:e} (attempt {})",
                attempt + 1
            );
            return Ok(chol);
        }
        epsilon *= 10.0 as Real;
    }

    warn!("{context}: covariance not positive definite after regularisation");
    Err(FilterError::Divergence { context })
}

/// Lower-triangular square root of `scale * matrix`.
///
/// This is the factor used for sigma-point generation: the columns of the result are the
/// tangent-space perturbations applied around the mean. Runs through [spd_cholesky] and
/// shares its recovery and error behavior.
pub fn scaled_sqrt(
    matrix: &DMatrix<Real>,
    scale: Real,
    context: &'static str,
) -> Result<DMatrix<Real>, FilterError> {
    spd_cholesky(&(matrix * scale), context).map(|chol| chol.l())
}

/// Solves `S X = B` for SPD `S`, returning `X`.
///
/// Used for the Kalman gain as `K^T = solve(S_yy, P_xy^T)`, which avoids forming the
/// explicit inverse of the innovation covariance.
pub fn spd_solve(
    s: &DMatrix<Real>,
    b: &DMatrix<Real>,
    context: &'static str,
) -> Result<DMatrix<Real>, FilterError> {
    let chol = spd_cholesky(s, context)?;
    let mut x = b.clone();
    chol.solve_mut(&mut x);
    Ok(x)
}
