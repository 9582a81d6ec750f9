//! Manifold unscented Kalman filtering for attitude and heading reference systems
//!
//! This crate provides a sigma-point (unscented) Kalman filter that operates on state
//! vectors composed of heterogeneous field types: ordinary Euclidean vectors, unit
//! quaternions, and free matrix parameters. The filter is written against a typed field
//! registry rather than a bare coefficient array, so every estimator built on it keeps
//! per-field identity for reads, writes, and the manifold arithmetic that quaternion
//! states require. The motivating application, included as the [ahrs] module, is a
//! 9-axis attitude and heading reference system (AHRS) that fuses accelerometer,
//! gyroscope, and magnetometer streams while a second, coupled filter estimates
//! per-sensor bias and scale-factor errors online.
//!
//! This crate is primarily built off of one dependency:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools
//!   for the filters (dynamic vectors and matrices, quaternion algebra, and the Cholesky
//!   factorizations used for sigma-point generation and gain computation).
//!
//! All other functionality is auxiliary (logging via the [`log`](https://crates.io/crates/log)
//! facade, CSV scenario records via `serde`/`csv`, seeded noise via `rand`). The crate
//! never installs a logger or decides a sink; binaries do that.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [linalg]: Covariance-oriented matrix helpers: symmetrization, robust SPD Cholesky
//!   with diagonal regularisation, SPD solves, and the scaled covariance square root.
//! - [fields]: The typed field registry: field kinds, field values, and the schema that
//!   maps an ordered field list onto stored and tangent layouts.
//! - [state]: The typed state vector with its manifold operations (retract, difference,
//!   per-field weighted means) and the state-shaped rate type used by the integrator.
//! - [integrator]: Euler and fourth-order Runge-Kutta stepping over the state manifold.
//! - [measurement]: The dynamic measurement vector: a runtime-composed ordered set of
//!   enabled measurement fields with a matching noise-diagonal assembly.
//! - [ukf]: The unscented filter core: a-priori, innovation, and a-posteriori steps with
//!   the intermediates the two-filter coupling protocol needs left public.
//! - [ahrs]: The example 9-axis AHRS wiring: field enums, process and measurement models
//!   in both coupling directions, tuning defaults, and the coupled-pair driver.
//! - [sim]: Synthetic scenario generation and CSV records for the simulator binary and
//!   the integration tests.
//!
//! ## State representation
//!
//! A state is described by an ordered list of `(key, kind)` pairs. Each kind carries two
//! arities: the *stored* arity (slots occupied in the flat coefficient vector) and the
//! *tangent* arity (degrees of freedom contributed to the covariance). A quaternion
//! stores four coefficients but contributes three degrees of freedom; vectors and free
//! matrices contribute equal counts of both. Covariances, process noise, sigma-point
//! perturbations, and Kalman corrections all live in the tangent space; the stored
//! representation is only touched through the field-aware retract and difference
//! operations. See [state::StateVector] for the exact small-angle conventions.
//!
//! ## Precision
//!
//! The whole public surface is expressed in a single real scalar type, [Real], chosen at
//! build time: `f64` by default, `f32` when the `single-precision` feature is enabled.
//! [precision] reports which one was compiled in.

pub mod ahrs;
pub mod fields;
pub mod integrator;
pub mod linalg;
pub mod measurement;
pub mod sim;
pub mod state;
pub mod ukf;

use std::fmt::{self, Display};

/// Scalar type used across the crate, selected at build time.
#[cfg(feature = "single-precision")]
pub type Real = f32;
/// Scalar type used across the crate, selected at build time.
#[cfg(not(feature = "single-precision"))]
pub type Real = f64;

/// Width of the compiled [Real] type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    /// `Real` is a 32-bit float.
    Single,
    /// `Real` is a 64-bit float.
    Double,
}

/// Reports the floating-point width the crate was compiled with.
pub fn precision() -> Precision {
    if std::mem::size_of::<Real>() == 8 {
        Precision::Double
    } else {
        Precision::Single
    }
}

/// Numeric failures surfaced by the filter steps.
///
/// Protocol misuse (steps out of order, field-arity mismatches) is a programming error
/// and panics instead; see the crate-level docs. Errors of this type leave the filter's
/// last good state and covariance readable, and [ukf::UnscentedKalmanFilter::reset]
/// clears the condition.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterError {
    /// A covariance could not be factorized even after symmetrization and diagonal
    /// regularisation, or a model produced a non-finite value.
    Divergence {
        /// Which computation detected the failure.
        context: &'static str,
    },
}

impl Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::Divergence { context } => {
                write!(f, "numeric divergence in {context}")
            }
        }
    }
}

impl std::error::Error for FilterError {}

pub use fields::{FieldKey, FieldKind, FieldValue, Schema};
pub use integrator::Integrator;
pub use measurement::{MeasurementModel, MeasurementVector};
pub use state::{StateRate, StateVector};
pub use ukf::{ProcessModel, UkfParams, UnscentedKalmanFilter};
