//! Typed state vectors and their manifold arithmetic.
//!
//! A [StateVector] is a flat coefficient vector interpreted through a [Schema]: every
//! read, write, and tangent-space operation goes through the field registry, so the
//! quaternion fields are never treated as four independent scalars. Three operations
//! define the manifold structure the filter runs on:
//!
//! - [StateVector::retract] applies a tangent-space perturbation to a state. Vector and
//!   matrix fields add their slice of the perturbation; a quaternion field interprets
//!   its three tangent components as a small rotation `omega`, builds the unit
//!   quaternion with vector part `omega / 2`, and right-multiplies it onto the field.
//! - [StateVector::difference] lifts the displacement between two states into the
//!   tangent space and is the exact small-angle inverse of the retraction: the
//!   quaternion delta is computed as `base^-1 * q`, re-signed to a non-negative scalar
//!   part, and unpacked as twice its vector part.
//! - [StateVector::weighted_mean] averages a sigma set per field. Vector and matrix
//!   fields take the ordinary weighted sum; quaternion fields take an intrinsic mean:
//!   seeded from the first sample, a fixed number of iterations each average the tangent
//!   residuals of all samples and retract the running mean by the result.
//!
//! [StateRate] is the state-shaped derivative type consumed by the integrator. It shares
//! the stored layout but different semantics: a quaternion slot holds a *pure* rate
//! quaternion (zero scalar, vector part equal to the model's half angular rate), and
//! rates combine linearly without renormalisation. Only [StateVector::advanced] turns a
//! scaled rate back into a point on the manifold.

use std::sync::Arc;

use nalgebra::{DVector, Matrix3, Quaternion, Vector3};

use crate::fields::{FieldKind, FieldValue, Schema};
use crate::{FieldKey, FilterError, Real};

/// Iterations of the intrinsic quaternion mean.
const QUATERNION_MEAN_ITERATIONS: usize = 3;

/// Unit quaternion for a small rotation, from the half-angle vector `v`.
///
/// The scalar part is `sqrt(1 - |v|^2)` while that is non-negative; past the small-angle
/// range the quaternion `(1, v)` is renormalised instead.
pub(crate) fn small_angle_quaternion(v: Vector3<Real>) -> Quaternion<Real> {
    let w_sq = 1.0 as Real - v.norm_squared();
    if w_sq >= 0.0 {
        Quaternion::new(w_sq.sqrt(), v.x, v.y, v.z)
    } else {
        Quaternion::new(1.0, v.x, v.y, v.z).normalize()
    }
}

/// Exponential map of a pure quaternion with vector part `v`: `(cos |v|, sin |v| * v/|v|)`.
///
/// Used by the integrator's apply step, where the rate magnitude is not bounded by the
/// sigma-point spread and the exact map costs nothing extra.
pub(crate) fn exp_map(v: Vector3<Real>) -> Quaternion<Real> {
    let theta = v.norm();
    if theta < Real::EPSILON.sqrt() {
        return small_angle_quaternion(v);
    }
    let (s, c) = theta.sin_cos();
    let axis = v * (s / theta);
    Quaternion::new(c, axis.x, axis.y, axis.z)
}

/// A typed state vector over a shared [Schema].
///
/// Quaternion fields are stored as `[x, y, z, w]` (vector part first), matching the
/// layout `nalgebra` uses internally and the order the flat C ABI exposes. Callers are
/// expected to supply unit quaternions through the setters; the manifold operations
/// renormalise after every retraction, so unit norm holds whenever a state is observed
/// between steps.
#[derive(Clone, Debug)]
pub struct StateVector<K: FieldKey> {
    schema: Arc<Schema<K>>,
    data: DVector<Real>,
}

impl<K: FieldKey> StateVector<K> {
    /// Creates a state with all vector and matrix fields zeroed and all quaternion
    /// fields set to identity.
    pub fn zeroed(schema: Arc<Schema<K>>) -> Self {
        let mut data = DVector::zeros(schema.stored_size());
        for entry in schema.entries() {
            if entry.kind == FieldKind::Quaternion {
                // w slot of the identity quaternion.
                data[entry.stored_offset + 3] = 1.0;
            }
        }
        StateVector { schema, data }
    }

    /// The schema this state was built against.
    pub fn schema(&self) -> &Arc<Schema<K>> {
        &self.schema
    }

    /// The raw stored coefficients, in schema order.
    pub fn coefficients(&self) -> &DVector<Real> {
        &self.data
    }

    /// Generic getter; see the typed accessors for the common cases.
    pub fn get_field(&self, key: K) -> FieldValue {
        let entry = self.schema.entry(key);
        match entry.kind {
            FieldKind::Vector(n) => FieldValue::Vector(DVector::from_column_slice(
                &self.data.as_slice()[entry.stored_offset..entry.stored_offset + n],
            )),
            FieldKind::Quaternion => FieldValue::Quaternion(self.quaternion_at(entry.stored_offset)),
            FieldKind::Matrix3 => FieldValue::Matrix3(Matrix3::from_column_slice(
                &self.data.as_slice()[entry.stored_offset..entry.stored_offset + 9],
            )),
        }
    }

    /// Generic setter; the value must match the field's kind and arity.
    ///
    /// # Panics
    /// On a kind or length mismatch; both are programming errors.
    pub fn set_field(&mut self, key: K, value: FieldValue) {
        let entry = *self.schema.entry(key);
        match (entry.kind, value) {
            (FieldKind::Vector(n), FieldValue::Vector(v)) => {
                if v.len() != n {
                    panic!("field {:?} expects {n} components, got {}", entry.key, v.len());
                }
                self.data.as_mut_slice()[entry.stored_offset..entry.stored_offset + n]
                    .copy_from_slice(v.as_slice());
            }
            (FieldKind::Quaternion, FieldValue::Quaternion(q)) => {
                self.write_quaternion(entry.stored_offset, &q);
            }
            (FieldKind::Matrix3, FieldValue::Matrix3(m)) => {
                self.data.as_mut_slice()[entry.stored_offset..entry.stored_offset + 9]
                    .copy_from_slice(m.as_slice());
            }
            (kind, value) => {
                panic!("field {:?} has kind {kind:?}, got incompatible value {value:?}", entry.key)
            }
        }
    }

    /// Reads a three-component vector field.
    pub fn vector3(&self, key: K) -> Vector3<Real> {
        let entry = self.schema.entry(key);
        match entry.kind {
            FieldKind::Vector(3) => Vector3::from_column_slice(
                &self.data.as_slice()[entry.stored_offset..entry.stored_offset + 3],
            ),
            kind => panic!("field {:?} is {kind:?}, not a 3-vector", entry.key),
        }
    }

    /// Writes a three-component vector field.
    pub fn set_vector3(&mut self, key: K, value: Vector3<Real>) {
        self.set_field(key, FieldValue::from(value));
    }

    /// Reads a quaternion field.
    pub fn quaternion(&self, key: K) -> Quaternion<Real> {
        let entry = self.schema.entry(key);
        match entry.kind {
            FieldKind::Quaternion => self.quaternion_at(entry.stored_offset),
            kind => panic!("field {:?} is {kind:?}, not a quaternion", entry.key),
        }
    }

    /// Writes a quaternion field. The caller supplies a unit quaternion.
    pub fn set_quaternion(&mut self, key: K, value: Quaternion<Real>) {
        self.set_field(key, FieldValue::Quaternion(value));
    }

    /// Reads a 3x3 matrix field.
    pub fn matrix3(&self, key: K) -> Matrix3<Real> {
        let entry = self.schema.entry(key);
        match entry.kind {
            FieldKind::Matrix3 => Matrix3::from_column_slice(
                &self.data.as_slice()[entry.stored_offset..entry.stored_offset + 9],
            ),
            kind => panic!("field {:?} is {kind:?}, not a matrix", entry.key),
        }
    }

    /// Writes a 3x3 matrix field.
    pub fn set_matrix3(&mut self, key: K, value: Matrix3<Real>) {
        self.set_field(key, FieldValue::Matrix3(value));
    }

    fn quaternion_at(&self, offset: usize) -> Quaternion<Real> {
        Quaternion::new(
            self.data[offset + 3],
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        )
    }

    fn write_quaternion(&mut self, offset: usize, q: &Quaternion<Real>) {
        self.data[offset] = q.i;
        self.data[offset + 1] = q.j;
        self.data[offset + 2] = q.k;
        self.data[offset + 3] = q.w;
    }

    /// Applies a tangent-space perturbation in place (the box-plus operation).
    ///
    /// # Errors
    /// [FilterError::Divergence] when the perturbation drives any coefficient
    /// non-finite; the state is left unmodified in that case.
    ///
    /// # Panics
    /// If `delta` does not have `covariance_size` components.
    pub fn retract(&mut self, delta: &DVector<Real>) -> Result<(), FilterError> {
        if delta.len() != self.schema.covariance_size() {
            panic!(
                "retraction delta has {} components, schema expects {}",
                delta.len(),
                self.schema.covariance_size()
            );
        }
        let mut next = self.clone();
        for entry in self.schema.entries() {
            match entry.kind {
                FieldKind::Vector(n) => {
                    for i in 0..n {
                        next.data[entry.stored_offset + i] += delta[entry.tangent_offset + i];
                    }
                }
                FieldKind::Matrix3 => {
                    for i in 0..9 {
                        next.data[entry.stored_offset + i] += delta[entry.tangent_offset + i];
                    }
                }
                FieldKind::Quaternion => {
                    let omega = Vector3::new(
                        delta[entry.tangent_offset],
                        delta[entry.tangent_offset + 1],
                        delta[entry.tangent_offset + 2],
                    );
                    let dq = small_angle_quaternion(omega * (0.5 as Real));
                    let q = (next.quaternion_at(entry.stored_offset) * dq).normalize();
                    next.write_quaternion(entry.stored_offset, &q);
                }
            }
        }
        if next.data.iter().any(|c| !c.is_finite()) {
            return Err(FilterError::Divergence {
                context: "state retraction",
            });
        }
        self.data = next.data;
        Ok(())
    }

    /// Lifts `self - base` into the tangent space at `base` (the box-minus operation).
    ///
    /// Inverse of [StateVector::retract]: for small perturbations,
    /// `base.retract(&s.difference(&base))` reproduces `s`.
    pub fn difference(&self, base: &StateVector<K>) -> DVector<Real> {
        let mut delta = DVector::zeros(self.schema.covariance_size());
        for entry in self.schema.entries() {
            match entry.kind {
                FieldKind::Vector(n) => {
                    for i in 0..n {
                        delta[entry.tangent_offset + i] =
                            self.data[entry.stored_offset + i] - base.data[entry.stored_offset + i];
                    }
                }
                FieldKind::Matrix3 => {
                    for i in 0..9 {
                        delta[entry.tangent_offset + i] =
                            self.data[entry.stored_offset + i] - base.data[entry.stored_offset + i];
                    }
                }
                FieldKind::Quaternion => {
                    let q = self.quaternion_at(entry.stored_offset);
                    let b = base.quaternion_at(entry.stored_offset);
                    let mut dq = b.conjugate() * q;
                    if dq.w < 0.0 {
                        dq = -dq;
                    }
                    delta[entry.tangent_offset] = 2.0 as Real * dq.i;
                    delta[entry.tangent_offset + 1] = 2.0 as Real * dq.j;
                    delta[entry.tangent_offset + 2] = 2.0 as Real * dq.k;
                }
            }
        }
        delta
    }

    /// Per-field weighted mean of a sigma set.
    ///
    /// Vector and matrix fields take the ordinary weighted sum. Quaternion fields take a
    /// fixed-iteration intrinsic mean seeded from the first sample: each iteration
    /// averages the tangent residuals of every sample about the running mean and
    /// retracts the mean by that average.
    ///
    /// # Panics
    /// If `samples` is empty or `weights.len() != samples.len()`.
    pub fn weighted_mean(samples: &[StateVector<K>], weights: &DVector<Real>) -> StateVector<K> {
        let first = samples
            .first()
            .expect("weighted mean requires at least one sample");
        assert_eq!(
            weights.len(),
            samples.len(),
            "one weight per sample required"
        );
        let schema = Arc::clone(&first.schema);
        let mut mean = StateVector::zeroed(Arc::clone(&schema));
        for entry in schema.entries() {
            match entry.kind {
                FieldKind::Vector(n) => {
                    for i in 0..n {
                        let slot = entry.stored_offset + i;
                        mean.data[slot] = samples
                            .iter()
                            .zip(weights.iter())
                            .map(|(s, w)| *w * s.data[slot])
                            .sum();
                    }
                }
                FieldKind::Matrix3 => {
                    for i in 0..9 {
                        let slot = entry.stored_offset + i;
                        mean.data[slot] = samples
                            .iter()
                            .zip(weights.iter())
                            .map(|(s, w)| *w * s.data[slot])
                            .sum();
                    }
                }
                FieldKind::Quaternion => {
                    let mut m = first.quaternion_at(entry.stored_offset);
                    for _ in 0..QUATERNION_MEAN_ITERATIONS {
                        let mut residual = Vector3::zeros();
                        for (sample, w) in samples.iter().zip(weights.iter()) {
                            let q = sample.quaternion_at(entry.stored_offset);
                            let mut dq = m.conjugate() * q;
                            if dq.w < 0.0 {
                                dq = -dq;
                            }
                            residual += Vector3::new(dq.i, dq.j, dq.k) * (2.0 as Real * *w);
                        }
                        let step = small_angle_quaternion(residual * (0.5 as Real));
                        m = (m * step).normalize();
                    }
                    mean.write_quaternion(entry.stored_offset, &m);
                }
            }
        }
        mean
    }

    /// Advances the state along a scaled rate (the integrator's apply step).
    ///
    /// Vector and matrix fields add `scale` times their rate slice. A quaternion field
    /// builds the unit quaternion of its scaled rate vector through the exponential map
    /// and left-multiplies it onto the field, then renormalises: for a rate quaternion
    /// `(0, r)` this is the exact constant-rate solution `q' = exp(scale * (0, r)) * q`.
    pub fn advanced(&self, rate: &StateRate<K>, scale: Real) -> StateVector<K> {
        let mut next = self.clone();
        for entry in self.schema.entries() {
            match entry.kind {
                FieldKind::Vector(n) => {
                    for i in 0..n {
                        next.data[entry.stored_offset + i] +=
                            scale * rate.data[entry.stored_offset + i];
                    }
                }
                FieldKind::Matrix3 => {
                    for i in 0..9 {
                        next.data[entry.stored_offset + i] +=
                            scale * rate.data[entry.stored_offset + i];
                    }
                }
                FieldKind::Quaternion => {
                    let r = Vector3::new(
                        rate.data[entry.stored_offset],
                        rate.data[entry.stored_offset + 1],
                        rate.data[entry.stored_offset + 2],
                    );
                    let dq = exp_map(r * scale);
                    let q = (dq * next.quaternion_at(entry.stored_offset)).normalize();
                    next.write_quaternion(entry.stored_offset, &q);
                }
            }
        }
        next
    }
}

/// A state-shaped derivative.
///
/// Shares the stored layout of its state but holds rates: vector and matrix slots are
/// plain rates of change, and each quaternion slot holds a pure rate quaternion (zero
/// scalar, vector part chosen by the process model; see [StateVector::advanced]). Rates
/// combine linearly and are never renormalised.
#[derive(Clone, Debug)]
pub struct StateRate<K: FieldKey> {
    schema: Arc<Schema<K>>,
    data: DVector<Real>,
}

impl<K: FieldKey> StateRate<K> {
    /// An all-zero rate for the given schema.
    pub fn zeroed(schema: Arc<Schema<K>>) -> Self {
        let data = DVector::zeros(schema.stored_size());
        StateRate { schema, data }
    }

    /// Writes the rate of a three-component vector field.
    pub fn set_vector3(&mut self, key: K, value: Vector3<Real>) {
        let entry = self.schema.entry(key);
        match entry.kind {
            FieldKind::Vector(3) => {
                self.data.as_mut_slice()[entry.stored_offset..entry.stored_offset + 3]
                    .copy_from_slice(value.as_slice());
            }
            kind => panic!("field {:?} is {kind:?}, not a 3-vector", entry.key),
        }
    }

    /// Writes the rate of a 3x3 matrix field.
    pub fn set_matrix3(&mut self, key: K, value: Matrix3<Real>) {
        let entry = self.schema.entry(key);
        match entry.kind {
            FieldKind::Matrix3 => {
                self.data.as_mut_slice()[entry.stored_offset..entry.stored_offset + 9]
                    .copy_from_slice(value.as_slice());
            }
            kind => panic!("field {:?} is {kind:?}, not a matrix", entry.key),
        }
    }

    /// Writes the pure rate quaternion of a quaternion field as its vector part.
    pub fn set_quaternion_rate(&mut self, key: K, half_rate: Vector3<Real>) {
        let entry = self.schema.entry(key);
        match entry.kind {
            FieldKind::Quaternion => {
                self.data[entry.stored_offset] = half_rate.x;
                self.data[entry.stored_offset + 1] = half_rate.y;
                self.data[entry.stored_offset + 2] = half_rate.z;
                self.data[entry.stored_offset + 3] = 0.0;
            }
            kind => panic!("field {:?} is {kind:?}, not a quaternion", entry.key),
        }
    }

    /// Adds `a * rhs` into this rate, component-wise.
    pub fn scaled_add(&mut self, a: Real, rhs: &StateRate<K>) {
        self.data.axpy(a, &rhs.data, 1.0);
    }

    /// Scales this rate in place.
    pub fn scale_mut(&mut self, a: Real) {
        self.data *= a;
    }

    /// The raw rate coefficients, in stored layout.
    pub fn coefficients(&self) -> &DVector<Real> {
        &self.data
    }
}
