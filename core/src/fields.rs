//! Typed field registry for heterogeneous state and measurement vectors.
//!
//! A filter state here is not a bare coefficient array: it is an ordered list of named
//! fields, each with a kind that fixes how many slots it occupies in the stored vector
//! and how many degrees of freedom it contributes to the covariance. The [Schema] holds
//! that list along with precomputed offsets for both layouts; [crate::state::StateVector]
//! and [crate::ukf::UnscentedKalmanFilter] consult it for every field access and every
//! tangent-space operation.
//!
//! The two sizes differ only for quaternions: a unit quaternion stores four coefficients
//! but perturbs in a three-dimensional tangent space, so it contributes three rows and
//! columns to the covariance. Vectors and free 3x3 matrix parameters contribute equal
//! stored and tangent counts.

use std::fmt::Debug;
use std::hash::Hash;

use nalgebra::{DVector, Matrix3, Quaternion, Vector3};

use crate::Real;

/// Marker trait for the key type that names fields within one schema.
///
/// Implemented by small field enums (see [crate::ahrs::AhrsField] for an example). Keys
/// are compared by value, so two schemas may reuse the same enum without interference.
pub trait FieldKey: Copy + Eq + Hash + Debug + 'static {}

impl<K: Copy + Eq + Hash + Debug + 'static> FieldKey for K {}

/// The storage class of a single field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// A Euclidean vector of the given length; stored and tangent arities are equal.
    Vector(usize),
    /// A unit quaternion: four stored coefficients, three tangent degrees of freedom.
    Quaternion,
    /// An unconstrained 3x3 matrix parameter, flattened column-major into nine slots.
    Matrix3,
}

impl FieldKind {
    /// Slots the field occupies in the stored coefficient vector.
    pub fn stored(&self) -> usize {
        match self {
            FieldKind::Vector(n) => *n,
            FieldKind::Quaternion => 4,
            FieldKind::Matrix3 => 9,
        }
    }

    /// Degrees of freedom the field contributes to the covariance.
    pub fn tangent(&self) -> usize {
        match self {
            FieldKind::Vector(n) => *n,
            FieldKind::Quaternion => 3,
            FieldKind::Matrix3 => 9,
        }
    }
}

/// A dynamically typed field value, as returned by the generic getter.
///
/// Typed accessors on [crate::state::StateVector] avoid the wrapper when the caller
/// already knows the kind.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Value of a [FieldKind::Vector] field.
    Vector(DVector<Real>),
    /// Value of a [FieldKind::Quaternion] field.
    Quaternion(Quaternion<Real>),
    /// Value of a [FieldKind::Matrix3] field.
    Matrix3(Matrix3<Real>),
}

impl From<Vector3<Real>> for FieldValue {
    fn from(v: Vector3<Real>) -> Self {
        FieldValue::Vector(DVector::from_column_slice(v.as_slice()))
    }
}

impl From<Quaternion<Real>> for FieldValue {
    fn from(q: Quaternion<Real>) -> Self {
        FieldValue::Quaternion(q)
    }
}

impl From<Matrix3<Real>> for FieldValue {
    fn from(m: Matrix3<Real>) -> Self {
        FieldValue::Matrix3(m)
    }
}

/// One schema entry: a key, its kind, and the offsets of the field in both layouts.
#[derive(Clone, Copy, Debug)]
pub struct FieldEntry<K: FieldKey> {
    /// The key naming this field.
    pub key: K,
    /// Storage class of the field.
    pub kind: FieldKind,
    /// Offset of the field's first slot in the stored vector.
    pub stored_offset: usize,
    /// Offset of the field's first degree of freedom in the tangent space.
    pub tangent_offset: usize,
}

/// Ordered field layout shared by a state vector and its filter.
///
/// Construction fixes both layouts once; lookups are linear over the (short) field list,
/// which keeps the registry free of per-access allocation.
#[derive(Clone, Debug)]
pub struct Schema<K: FieldKey> {
    entries: Vec<FieldEntry<K>>,
    stored_size: usize,
    covariance_size: usize,
}

impl<K: FieldKey> Schema<K> {
    /// Builds a schema from an ordered `(key, kind)` list.
    ///
    /// # Panics
    /// If a key appears twice; duplicate keys are a programming error.
    pub fn new(fields: &[(K, FieldKind)]) -> Self {
        let mut entries = Vec::with_capacity(fields.len());
        let mut stored = 0;
        let mut tangent = 0;
        for &(key, kind) in fields {
            if entries.iter().any(|e: &FieldEntry<K>| e.key == key) {
                panic!("duplicate field key {key:?} in schema");
            }
            entries.push(FieldEntry {
                key,
                kind,
                stored_offset: stored,
                tangent_offset: tangent,
            });
            stored += kind.stored();
            tangent += kind.tangent();
        }
        Schema {
            entries,
            stored_size: stored,
            covariance_size: tangent,
        }
    }

    /// Total slots in the stored coefficient vector.
    pub fn stored_size(&self) -> usize {
        self.stored_size
    }

    /// Side length of the covariance matrix (total tangent degrees of freedom).
    pub fn covariance_size(&self) -> usize {
        self.covariance_size
    }

    /// Iterates the fields in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = &FieldEntry<K>> {
        self.entries.iter()
    }

    /// Looks up a field entry by key.
    ///
    /// # Panics
    /// If the key is not part of this schema; addressing an unregistered field is a
    /// programming error.
    pub fn entry(&self, key: K) -> &FieldEntry<K> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .unwrap_or_else(|| panic!("field {key:?} is not part of this schema"))
    }
}
