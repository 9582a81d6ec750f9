//! Dynamic measurement vectors and the model contract they are evaluated against.
//!
//! Unlike the state, whose field list is fixed at construction, a measurement vector is
//! composed at runtime from whichever sensor fields are available this tick. Fields keep
//! their insertion order, and everything derived from the measurement during the
//! innovation step (the expected measurement, the residual, and the assembled noise
//! diagonal) uses that same order, which is the invariant the filter core relies on.
//!
//! The [MeasurementModel] trait is the plug-in seam: it supplies the per-field expected
//! measurement as a function of a state (and an optional exogenous input, which is how
//! the two-filter coupling conditions each filter's model on the other's estimate), the
//! per-field noise variances, and an optional per-field reconciliation of the sigma
//! images that defaults to their weighted arithmetic mean.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::state::StateVector;
use crate::{FieldKey, Real};

/// A runtime-composed collection of enabled measurement fields.
#[derive(Clone, Debug, Default)]
pub struct MeasurementVector<K: FieldKey> {
    fields: Vec<(K, DVector<Real>)>,
}

impl<K: FieldKey> MeasurementVector<K> {
    /// An empty measurement vector.
    pub fn new() -> Self {
        MeasurementVector { fields: Vec::new() }
    }

    /// Removes every enabled field.
    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Enables a field with the given observed value, or overwrites it in place if it is
    /// already enabled. Overwriting keeps the field's original position.
    pub fn set_field(&mut self, key: K, value: DVector<Real>) {
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.fields.push((key, value));
        }
    }

    /// Convenience setter for the common three-axis sensor field.
    pub fn set_vector3(&mut self, key: K, value: Vector3<Real>) {
        self.set_field(key, DVector::from_column_slice(value.as_slice()));
    }

    /// The observed value of a field, if enabled.
    pub fn get_field(&self, key: K) -> Option<&DVector<Real>> {
        self.fields.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Enabled fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (K, &DVector<Real>)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    /// True when no field is enabled.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Total number of scalar components across the enabled fields.
    pub fn dimension(&self) -> usize {
        self.fields.iter().map(|(_, v)| v.len()).sum()
    }

    /// Concatenates the enabled fields into one column vector, in insertion order.
    pub fn as_vector(&self) -> DVector<Real> {
        let mut out = DVector::zeros(self.dimension());
        let mut offset = 0;
        for (_, v) in &self.fields {
            out.rows_mut(offset, v.len()).copy_from(v);
            offset += v.len();
        }
        out
    }
}

/// Per-field measurement equations and noise, supplied by the application.
///
/// `Input` is the type of the exogenous input the expected-measurement functions may be
/// conditioned on; for the coupled AHRS pair each filter's input is the other filter's
/// state vector.
pub trait MeasurementModel {
    /// Key type of the state the model observes.
    type StateKey: FieldKey;
    /// Key type naming the measurement fields.
    type Key: FieldKey;
    /// Exogenous input to the measurement equations.
    type Input;

    /// Expected observation of `field` given a state and optional input. Must be finite
    /// and must have the field's arity.
    fn expected(
        &self,
        field: Self::Key,
        state: &StateVector<Self::StateKey>,
        input: Option<&Self::Input>,
    ) -> DVector<Real>;

    /// Diagonal noise variances of `field`, one entry per component.
    fn variance(&self, field: Self::Key) -> DVector<Real>;

    /// Combines the sigma images of one field (columns of `samples`) into the predicted
    /// measurement for that field.
    ///
    /// The default is the weighted arithmetic mean; a model may override this for fields
    /// that need a smarter combination (for example, sign reconciliation of a magnetic
    /// field vector).
    fn reconcile(
        &self,
        _field: Self::Key,
        samples: &DMatrix<Real>,
        weights: &DVector<Real>,
    ) -> DVector<Real> {
        let mut mean = DVector::zeros(samples.nrows());
        for (i, column) in samples.column_iter().enumerate() {
            mean.axpy(weights[i], &column, 1.0);
        }
        mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldKind, Schema};
    use assert_approx_eq::assert_approx_eq;
    use std::sync::Arc;

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    enum Sensor {
        Range,
        Doppler,
    }

    #[test]
    fn fields_keep_insertion_order() {
        let mut meas = MeasurementVector::new();
        meas.set_vector3(Sensor::Doppler, Vector3::new(4.0, 5.0, 6.0));
        meas.set_field(Sensor::Range, DVector::from_vec(vec![1.0]));

        let keys: Vec<Sensor> = meas.fields().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Sensor::Doppler, Sensor::Range]);
        assert_eq!(meas.dimension(), 4);

        let stacked = meas.as_vector();
        assert_approx_eq!(stacked[0], 4.0, 1e-12);
        assert_approx_eq!(stacked[3], 1.0, 1e-12);
    }

    #[test]
    fn overwriting_a_field_keeps_its_position() {
        let mut meas = MeasurementVector::new();
        meas.set_field(Sensor::Range, DVector::from_vec(vec![1.0]));
        meas.set_vector3(Sensor::Doppler, Vector3::zeros());
        meas.set_field(Sensor::Range, DVector::from_vec(vec![2.0]));

        let keys: Vec<Sensor> = meas.fields().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Sensor::Range, Sensor::Doppler]);
        assert_approx_eq!(meas.as_vector()[0], 2.0, 1e-12);
    }

    #[test]
    fn clear_empties_the_vector() {
        let mut meas: MeasurementVector<Sensor> = MeasurementVector::new();
        meas.set_field(Sensor::Range, DVector::from_vec(vec![1.0]));
        assert!(!meas.is_empty());
        meas.clear();
        assert!(meas.is_empty());
        assert_eq!(meas.dimension(), 0);
    }

    struct RangeModel;

    impl MeasurementModel for RangeModel {
        type StateKey = Sensor;
        type Key = Sensor;
        type Input = ();

        fn expected(
            &self,
            _field: Sensor,
            state: &StateVector<Sensor>,
            _input: Option<&()>,
        ) -> DVector<Real> {
            DVector::from_vec(vec![state.vector3(Sensor::Range).norm()])
        }

        fn variance(&self, _field: Sensor) -> DVector<Real> {
            DVector::from_vec(vec![0.25])
        }
    }

    #[test]
    fn default_reconcile_is_the_weighted_mean() {
        let model = RangeModel;
        let samples = DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]);
        let weights = DVector::from_vec(vec![0.5, 0.25, 0.25]);
        let mean = model.reconcile(Sensor::Range, &samples, &weights);
        assert_approx_eq!(mean[0], 1.75, 1e-12);
    }

    #[test]
    fn expected_measurement_consumes_the_state() {
        let schema = Arc::new(Schema::new(&[(Sensor::Range, FieldKind::Vector(3))]));
        let mut state = StateVector::zeroed(schema);
        state.set_vector3(Sensor::Range, Vector3::new(3.0, 4.0, 0.0));
        let z = RangeModel.expected(Sensor::Range, &state, None);
        assert_approx_eq!(z[0], 5.0, 1e-12);
    }
}
