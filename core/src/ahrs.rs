//! Example 9-axis AHRS built on the manifold filter core.
//!
//! Two coupled filters run per tick. The attitude filter estimates the body attitude (a
//! unit quaternion from the North-East-Down frame to the body frame), body-frame angular
//! velocity, and body-frame linear acceleration from accelerometer, gyroscope, and
//! magnetometer streams. The sensor-error filter estimates per-sensor bias and
//! scale-factor parameters online; the magnetometer scale is a full unconstrained 3x3
//! mixing matrix, which absorbs both sensor scale error and uncertainty in the local
//! field direction, and must not be forced orthogonal.
//!
//! Each filter's measurement model is conditioned on the other filter's estimate, and
//! [Ahrs::iterate] implements the coupling protocol: the attitude filter completes a
//! full tick using the sensor-error mean as input; the sensor-error filter then runs its
//! innovation against the attitude filter's retained *a-priori* mean and adds the
//! attitude filter's innovation covariance into its own before computing its gain. The
//! addition is what keeps the parameter filter honest about the fact that its "input"
//! is itself an uncertain estimate.
//!
//! ## Conventions
//!
//! The attitude quaternion acts as an operator taking NED coordinates to body
//! coordinates, so the predicted accelerometer reading is `a + q * (0, 0, -g)` and the
//! predicted magnetometer reading is the scale matrix applied to `q * (1, 0, 0)`. The
//! matching kinematics are `q_dot = (0, omega/2)* ⊗ q`: the conjugate of the pure
//! half-rate quaternion, left-multiplied. Everything in this module is an example
//! parameterization of the core; the process and measurement numbers are tuning, not
//! filter behavior.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};

use crate::fields::{FieldKind, Schema};
use crate::integrator::Integrator;
use crate::measurement::{MeasurementModel, MeasurementVector};
use crate::state::{StateRate, StateVector};
use crate::ukf::{ProcessModel, UkfParams, UnscentedKalmanFilter};
use crate::{FilterError, Real};

/// Standard gravitational acceleration, m/s^2.
pub const G_ACCEL: Real = 9.80665;

/// Approximate magnitude of Earth's magnetic field in microtesla. Only used to
/// initialise the magnetometer scale matrix.
pub const EARTH_MAG: Real = 45.0;

/// Fields of the attitude filter state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AhrsField {
    /// NED-to-body attitude quaternion.
    Attitude,
    /// Body-frame angular velocity, rad/s.
    AngularVelocity,
    /// Body-frame linear acceleration, m/s^2.
    Acceleration,
}

/// Fields of the sensor-error filter state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SensorErrorField {
    /// Accelerometer bias, m/s^2 per axis.
    AccelerometerBias,
    /// Accelerometer scale factor per axis (unity when perfect).
    AccelerometerScaleFactor,
    /// Gyroscope bias, rad/s per axis.
    GyroscopeBias,
    /// Gyroscope scale factor per axis (unity when perfect).
    GyroscopeScaleFactor,
    /// Magnetometer bias, microtesla per axis.
    MagnetometerBias,
    /// Magnetometer mixing matrix, nine free parameters.
    MagnetometerScaleFactor,
}

/// Fields of the shared measurement vector.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SensorField {
    /// Specific-force reading, m/s^2.
    Accelerometer,
    /// Angular-rate reading, rad/s.
    Gyroscope,
    /// Field reading in sensor units.
    Magnetometer,
}

/// Field layout of the attitude filter: 10 stored slots, 9 covariance rows.
pub fn ahrs_schema() -> Arc<Schema<AhrsField>> {
    Arc::new(Schema::new(&[
        (AhrsField::Attitude, FieldKind::Quaternion),
        (AhrsField::AngularVelocity, FieldKind::Vector(3)),
        (AhrsField::Acceleration, FieldKind::Vector(3)),
    ]))
}

/// Field layout of the sensor-error filter: 24 stored slots, 24 covariance rows.
pub fn sensor_error_schema() -> Arc<Schema<SensorErrorField>> {
    Arc::new(Schema::new(&[
        (SensorErrorField::AccelerometerBias, FieldKind::Vector(3)),
        (SensorErrorField::AccelerometerScaleFactor, FieldKind::Vector(3)),
        (SensorErrorField::GyroscopeBias, FieldKind::Vector(3)),
        (SensorErrorField::GyroscopeScaleFactor, FieldKind::Vector(3)),
        (SensorErrorField::MagnetometerBias, FieldKind::Vector(3)),
        (SensorErrorField::MagnetometerScaleFactor, FieldKind::Matrix3),
    ]))
}

/// Default attitude-filter process noise diagonal: attitude tangent, angular velocity,
/// acceleration.
pub fn ahrs_process_noise_diagonal() -> DVector<Real> {
    let mut d = DVector::zeros(9);
    for i in 0..3 {
        d[i] = 7.0e-5;
        d[i + 3] = 1.0;
        d[i + 6] = 2.0e1;
    }
    d
}

/// Default attitude-filter initial covariance diagonal.
pub fn ahrs_initial_covariance() -> DMatrix<Real> {
    DMatrix::from_diagonal(&DVector::from_vec(vec![
        1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 5.0, 5.0, 5.0,
    ]))
}

/// Default per-axis measurement variances, in field order accelerometer / gyroscope /
/// magnetometer. Derived from typical consumer IMU datasheet noise figures.
pub fn default_measurement_covariance() -> DVector<Real> {
    let mut d = DVector::zeros(9);
    for i in 0..3 {
        d[i] = 0.12;
        d[i + 3] = 0.003;
        d[i + 6] = 0.3;
    }
    d
}

/// Sensor-error filter initial mean: zero biases, unity scale factors, and a
/// magnetometer mixing matrix of `EARTH_MAG` times identity.
pub fn sensor_error_initial_state() -> StateVector<SensorErrorField> {
    let mut state = StateVector::zeroed(sensor_error_schema());
    state.set_vector3(
        SensorErrorField::AccelerometerScaleFactor,
        Vector3::new(1.0, 1.0, 1.0),
    );
    state.set_vector3(
        SensorErrorField::GyroscopeScaleFactor,
        Vector3::new(1.0, 1.0, 1.0),
    );
    state.set_matrix3(
        SensorErrorField::MagnetometerScaleFactor,
        Matrix3::identity() * EARTH_MAG,
    );
    state
}

/// Sensor-error filter initial covariance, from switch-on bias and scale-factor
/// uncertainty figures of the reference sensors.
pub fn sensor_error_initial_covariance() -> DMatrix<Real> {
    let mut d = DVector::zeros(24);
    d[0] = 0.49;
    d[1] = 0.49;
    d[2] = 0.784;
    for i in 0..3 {
        d[i + 3] = 3.0e-2;
        d[i + 6] = 0.35;
        d[i + 9] = 3.0e-2;
        d[i + 12] = 1.0e1;
    }
    for i in 0..9 {
        d[i + 15] = 5.0e-2 * EARTH_MAG;
    }
    DMatrix::from_diagonal(&d)
}

/// Sensor-error filter process noise diagonal: bias states carry random-walk noise from
/// bias instability, scale-factor states carry none.
pub fn sensor_error_process_noise_diagonal() -> DVector<Real> {
    let mut d = DVector::zeros(24);
    for i in 0..3 {
        d[i] = 5.2e-5;
        d[i + 6] = 3.0e-3;
        d[i + 12] = 1.5e-2;
    }
    d
}

fn rotate(q: &Quaternion<Real>, v: Vector3<Real>) -> Vector3<Real> {
    UnitQuaternion::new_unchecked(*q).transform_vector(&v)
}

fn ideal_accelerometer(state: &StateVector<AhrsField>) -> Vector3<Real> {
    state.vector3(AhrsField::Acceleration)
        + rotate(
            &state.quaternion(AhrsField::Attitude),
            Vector3::new(0.0, 0.0, -G_ACCEL),
        )
}

fn ideal_gyroscope(state: &StateVector<AhrsField>) -> Vector3<Real> {
    state.vector3(AhrsField::AngularVelocity)
}

fn ideal_magnetometer(state: &StateVector<AhrsField>) -> Vector3<Real> {
    rotate(
        &state.quaternion(AhrsField::Attitude),
        Vector3::new(1.0, 0.0, 0.0),
    )
}

fn as_dvector(v: Vector3<Real>) -> DVector<Real> {
    DVector::from_column_slice(v.as_slice())
}

/// Attitude-filter dynamics: attitude integrates the angular velocity; angular velocity
/// and acceleration are modelled constant, with their wander injected as process noise.
pub struct AhrsProcessModel {
    /// Tangent-space process noise diagonal (attitude, angular velocity, acceleration).
    pub noise_diagonal: DVector<Real>,
}

impl Default for AhrsProcessModel {
    fn default() -> Self {
        AhrsProcessModel {
            noise_diagonal: ahrs_process_noise_diagonal(),
        }
    }
}

impl ProcessModel for AhrsProcessModel {
    type Key = AhrsField;
    type Input = ();

    fn derivative(&self, state: &StateVector<AhrsField>, _input: Option<&()>) -> StateRate<AhrsField> {
        let mut rate = StateRate::zeroed(Arc::clone(state.schema()));
        // Conjugate of the pure half-rate quaternion: the NED-to-body operator
        // convention flips the sign relative to body-to-NED kinematics.
        let half_rate = state.vector3(AhrsField::AngularVelocity) * (0.5 as Real);
        rate.set_quaternion_rate(AhrsField::Attitude, -half_rate);
        rate
    }

    fn process_noise(&self, dt: Real) -> DMatrix<Real> {
        DMatrix::from_diagonal(&(&self.noise_diagonal * dt))
    }
}

/// Sensor-error dynamics: error evolution is by definition unpredictable, so the
/// derivative is identically zero and all motion comes from process noise.
pub struct SensorErrorProcessModel {
    /// Tangent-space process noise diagonal over the six error fields.
    pub noise_diagonal: DVector<Real>,
}

impl Default for SensorErrorProcessModel {
    fn default() -> Self {
        SensorErrorProcessModel {
            noise_diagonal: sensor_error_process_noise_diagonal(),
        }
    }
}

impl ProcessModel for SensorErrorProcessModel {
    type Key = SensorErrorField;
    type Input = ();

    fn derivative(
        &self,
        state: &StateVector<SensorErrorField>,
        _input: Option<&()>,
    ) -> StateRate<SensorErrorField> {
        StateRate::zeroed(Arc::clone(state.schema()))
    }

    fn process_noise(&self, dt: Real) -> DMatrix<Real> {
        DMatrix::from_diagonal(&(&self.noise_diagonal * dt))
    }
}

/// Measurement model of the attitude filter, conditioned on the sensor-error estimate.
///
/// Each axis is `bias + scale * ideal`; without the sensor-error input the ideal
/// predictions are used directly.
pub struct AhrsMeasurementModel {
    /// Per-axis measurement variances in field order accelerometer / gyroscope /
    /// magnetometer. Mutable between ticks.
    pub covariance: DVector<Real>,
}

impl Default for AhrsMeasurementModel {
    fn default() -> Self {
        AhrsMeasurementModel {
            covariance: default_measurement_covariance(),
        }
    }
}

impl MeasurementModel for AhrsMeasurementModel {
    type StateKey = AhrsField;
    type Key = SensorField;
    type Input = StateVector<SensorErrorField>;

    fn expected(
        &self,
        field: SensorField,
        state: &StateVector<AhrsField>,
        input: Option<&StateVector<SensorErrorField>>,
    ) -> DVector<Real> {
        let value = match (field, input) {
            (SensorField::Accelerometer, Some(errors)) => {
                errors.vector3(SensorErrorField::AccelerometerBias)
                    + errors
                        .vector3(SensorErrorField::AccelerometerScaleFactor)
                        .component_mul(&ideal_accelerometer(state))
            }
            (SensorField::Accelerometer, None) => ideal_accelerometer(state),
            (SensorField::Gyroscope, Some(errors)) => {
                errors.vector3(SensorErrorField::GyroscopeBias)
                    + errors
                        .vector3(SensorErrorField::GyroscopeScaleFactor)
                        .component_mul(&ideal_gyroscope(state))
            }
            (SensorField::Gyroscope, None) => ideal_gyroscope(state),
            (SensorField::Magnetometer, Some(errors)) => {
                errors.vector3(SensorErrorField::MagnetometerBias)
                    + errors.matrix3(SensorErrorField::MagnetometerScaleFactor)
                        * ideal_magnetometer(state)
            }
            (SensorField::Magnetometer, None) => ideal_magnetometer(state),
        };
        as_dvector(value)
    }

    fn variance(&self, field: SensorField) -> DVector<Real> {
        let offset = match field {
            SensorField::Accelerometer => 0,
            SensorField::Gyroscope => 3,
            SensorField::Magnetometer => 6,
        };
        self.covariance.rows(offset, 3).into_owned()
    }
}

/// Measurement model of the sensor-error filter: the same equations with the arguments
/// flipped, conditioned on the attitude estimate.
///
/// The attitude input is not optional for this model; invoking it without one is a
/// programming error.
pub struct SensorErrorMeasurementModel {
    /// Per-axis measurement variances, shared layout with [AhrsMeasurementModel].
    pub covariance: DVector<Real>,
}

impl Default for SensorErrorMeasurementModel {
    fn default() -> Self {
        SensorErrorMeasurementModel {
            covariance: default_measurement_covariance(),
        }
    }
}

impl MeasurementModel for SensorErrorMeasurementModel {
    type StateKey = SensorErrorField;
    type Key = SensorField;
    type Input = StateVector<AhrsField>;

    fn expected(
        &self,
        field: SensorField,
        state: &StateVector<SensorErrorField>,
        input: Option<&StateVector<AhrsField>>,
    ) -> DVector<Real> {
        let attitude = input
            .expect("the sensor-error measurement model requires the attitude state as input");
        let value = match field {
            SensorField::Accelerometer => {
                state.vector3(SensorErrorField::AccelerometerBias)
                    + state
                        .vector3(SensorErrorField::AccelerometerScaleFactor)
                        .component_mul(&ideal_accelerometer(attitude))
            }
            SensorField::Gyroscope => {
                state.vector3(SensorErrorField::GyroscopeBias)
                    + state
                        .vector3(SensorErrorField::GyroscopeScaleFactor)
                        .component_mul(&ideal_gyroscope(attitude))
            }
            SensorField::Magnetometer => {
                state.vector3(SensorErrorField::MagnetometerBias)
                    + state.matrix3(SensorErrorField::MagnetometerScaleFactor)
                        * ideal_magnetometer(attitude)
            }
        };
        as_dvector(value)
    }

    fn variance(&self, field: SensorField) -> DVector<Real> {
        let offset = match field {
            SensorField::Accelerometer => 0,
            SensorField::Gyroscope => 3,
            SensorField::Magnetometer => 6,
        };
        self.covariance.rows(offset, 3).into_owned()
    }
}

/// The coupled AHRS pair: the attitude filter, the sensor-error filter, and the shared
/// measurement vector, driven through the coupling protocol by [Ahrs::iterate].
pub struct Ahrs {
    /// The attitude filter (RK4 integration).
    pub filter: UnscentedKalmanFilter<AhrsProcessModel, AhrsMeasurementModel>,
    /// The sensor-error filter (Euler integration; its derivative is zero).
    pub errors: UnscentedKalmanFilter<SensorErrorProcessModel, SensorErrorMeasurementModel>,
    measurement: MeasurementVector<SensorField>,
}

impl Default for Ahrs {
    fn default() -> Self {
        Ahrs::new()
    }
}

impl Ahrs {
    /// Builds the pair with the default tuning: identity attitude, zero rates, unity
    /// scale factors, and the initial covariances of this module.
    pub fn new() -> Self {
        let filter = UnscentedKalmanFilter::new(
            StateVector::zeroed(ahrs_schema()),
            ahrs_initial_covariance(),
            AhrsProcessModel::default(),
            AhrsMeasurementModel::default(),
            Integrator::Rk4,
            UkfParams::default(),
        );
        let errors = UnscentedKalmanFilter::new(
            sensor_error_initial_state(),
            sensor_error_initial_covariance(),
            SensorErrorProcessModel::default(),
            SensorErrorMeasurementModel::default(),
            Integrator::Euler,
            UkfParams::default(),
        );
        Ahrs {
            filter,
            errors,
            measurement: MeasurementVector::new(),
        }
    }

    /// Stores an accelerometer reading for the next tick.
    pub fn set_accelerometer(&mut self, reading: Vector3<Real>) {
        self.measurement.set_vector3(SensorField::Accelerometer, reading);
    }

    /// Stores a gyroscope reading for the next tick.
    pub fn set_gyroscope(&mut self, reading: Vector3<Real>) {
        self.measurement.set_vector3(SensorField::Gyroscope, reading);
    }

    /// Stores a magnetometer reading for the next tick.
    pub fn set_magnetometer(&mut self, reading: Vector3<Real>) {
        self.measurement.set_vector3(SensorField::Magnetometer, reading);
    }

    /// Disables every sensor field; the next tick then skips its innovation.
    pub fn clear_sensors(&mut self) {
        self.measurement.clear();
    }

    /// The measurement vector as currently composed.
    pub fn measurement(&self) -> &MeasurementVector<SensorField> {
        &self.measurement
    }

    /// Replaces the per-axis measurement variances of both filters. Applied from the
    /// next tick onward.
    ///
    /// # Panics
    /// If `covariance` does not have nine entries.
    pub fn set_measurement_covariance(&mut self, covariance: DVector<Real>) {
        assert_eq!(covariance.len(), 9, "nine per-axis variances required");
        self.filter.measurement_model.covariance = covariance.clone();
        self.errors.measurement_model.covariance = covariance;
    }

    /// Replaces the attitude filter's process noise diagonal.
    ///
    /// # Panics
    /// If `diagonal` does not have nine entries.
    pub fn set_process_noise(&mut self, diagonal: DVector<Real>) {
        assert_eq!(diagonal.len(), 9, "nine tangent-space entries required");
        self.filter.process.noise_diagonal = diagonal;
    }

    /// Runs one coupled tick of duration `dt` against the stored measurement.
    ///
    /// The attitude filter runs a complete cycle with the sensor-error mean as its
    /// measurement input. The sensor-error filter then predicts, runs its innovation
    /// against the attitude filter's retained a-priori mean, inflates its innovation
    /// covariance by the attitude filter's, and updates.
    ///
    /// # Errors
    /// Propagates the first [FilterError] a step reports. After an error the pair may be
    /// mid-tick; call [Ahrs::reset] before resuming.
    pub fn iterate(&mut self, dt: Real) -> Result<(), FilterError> {
        self.filter.a_priori_step(dt, None)?;
        self.filter
            .innovation_step(&self.measurement, Some(&self.errors.state))?;
        self.filter.a_posteriori_step()?;

        self.errors.a_priori_step(dt, None)?;
        self.errors
            .innovation_step(&self.measurement, Some(&self.filter.a_priori_state))?;
        self.errors.innovation_covariance += &self.filter.innovation_covariance;
        self.errors.a_posteriori_step()?;
        Ok(())
    }

    /// Reinitialises both filters to the default tuning and clears the measurement.
    pub fn reset(&mut self) {
        self.filter
            .reset(StateVector::zeroed(ahrs_schema()), ahrs_initial_covariance());
        self.errors
            .reset(sensor_error_initial_state(), sensor_error_initial_covariance());
        self.measurement.clear();
    }

    /// Current attitude estimate.
    pub fn attitude(&self) -> Quaternion<Real> {
        self.filter.state.quaternion(AhrsField::Attitude)
    }

    /// Current body-frame angular velocity estimate, rad/s.
    pub fn angular_velocity(&self) -> Vector3<Real> {
        self.filter.state.vector3(AhrsField::AngularVelocity)
    }

    /// Current body-frame linear acceleration estimate, m/s^2.
    pub fn acceleration(&self) -> Vector3<Real> {
        self.filter.state.vector3(AhrsField::Acceleration)
    }

    /// Per-axis error envelope of the attitude filter covariance.
    pub fn error_envelope(&self) -> DVector<Real> {
        self.filter.error_envelope()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn schemas_have_the_documented_sizes() {
        let ahrs = ahrs_schema();
        assert_eq!(ahrs.stored_size(), 10);
        assert_eq!(ahrs.covariance_size(), 9);

        let errors = sensor_error_schema();
        assert_eq!(errors.stored_size(), 24);
        assert_eq!(errors.covariance_size(), 24);
    }

    #[test]
    fn initial_sensor_errors_are_neutral() {
        let state = sensor_error_initial_state();
        assert_eq!(
            state.vector3(SensorErrorField::AccelerometerScaleFactor),
            Vector3::new(1.0, 1.0, 1.0)
        );
        assert_eq!(
            state.vector3(SensorErrorField::GyroscopeBias),
            Vector3::zeros()
        );
        let mag = state.matrix3(SensorErrorField::MagnetometerScaleFactor);
        assert_approx_eq!(mag[(0, 0)], EARTH_MAG, 1e-12);
        assert_approx_eq!(mag[(0, 1)], 0.0, 1e-12);
    }

    #[test]
    fn ideal_predictions_at_identity_attitude() {
        let state = StateVector::zeroed(ahrs_schema());
        let accel = ideal_accelerometer(&state);
        assert_approx_eq!(accel.z, -G_ACCEL, 1e-12);
        assert_approx_eq!(accel.x, 0.0, 1e-12);
        let mag = ideal_magnetometer(&state);
        assert_approx_eq!(mag.x, 1.0, 1e-12);
        assert_approx_eq!(mag.y, 0.0, 1e-12);
    }

    #[test]
    fn measurement_model_applies_bias_and_scale() {
        let model = AhrsMeasurementModel::default();
        let state = StateVector::zeroed(ahrs_schema());
        let mut errors = sensor_error_initial_state();
        errors.set_vector3(SensorErrorField::GyroscopeBias, Vector3::new(0.1, 0.0, 0.0));
        errors.set_vector3(
            SensorErrorField::GyroscopeScaleFactor,
            Vector3::new(2.0, 1.0, 1.0),
        );

        let mut with_rate = state.clone();
        with_rate.set_vector3(AhrsField::AngularVelocity, Vector3::new(0.5, 0.5, 0.5));
        let z = model.expected(SensorField::Gyroscope, &with_rate, Some(&errors));
        assert_approx_eq!(z[0], 0.1 + 2.0 * 0.5, 1e-12);
        assert_approx_eq!(z[1], 0.5, 1e-12);
    }

    #[test]
    fn coupled_models_agree_when_arguments_flip() {
        let forward = AhrsMeasurementModel::default();
        let flipped = SensorErrorMeasurementModel::default();
        let mut attitude = StateVector::zeroed(ahrs_schema());
        attitude.set_vector3(AhrsField::AngularVelocity, Vector3::new(0.1, -0.2, 0.3));
        attitude.set_vector3(AhrsField::Acceleration, Vector3::new(0.0, 0.5, 0.0));
        let errors = sensor_error_initial_state();

        for field in [
            SensorField::Accelerometer,
            SensorField::Gyroscope,
            SensorField::Magnetometer,
        ] {
            let a = forward.expected(field, &attitude, Some(&errors));
            let b = flipped.expected(field, &errors, Some(&attitude));
            assert!((a - b).norm() < 1e-12, "models disagree on {field:?}");
        }
    }

    #[test]
    fn process_model_spins_the_attitude() {
        let model = AhrsProcessModel::default();
        let mut state = StateVector::zeroed(ahrs_schema());
        state.set_vector3(AhrsField::AngularVelocity, Vector3::new(0.0, 0.0, 1.0));
        let rate = model.derivative(&state, None);
        let next = state.advanced(&rate, 0.1);
        let q = next.quaternion(AhrsField::Attitude);
        // NED-to-body operator: positive yaw rate turns the vector part negative.
        assert_approx_eq!(q.k, -(0.05 as Real).sin(), 1e-9);
        assert_approx_eq!(q.w, (0.05 as Real).cos(), 1e-9);
    }

    #[test]
    fn stationary_tick_keeps_the_attitude_unit_norm() {
        let mut ahrs = Ahrs::new();
        // Unit-norm field with an identity mixing matrix for a clean synthetic setup.
        let mut errors = sensor_error_initial_state();
        errors.set_matrix3(SensorErrorField::MagnetometerScaleFactor, Matrix3::identity());
        ahrs.errors.reset(errors, sensor_error_initial_covariance());

        for _ in 0..20 {
            ahrs.set_accelerometer(Vector3::new(0.0, 0.0, -G_ACCEL));
            ahrs.set_gyroscope(Vector3::zeros());
            ahrs.set_magnetometer(Vector3::new(1.0, 0.0, 0.0));
            ahrs.iterate(0.01).unwrap();
            let norm = ahrs.attitude().norm();
            assert_approx_eq!(norm, 1.0, 1e-9);
        }
        assert!(ahrs.angular_velocity().norm() < 0.1);
    }

    #[test]
    fn empty_measurement_tick_completes() {
        let mut ahrs = Ahrs::new();
        ahrs.iterate(0.01).unwrap();
        ahrs.iterate(0.01).unwrap();
    }

    #[test]
    fn reset_restores_the_defaults() {
        let mut ahrs = Ahrs::new();
        ahrs.set_gyroscope(Vector3::new(0.2, 0.0, 0.0));
        ahrs.set_accelerometer(Vector3::new(0.0, 0.0, -G_ACCEL));
        ahrs.iterate(0.01).unwrap();
        ahrs.reset();
        let q = ahrs.attitude();
        assert_eq!(q.w, 1.0);
        assert_eq!(ahrs.angular_velocity(), Vector3::zeros());
        assert!(ahrs.measurement().is_empty());
    }
}
