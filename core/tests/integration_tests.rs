//! End-to-end integration tests for the coupled AHRS filter pair
//!
//! These tests drive the full two-filter system against synthetic measurement streams
//! generated from known rigid-body trajectories, and check both the concrete scenarios
//! (stationary hold, constant yaw, gyroscope bias recovery) and the structural
//! invariants the filter core guarantees:
//!
//! 1. The covariance stays symmetric and positive semi-definite after every tick
//! 2. The attitude quaternion stays unit norm after every tick
//! 3. The manifold retract and difference operations invert each other
//! 4. With a consistent model and exact measurements the filter tracks the trajectory
//! 5. The innovation step is idempotent until an a-posteriori step intervenes
//!
//! ## Error metrics
//!
//! Attitude error is measured as the rotation angle of the error quaternion between
//! the estimate and the truth carried by each synthetic sample. Rate and acceleration
//! errors are plain Euclidean norms.

use assert_approx_eq::assert_approx_eq;
use nalgebra::{DMatrix, DVector, Matrix3, Quaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ahrs_ukf::ahrs::{
    Ahrs, AhrsField, G_ACCEL, SensorErrorField, SensorField, ahrs_schema,
    sensor_error_initial_covariance, sensor_error_initial_state,
};
use ahrs_ukf::sim::{ImuSample, ScenarioConfig, generate, run_scenario};
use ahrs_ukf::state::StateVector;
use ahrs_ukf::{MeasurementVector, Precision, Real, precision};

const TICK: Real = 0.01;

/// Builds the pair with a unit-norm magnetic field model (identity mixing matrix, zero
/// biases, unity scale factors), matching the synthetic scenario generator.
fn ahrs_with_unit_field() -> Ahrs {
    let mut ahrs = Ahrs::new();
    let mut errors = sensor_error_initial_state();
    errors.set_matrix3(
        SensorErrorField::MagnetometerScaleFactor,
        Matrix3::identity(),
    );
    ahrs.errors.reset(errors, sensor_error_initial_covariance());
    ahrs
}

/// Rotation angle between two unit quaternions, radians.
fn attitude_error(estimate: &Quaternion<Real>, truth: &Quaternion<Real>) -> Real {
    let d = truth.conjugate() * estimate;
    let vec_norm = Vector3::new(d.i, d.j, d.k).norm();
    2.0 as Real * vec_norm.atan2(d.w.abs())
}

/// Asserts the covariance is symmetric and has eigenvalues above `-1e-9` relative to
/// its largest magnitude.
fn assert_positive_semidefinite(covariance: &DMatrix<Real>, label: &str) {
    let asymmetry = (covariance - covariance.transpose()).norm();
    let scale = covariance.norm().max(1.0);
    assert!(
        asymmetry / scale < 1e-9,
        "{label}: covariance asymmetry {asymmetry}"
    );
    let eigenvalues = covariance.clone().symmetric_eigen().eigenvalues;
    let max_abs = eigenvalues.iter().fold(1.0 as Real, |m, e| m.max(e.abs()));
    let min = eigenvalues.iter().cloned().fold(Real::INFINITY, Real::min);
    assert!(
        min >= -1e-9 * max_abs,
        "{label}: negative eigenvalue {min} (max magnitude {max_abs})"
    );
}

fn assert_unit_attitude(ahrs: &Ahrs, label: &str) {
    let norm = ahrs.attitude().norm();
    assert!(
        (norm - 1.0).abs() < 1e-9,
        "{label}: attitude norm drifted to {norm}"
    );
}

#[test]
fn stationary_at_identity_converges() {
    let mut ahrs = ahrs_with_unit_field();
    let samples = generate(&ScenarioConfig {
        ticks: 1000,
        dt: TICK,
        ..ScenarioConfig::default()
    });
    let records = run_scenario(&mut ahrs, &samples).expect("scenario diverged");
    assert_eq!(records.len(), 1000);

    assert_unit_attitude(&ahrs, "stationary");
    let q = ahrs.attitude();
    assert!(
        attitude_error(&q, &Quaternion::identity()) < 1e-3,
        "attitude drifted from identity: {q}"
    );
    assert!(
        ahrs.angular_velocity().norm() < 1e-3,
        "angular velocity did not settle: {}",
        ahrs.angular_velocity()
    );
    assert!(
        ahrs.acceleration().norm() < 1e-2,
        "acceleration did not settle: {}",
        ahrs.acceleration()
    );
    assert_positive_semidefinite(&ahrs.filter.covariance, "stationary attitude filter");
    assert_positive_semidefinite(&ahrs.errors.covariance, "stationary error filter");
}

#[test]
fn pure_yaw_tracks_rate_and_angle() {
    let mut ahrs = ahrs_with_unit_field();
    let samples = generate(&ScenarioConfig {
        ticks: 1000,
        dt: TICK,
        angular_velocity: Vector3::new(0.0, 0.0, 1.0),
        ..ScenarioConfig::default()
    });
    run_scenario(&mut ahrs, &samples).expect("scenario diverged");

    let rate_error = (ahrs.angular_velocity() - Vector3::new(0.0, 0.0, 1.0)).norm();
    assert!(rate_error < 1e-2, "rate error {rate_error}");

    // After the final tick the estimate sits at the last sample's time.
    let truth = samples.last().unwrap().attitude;
    let angle = attitude_error(&ahrs.attitude(), &truth);
    assert!(angle < 1e-2, "attitude error {angle} rad");
    assert_unit_attitude(&ahrs, "yaw");
}

#[test]
fn gyroscope_bias_is_recovered() {
    let mut ahrs = ahrs_with_unit_field();
    let bias = Vector3::new(0.05, 0.0, 0.0);
    let samples = generate(&ScenarioConfig {
        ticks: 10_000,
        dt: TICK,
        gyro_bias: bias,
        ..ScenarioConfig::default()
    });
    run_scenario(&mut ahrs, &samples).expect("scenario diverged");

    let estimate = ahrs.errors.state.vector3(SensorErrorField::GyroscopeBias);
    assert!(
        (estimate - bias).norm() < 5e-3,
        "gyro bias estimate {estimate} vs injected {bias}"
    );
    // The bias must not have leaked into the rate estimate.
    assert!(
        ahrs.angular_velocity().norm() < 1e-2,
        "angular velocity absorbed the bias: {}",
        ahrs.angular_velocity()
    );
    assert_unit_attitude(&ahrs, "bias recovery");
}

#[test]
fn covariance_stays_positive_under_measurement_stress() {
    let mut ahrs = ahrs_with_unit_field();
    let mut rng = StdRng::seed_from_u64(7);
    let ticks = 10_000;
    for k in 0..ticks {
        let jitter = |rng: &mut StdRng, scale: Real| {
            Vector3::new(
                rng.gen_range(-scale..scale),
                rng.gen_range(-scale..scale),
                rng.gen_range(-scale..scale),
            )
        };
        ahrs.set_accelerometer(Vector3::new(0.0, 0.0, -G_ACCEL) + jitter(&mut rng, 0.2));
        ahrs.set_gyroscope(jitter(&mut rng, 0.05));
        ahrs.set_magnetometer(Vector3::new(1.0, 0.0, 0.0) + jitter(&mut rng, 0.1));
        ahrs.iterate(TICK).expect("stress tick diverged");

        if k % 200 == 0 || k + 1 == ticks {
            assert_positive_semidefinite(&ahrs.filter.covariance, "stress attitude filter");
            assert_positive_semidefinite(&ahrs.errors.covariance, "stress error filter");
            assert_unit_attitude(&ahrs, "stress");
        }
    }
}

#[test]
fn exact_measurements_track_the_trajectory() {
    // Consistent model, near-zero tuning noise, filter started on the truth: the
    // estimate must stay pinned to the trajectory.
    let mut ahrs = ahrs_with_unit_field();
    ahrs.set_process_noise(DVector::zeros(9));
    ahrs.errors.process.noise_diagonal = DVector::zeros(24);
    ahrs.set_measurement_covariance(DVector::from_element(9, 1e-12));

    let samples = generate(&ScenarioConfig {
        ticks: 100,
        dt: TICK,
        ..ScenarioConfig::default()
    });
    run_scenario(&mut ahrs, &samples).expect("scenario diverged");

    assert!(
        attitude_error(&ahrs.attitude(), &Quaternion::identity()) < 1e-6,
        "attitude error exceeds 1e-6"
    );
    assert!(ahrs.angular_velocity().norm() < 1e-6);
    assert!(ahrs.acceleration().norm() < 1e-6);
}

#[test]
fn retract_difference_round_trip_near_arbitrary_states() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..50 {
        let mut state = StateVector::zeroed(ahrs_schema());
        let q = Quaternion::new(
            rng.gen_range(-1.0..1.0 as Real),
            rng.gen_range(-1.0..1.0 as Real),
            rng.gen_range(-1.0..1.0 as Real),
            rng.gen_range(-1.0..1.0 as Real),
        )
        .normalize();
        state.set_quaternion(AhrsField::Attitude, q);
        state.set_vector3(
            AhrsField::AngularVelocity,
            Vector3::new(rng.gen_range(-2.0..2.0), 0.3, -1.1),
        );

        let delta = DVector::from_iterator(9, (0..9).map(|_| rng.gen_range(-0.05..0.05 as Real)));
        let mut perturbed = state.clone();
        perturbed.retract(&delta).unwrap();
        let recovered = perturbed.difference(&state);
        for i in 0..9 {
            assert_approx_eq!(recovered[i], delta[i], 1e-8);
        }
    }
}

#[test]
fn weighted_mean_of_identical_sigma_points_is_exact() {
    let mut state = StateVector::zeroed(ahrs_schema());
    state.set_quaternion(
        AhrsField::Attitude,
        Quaternion::new(0.7, 0.5, -0.3, 0.4).normalize(),
    );
    state.set_vector3(AhrsField::Acceleration, Vector3::new(0.1, 0.2, 0.3));

    // 2L + 1 identical points with the tiny-alpha unscented weights.
    let l = 9;
    let alpha: Real = 1.0e-3;
    let lambda = alpha * alpha * l as Real - l as Real;
    let mut weights = DVector::from_element(2 * l + 1, 1.0 / (2.0 * (l as Real + lambda)));
    weights[0] = lambda / (l as Real + lambda);

    let samples = vec![state.clone(); 2 * l + 1];
    let mean = StateVector::weighted_mean(&samples, &weights);
    assert!(mean.difference(&state).norm() < 1e-9);
}

#[test]
fn innovation_is_idempotent_for_the_coupled_pair() {
    let mut ahrs = ahrs_with_unit_field();
    let mut measurement = MeasurementVector::new();
    measurement.set_vector3(SensorField::Accelerometer, Vector3::new(0.1, 0.0, -G_ACCEL));
    measurement.set_vector3(SensorField::Gyroscope, Vector3::new(0.0, 0.02, 0.0));
    measurement.set_vector3(SensorField::Magnetometer, Vector3::new(1.0, 0.01, 0.0));

    ahrs.filter.a_priori_step(TICK, None).unwrap();
    ahrs.filter
        .innovation_step(&measurement, Some(&ahrs.errors.state))
        .unwrap();
    let s1 = ahrs.filter.innovation_covariance.clone();
    let c1 = ahrs.filter.cross_covariance.clone();
    let y1 = ahrs.filter.residual.clone();

    ahrs.filter
        .innovation_step(&measurement, Some(&ahrs.errors.state))
        .unwrap();
    assert_eq!(ahrs.filter.innovation_covariance, s1);
    assert_eq!(ahrs.filter.cross_covariance, c1);
    assert_eq!(ahrs.filter.residual, y1);
    ahrs.filter.a_posteriori_step().unwrap();
}

#[test]
fn coupling_inflates_the_error_filter_innovation() {
    let mut ahrs = ahrs_with_unit_field();
    let mut measurement = MeasurementVector::new();
    measurement.set_vector3(SensorField::Accelerometer, Vector3::new(0.0, 0.0, -G_ACCEL));
    measurement.set_vector3(SensorField::Gyroscope, Vector3::zeros());
    measurement.set_vector3(SensorField::Magnetometer, Vector3::new(1.0, 0.0, 0.0));

    // Drive the protocol by hand to observe the injection.
    ahrs.filter.a_priori_step(TICK, None).unwrap();
    ahrs.filter
        .innovation_step(&measurement, Some(&ahrs.errors.state))
        .unwrap();
    ahrs.filter.a_posteriori_step().unwrap();
    let attitude_s_yy = ahrs.filter.innovation_covariance.clone();

    ahrs.errors.a_priori_step(TICK, None).unwrap();
    ahrs.errors
        .innovation_step(&measurement, Some(&ahrs.filter.a_priori_state))
        .unwrap();
    let own = ahrs.errors.innovation_covariance.clone();
    ahrs.errors.innovation_covariance += &attitude_s_yy;
    ahrs.errors.a_posteriori_step().unwrap();

    // The injection must strictly inflate the uncertainty budget on every axis.
    for i in 0..9 {
        assert!(
            attitude_s_yy[(i, i)] > 0.0,
            "attitude innovation covariance must be positive on the diagonal"
        );
        assert!(own[(i, i)] > 0.0);
    }
}

#[test]
fn field_api_round_trips_exactly() {
    let mut state = StateVector::zeroed(ahrs_schema());
    state.set_quaternion(AhrsField::Attitude, Quaternion::new(1.0, 0.0, 0.0, 0.0));
    let q = state.quaternion(AhrsField::Attitude);
    assert_eq!(q.w, 1.0);
    assert_eq!(q.i, 0.0);
    assert_eq!(q.j, 0.0);
    assert_eq!(q.k, 0.0);

    let mut errors = sensor_error_initial_state();
    let mixing = Matrix3::from_column_slice(&[
        1.0, 2.0, 3.0, //
        4.0, 5.0, 6.0, //
        7.0, 8.0, 9.0,
    ]);
    errors.set_matrix3(SensorErrorField::MagnetometerScaleFactor, mixing);
    let restored = errors.matrix3(SensorErrorField::MagnetometerScaleFactor);
    assert_eq!(restored, mixing);
}

#[test]
fn precision_accessor_reports_the_compiled_width() {
    match std::mem::size_of::<Real>() {
        8 => assert_eq!(precision(), Precision::Double),
        4 => assert_eq!(precision(), Precision::Single),
        other => panic!("unexpected Real width {other}"),
    }
}

#[test]
fn last_good_state_survives_a_divergent_model() {
    let mut ahrs = ahrs_with_unit_field();
    ahrs.set_accelerometer(Vector3::new(0.0, 0.0, -G_ACCEL));
    ahrs.set_gyroscope(Vector3::zeros());
    ahrs.set_magnetometer(Vector3::new(1.0, 0.0, 0.0));
    ahrs.iterate(TICK).unwrap();

    // A non-finite sensor reading must surface as an error, not poison the estimate.
    ahrs.set_gyroscope(Vector3::new(Real::NAN, 0.0, 0.0));
    assert!(ahrs.iterate(TICK).is_err());
    assert!(ahrs.attitude().norm().is_finite());
    assert_approx_eq!(ahrs.attitude().norm(), 1.0, 1e-9);

    // Reset clears the fault and the pair runs again.
    ahrs.reset();
    ahrs.set_accelerometer(Vector3::new(0.0, 0.0, -G_ACCEL));
    ahrs.set_gyroscope(Vector3::zeros());
    ahrs.set_magnetometer(Vector3::new(1.0, 0.0, 0.0));
    ahrs.iterate(TICK).unwrap();
}

#[test]
fn scenario_truth_matches_the_filter_model() {
    // The generator and the measurement model must agree about the sensor equations;
    // otherwise the tracking tests above measure model mismatch, not filter quality.
    let samples: Vec<ImuSample> = generate(&ScenarioConfig {
        ticks: 200,
        dt: TICK,
        angular_velocity: Vector3::new(0.3, -0.2, 0.5),
        ..ScenarioConfig::default()
    });
    for s in &samples {
        // |accel| equals g and |mag| equals 1 on a non-accelerating body.
        assert_approx_eq!(s.accel.norm(), G_ACCEL, 1e-6);
        assert_approx_eq!(s.mag.norm(), 1.0, 1e-9);
        assert_approx_eq!(s.attitude.norm(), 1.0, 1e-9);
    }
}
