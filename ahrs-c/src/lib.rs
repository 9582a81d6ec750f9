//! Flat C ABI over a single hidden AHRS filter pair.
//!
//! The core library keeps no global state; this crate wraps exactly one [Ahrs] pair
//! behind a process-wide mutex for callers (C, ctypes, embedded glue) that want the
//! classic init / set-sensors / iterate / get-state interface. Quaternions cross the
//! boundary in `[x, y, z, w]` order. All vectors and matrices use the crate's compiled
//! [Real] width; [ukf_config_get_precision] reports which one that is.
//!
//! A tick that diverges numerically leaves the last good state readable; call
//! [ukf_init] to reinitialise after a fault.

use std::sync::{Mutex, OnceLock};

use nalgebra::{DVector, Quaternion, Vector3};

use ahrs_ukf::ahrs::Ahrs;
use ahrs_ukf::{Precision, Real, precision};

/// State exchange struct; attitude is `[x, y, z, w]`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct UkfState {
    pub attitude: [Real; 4],
    pub angular_velocity: [Real; 3],
    pub acceleration: [Real; 3],
}

/// Per-axis measurement variances for the three sensors.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct UkfSensorParams {
    pub accel_covariance: [Real; 3],
    pub gyro_covariance: [Real; 3],
    pub mag_covariance: [Real; 3],
}

/// Compiled floating-point width of the library.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UkfPrecision {
    Float = 0,
    Double = 1,
}

struct Wrapper {
    ahrs: Ahrs,
    diverged: bool,
}

fn instance() -> &'static Mutex<Wrapper> {
    static INSTANCE: OnceLock<Mutex<Wrapper>> = OnceLock::new();
    INSTANCE.get_or_init(|| {
        Mutex::new(Wrapper {
            ahrs: Ahrs::new(),
            diverged: false,
        })
    })
}

fn with_ahrs<T>(f: impl FnOnce(&mut Ahrs) -> T) -> T {
    with_wrapper(|wrapper| f(&mut wrapper.ahrs))
}

fn with_wrapper<T>(f: impl FnOnce(&mut Wrapper) -> T) -> T {
    let mut guard = match instance().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}

/// Reinitialises the hidden pair to the default tuning and clears any divergence.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_init() {
    with_wrapper(|wrapper| {
        wrapper.ahrs.reset();
        wrapper.diverged = false;
    });
}

/// Runs one coupled tick against the currently set sensor readings.
///
/// On numeric divergence the last good state remains readable and further ticks are
/// ignored until [ukf_init] reinitialises the pair.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_iterate(dt: Real) {
    with_wrapper(|wrapper| {
        if wrapper.diverged {
            return;
        }
        if wrapper.ahrs.iterate(dt).is_err() {
            wrapper.diverged = true;
        }
    });
}

/// Overwrites the attitude estimate.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_set_attitude(w: Real, x: Real, y: Real, z: Real) {
    with_ahrs(|ahrs| {
        ahrs.filter.state.set_quaternion(
            ahrs_ukf::ahrs::AhrsField::Attitude,
            Quaternion::new(w, x, y, z),
        );
    });
}

/// Overwrites the angular-velocity estimate.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_set_angular_velocity(x: Real, y: Real, z: Real) {
    with_ahrs(|ahrs| {
        ahrs.filter
            .state
            .set_vector3(ahrs_ukf::ahrs::AhrsField::AngularVelocity, Vector3::new(x, y, z));
    });
}

/// Overwrites the acceleration estimate.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_set_acceleration(x: Real, y: Real, z: Real) {
    with_ahrs(|ahrs| {
        ahrs.filter
            .state
            .set_vector3(ahrs_ukf::ahrs::AhrsField::Acceleration, Vector3::new(x, y, z));
    });
}

/// Copies the current state estimate into `state`.
///
/// # Safety
/// `state` must point to a writable [UkfState].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ukf_get_state(state: *mut UkfState) {
    if state.is_null() {
        return;
    }
    let snapshot = with_ahrs(|ahrs| {
        let q = ahrs.attitude();
        let w = ahrs.angular_velocity();
        let a = ahrs.acceleration();
        UkfState {
            attitude: [q.i, q.j, q.k, q.w],
            angular_velocity: [w.x, w.y, w.z],
            acceleration: [a.x, a.y, a.z],
        }
    });
    unsafe { *state = snapshot };
}

/// Overwrites the whole state estimate from `state`.
///
/// # Safety
/// `state` must point to a valid [UkfState] with a unit-norm attitude.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ukf_set_state(state: *const UkfState) {
    if state.is_null() {
        return;
    }
    let value = unsafe { *state };
    with_ahrs(|ahrs| {
        ahrs.filter.state.set_quaternion(
            ahrs_ukf::ahrs::AhrsField::Attitude,
            Quaternion::new(
                value.attitude[3],
                value.attitude[0],
                value.attitude[1],
                value.attitude[2],
            ),
        );
        ahrs.filter.state.set_vector3(
            ahrs_ukf::ahrs::AhrsField::AngularVelocity,
            Vector3::from_column_slice(&value.angular_velocity),
        );
        ahrs.filter.state.set_vector3(
            ahrs_ukf::ahrs::AhrsField::Acceleration,
            Vector3::from_column_slice(&value.acceleration),
        );
    });
}

/// Copies the full 9x9 attitude-filter covariance, column-major.
///
/// # Safety
/// `covariance` must point to 81 writable [Real] values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ukf_get_state_covariance(covariance: *mut Real) {
    if covariance.is_null() {
        return;
    }
    with_ahrs(|ahrs| {
        let p = &ahrs.filter.covariance;
        let out = unsafe { std::slice::from_raw_parts_mut(covariance, p.len()) };
        out.copy_from_slice(p.as_slice());
    });
}

/// Copies the attitude-filter covariance diagonal.
///
/// # Safety
/// `diagonal` must point to 9 writable [Real] values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ukf_get_state_covariance_diagonal(diagonal: *mut Real) {
    if diagonal.is_null() {
        return;
    }
    with_ahrs(|ahrs| {
        let d = ahrs.filter.covariance.diagonal();
        let out = unsafe { std::slice::from_raw_parts_mut(diagonal, d.len()) };
        out.copy_from_slice(d.as_slice());
    });
}

/// Copies the per-axis error envelope (square root of summed absolute covariance rows).
///
/// # Safety
/// `error` must point to 9 writable [Real] values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ukf_get_state_error(error: *mut Real) {
    if error.is_null() {
        return;
    }
    with_ahrs(|ahrs| {
        let envelope = ahrs.error_envelope();
        let out = unsafe { std::slice::from_raw_parts_mut(error, envelope.len()) };
        out.copy_from_slice(envelope.as_slice());
    });
}

/// Disables every sensor field for the next tick.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_sensor_clear() {
    with_ahrs(|ahrs| ahrs.clear_sensors());
}

/// Stores an accelerometer reading for the next tick.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_sensor_set_accelerometer(x: Real, y: Real, z: Real) {
    with_ahrs(|ahrs| ahrs.set_accelerometer(Vector3::new(x, y, z)));
}

/// Stores a gyroscope reading for the next tick.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_sensor_set_gyroscope(x: Real, y: Real, z: Real) {
    with_ahrs(|ahrs| ahrs.set_gyroscope(Vector3::new(x, y, z)));
}

/// Stores a magnetometer reading for the next tick.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_sensor_set_magnetometer(x: Real, y: Real, z: Real) {
    with_ahrs(|ahrs| ahrs.set_magnetometer(Vector3::new(x, y, z)));
}

/// Replaces the per-axis measurement variances of both filters.
///
/// # Safety
/// `params` must point to a valid [UkfSensorParams].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ukf_set_params(params: *const UkfSensorParams) {
    if params.is_null() {
        return;
    }
    let value = unsafe { *params };
    with_ahrs(|ahrs| {
        let mut covariance = DVector::zeros(9);
        for i in 0..3 {
            covariance[i] = value.accel_covariance[i];
            covariance[i + 3] = value.gyro_covariance[i];
            covariance[i + 6] = value.mag_covariance[i];
        }
        ahrs.set_measurement_covariance(covariance);
    });
}

/// Replaces the attitude filter's process noise diagonal.
///
/// # Safety
/// `diagonal` must point to 9 readable [Real] values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ukf_set_process_noise(diagonal: *const Real) {
    if diagonal.is_null() {
        return;
    }
    let values = unsafe { std::slice::from_raw_parts(diagonal, 9) };
    with_ahrs(|ahrs| ahrs.set_process_noise(DVector::from_column_slice(values)));
}

/// Covariance side length of the attitude filter.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_config_get_state_dim() -> u32 {
    with_ahrs(|ahrs| ahrs.filter.covariance_size() as u32)
}

/// Maximum measurement dimension (all three sensors enabled).
#[unsafe(no_mangle)]
pub extern "C" fn ukf_config_get_measurement_dim() -> u32 {
    9
}

/// Reports the compiled floating-point width.
#[unsafe(no_mangle)]
pub extern "C" fn ukf_config_get_precision() -> UkfPrecision {
    match precision() {
        Precision::Single => UkfPrecision::Float,
        Precision::Double => UkfPrecision::Double,
    }
}
