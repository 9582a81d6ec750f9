//! Synthetic scenario utilities for exercising the coupled AHRS pair.
//!
//! This module generates IMU measurement streams from known rigid-body trajectories
//! (constant body rate, optional injected gyroscope bias, optional Gaussian sensor
//! noise) and records filter estimates as flat CSV rows. The simulator binary and the
//! integration tests are the consumers; nothing here feeds back into the filter core.
//!
//! Measurements are produced by the same sensor equations the filters assume: the
//! accelerometer sees gravity rotated into the body frame, the gyroscope sees the body
//! rate plus any injected bias, and the magnetometer sees the unit north field rotated
//! into the body frame. Each sample carries the true attitude it was generated from so
//! tests can compute tracking error directly.

use std::error::Error;
use std::path::Path;

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::ahrs::{Ahrs, G_ACCEL, SensorErrorField};
use crate::state::exp_map;
use crate::{FilterError, Real};

/// One synthetic IMU sample, with the true attitude it was generated from.
#[derive(Clone, Debug)]
pub struct ImuSample {
    /// Sample time, seconds from scenario start.
    pub time: Real,
    /// Accelerometer reading, m/s^2 in the body frame.
    pub accel: Vector3<Real>,
    /// Gyroscope reading, rad/s in the body frame.
    pub gyro: Vector3<Real>,
    /// Magnetometer reading, unit north field in the body frame.
    pub mag: Vector3<Real>,
    /// True NED-to-body attitude at this sample.
    pub attitude: Quaternion<Real>,
}

/// Configuration of a constant-rate rigid-body scenario.
#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    /// Number of samples to generate.
    pub ticks: usize,
    /// Sample interval, seconds.
    pub dt: Real,
    /// Constant body-frame angular velocity, rad/s.
    pub angular_velocity: Vector3<Real>,
    /// Constant bias injected into the gyroscope readings, rad/s.
    pub gyro_bias: Vector3<Real>,
    /// Standard deviation of Gaussian noise added per accelerometer axis.
    pub accel_noise_std: Real,
    /// Standard deviation of Gaussian noise added per gyroscope axis.
    pub gyro_noise_std: Real,
    /// Standard deviation of Gaussian noise added per magnetometer axis.
    pub mag_noise_std: Real,
    /// Seed of the noise generator; scenarios are reproducible per seed.
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            ticks: 1000,
            dt: 0.01,
            angular_velocity: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_noise_std: 0.0,
            gyro_noise_std: 0.0,
            mag_noise_std: 0.0,
            seed: 0,
        }
    }
}

struct AxisNoise {
    rng: StdRng,
    accel: Option<Normal<Real>>,
    gyro: Option<Normal<Real>>,
    mag: Option<Normal<Real>>,
}

impl AxisNoise {
    fn new(config: &ScenarioConfig) -> Self {
        let dist = |std: Real| {
            (std > 0.0).then(|| Normal::new(0.0, std).expect("noise std must be finite"))
        };
        AxisNoise {
            rng: StdRng::seed_from_u64(config.seed),
            accel: dist(config.accel_noise_std),
            gyro: dist(config.gyro_noise_std),
            mag: dist(config.mag_noise_std),
        }
    }

    fn perturb(&mut self, v: Vector3<Real>, dist: Option<Normal<Real>>) -> Vector3<Real> {
        match dist {
            Some(d) => v.map(|c| c + d.sample(&mut self.rng)),
            None => v,
        }
    }
}

/// Generates the measurement stream of a constant-rate trajectory starting at identity
/// attitude.
pub fn generate(config: &ScenarioConfig) -> Vec<ImuSample> {
    let mut noise = AxisNoise::new(config);
    let mut attitude = Quaternion::identity();
    let gravity = Vector3::new(0.0, 0.0, -G_ACCEL);
    let north = Vector3::new(1.0, 0.0, 0.0);
    // Exact one-step rotation increment for the constant body rate.
    let step = exp_map(config.angular_velocity * (-0.5 as Real) * config.dt);

    let mut samples = Vec::with_capacity(config.ticks);
    for k in 0..config.ticks {
        let rotation = UnitQuaternion::new_unchecked(attitude);
        let accel = noise.perturb(rotation.transform_vector(&gravity), noise.accel);
        let gyro = noise.perturb(config.angular_velocity + config.gyro_bias, noise.gyro);
        let mag = noise.perturb(rotation.transform_vector(&north), noise.mag);
        samples.push(ImuSample {
            time: k as Real * config.dt,
            accel,
            gyro,
            mag,
            attitude,
        });
        attitude = (step * attitude).normalize();
    }
    samples
}

/// One row of filter output, flattened for CSV serialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstimateRecord {
    /// Sample time, seconds from scenario start.
    pub time: Real,
    pub qw: Real,
    pub qx: Real,
    pub qy: Real,
    pub qz: Real,
    pub angular_velocity_x: Real,
    pub angular_velocity_y: Real,
    pub angular_velocity_z: Real,
    pub acceleration_x: Real,
    pub acceleration_y: Real,
    pub acceleration_z: Real,
    pub gyro_bias_x: Real,
    pub gyro_bias_y: Real,
    pub gyro_bias_z: Real,
}

impl EstimateRecord {
    /// Snapshots the pair's current estimates.
    pub fn from_ahrs(time: Real, ahrs: &Ahrs) -> Self {
        let q = ahrs.attitude();
        let w = ahrs.angular_velocity();
        let a = ahrs.acceleration();
        let bias = ahrs.errors.state.vector3(SensorErrorField::GyroscopeBias);
        EstimateRecord {
            time,
            qw: q.w,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            angular_velocity_x: w.x,
            angular_velocity_y: w.y,
            angular_velocity_z: w.z,
            acceleration_x: a.x,
            acceleration_y: a.y,
            acceleration_z: a.z,
            gyro_bias_x: bias.x,
            gyro_bias_y: bias.y,
            gyro_bias_z: bias.z,
        }
    }

    /// Writes records to a CSV file with a header row.
    pub fn to_csv<P: AsRef<Path>>(records: &[EstimateRecord], path: P) -> Result<(), Box<dyn Error>> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads records back from a CSV file written by [EstimateRecord::to_csv].
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<EstimateRecord>, Box<dyn Error>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            records.push(row?);
        }
        Ok(records)
    }
}

/// Feeds a measurement stream through the pair, one coupled tick per sample, recording
/// the estimates after each tick.
///
/// Each tick propagates up to the sample's own time before updating with it, so the
/// tick length is the gap from the previous sample; the first sample sits at the
/// initialisation time and gets a zero-length propagation.
pub fn run_scenario(ahrs: &mut Ahrs, samples: &[ImuSample]) -> Result<Vec<EstimateRecord>, FilterError> {
    let mut records = Vec::with_capacity(samples.len());
    for (k, sample) in samples.iter().enumerate() {
        let dt = if k > 0 {
            sample.time - samples[k - 1].time
        } else {
            0.0
        };
        ahrs.set_accelerometer(sample.accel);
        ahrs.set_gyroscope(sample.gyro);
        ahrs.set_magnetometer(sample.mag);
        ahrs.iterate(dt)?;
        records.push(EstimateRecord::from_ahrs(sample.time, ahrs));
    }
    Ok(records)
}
