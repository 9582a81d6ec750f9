//! The unscented filter core: a three-stage predict/update state machine.
//!
//! One filter tick is driven as `a_priori_step` then `innovation_step` then
//! `a_posteriori_step`. The stages must be called in that order; calling one out of
//! order is a programming error and panics. Numeric failures (a covariance that cannot
//! be factorized after regularisation, a model producing non-finite output) are returned
//! as [FilterError] so an outer driver can reset and resume, and the filter's last good
//! state and covariance stay readable throughout.
//!
//! The innovation intermediates (`innovation_covariance`, `cross_covariance`,
//! `residual`) and the retained a-priori mean are public fields. That is deliberate: the
//! two-filter coupling protocol has the driver condition each filter's measurement model
//! on the other filter's estimate, pass the attitude filter's *a-priori* mean to the
//! parameter filter, and add the attitude filter's innovation covariance into the
//! parameter filter's before its gain is computed. See [crate::ahrs::Ahrs::iterate] for
//! the canonical driver.

use nalgebra::{DMatrix, DVector};

use crate::integrator::Integrator;
use crate::linalg;
use crate::measurement::{MeasurementModel, MeasurementVector};
use crate::state::{StateRate, StateVector};
use crate::{FieldKey, FilterError, Real};

/// Process-model plug-in: the dynamics half of a filter.
pub trait ProcessModel {
    /// Key type of the state the model propagates.
    type Key: FieldKey;
    /// Exogenous input to the dynamics, where the application has one.
    type Input;

    /// Total derivative of the state. Quaternion rate slots follow the convention
    /// documented on [StateRate::set_quaternion_rate]; every output must be finite.
    fn derivative(
        &self,
        state: &StateVector<Self::Key>,
        input: Option<&Self::Input>,
    ) -> StateRate<Self::Key>;

    /// Process-noise covariance for a step of length `dt`, in tangent coordinates.
    /// Symmetric positive semi-definite; the model owns any scaling with `dt`.
    fn process_noise(&self, dt: Real) -> DMatrix<Real>;
}

/// Sigma-point spread tuning.
#[derive(Clone, Copy, Debug)]
pub struct UkfParams {
    /// Spread of the sigma points around the mean.
    pub alpha: Real,
    /// Prior-distribution parameter; 2 is optimal for Gaussian priors.
    pub beta: Real,
    /// Secondary scaling parameter.
    pub kappa: Real,
}

impl Default for UkfParams {
    fn default() -> Self {
        UkfParams {
            alpha: 1.0e-3,
            beta: 2.0,
            kappa: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    APrioriDone,
    InnovationDone,
}

/// Sigma-point Kalman filter over a typed state manifold.
///
/// The filter owns its state, covariance, and models. All buffers are sized from the
/// state schema at construction; per-step allocations are bounded by the sigma count and
/// the enabled measurement dimension.
pub struct UnscentedKalmanFilter<P, M>
where
    P: ProcessModel,
    M: MeasurementModel<StateKey = P::Key>,
{
    /// Current estimate. Equal to the a-priori mean between the a-priori and
    /// a-posteriori steps, and to the posterior mean after a complete tick.
    pub state: StateVector<P::Key>,
    /// Current covariance, in tangent coordinates.
    pub covariance: DMatrix<Real>,
    /// Mean retained from the most recent a-priori step, unchanged by the a-posteriori
    /// update. The coupling driver reads this.
    pub a_priori_state: StateVector<P::Key>,
    /// `S_yy` from the most recent innovation step. The coupling driver may add another
    /// filter's innovation covariance into this before calling the a-posteriori step.
    pub innovation_covariance: DMatrix<Real>,
    /// `P_xy` from the most recent innovation step.
    pub cross_covariance: DMatrix<Real>,
    /// `y = measurement - predicted measurement` from the most recent innovation step.
    pub residual: DVector<Real>,
    /// The dynamics plug-in.
    pub process: P,
    /// The measurement plug-in.
    pub measurement_model: M,
    integrator: Integrator,
    lambda: Real,
    weights_mean: DVector<Real>,
    weights_cov: DVector<Real>,
    sigma_points: Vec<StateVector<P::Key>>,
    stage: Stage,
    skipped_innovation: bool,
}

impl<P, M> UnscentedKalmanFilter<P, M>
where
    P: ProcessModel,
    M: MeasurementModel<StateKey = P::Key>,
{
    /// Builds a filter from an initial mean and covariance (PSD required).
    ///
    /// # Panics
    /// If the covariance is not square with side equal to the schema's covariance size.
    pub fn new(
        state: StateVector<P::Key>,
        covariance: DMatrix<Real>,
        process: P,
        measurement_model: M,
        integrator: Integrator,
        params: UkfParams,
    ) -> Self {
        let l = state.schema().covariance_size();
        if covariance.nrows() != l || covariance.ncols() != l {
            panic!(
                "initial covariance is {}x{}, schema expects {l}x{l}",
                covariance.nrows(),
                covariance.ncols()
            );
        }
        let lf = l as Real;
        let lambda = params.alpha * params.alpha * (lf + params.kappa) - lf;
        let n_sigma = 2 * l + 1;
        let mut weights_mean = DVector::zeros(n_sigma);
        let mut weights_cov = DVector::zeros(n_sigma);
        weights_mean[0] = lambda / (lf + lambda);
        weights_cov[0] = weights_mean[0] + (1.0 as Real - params.alpha * params.alpha + params.beta);
        let w = 1.0 as Real / (2.0 as Real * (lf + lambda));
        for i in 1..n_sigma {
            weights_mean[i] = w;
            weights_cov[i] = w;
        }
        let a_priori_state = state.clone();
        UnscentedKalmanFilter {
            state,
            covariance,
            a_priori_state,
            innovation_covariance: DMatrix::zeros(0, 0),
            cross_covariance: DMatrix::zeros(l, 0),
            residual: DVector::zeros(0),
            process,
            measurement_model,
            integrator,
            lambda,
            weights_mean,
            weights_cov,
            sigma_points: Vec::with_capacity(n_sigma),
            stage: Stage::Idle,
            skipped_innovation: false,
        }
    }

    /// Side length of the covariance (total tangent degrees of freedom).
    pub fn covariance_size(&self) -> usize {
        self.state.schema().covariance_size()
    }

    /// Mean weights of the sigma set, index 0 being the central point.
    pub fn weights_mean(&self) -> &DVector<Real> {
        &self.weights_mean
    }

    /// Covariance weights of the sigma set.
    pub fn weights_cov(&self) -> &DVector<Real> {
        &self.weights_cov
    }

    /// Elementwise square root of the summed absolute values of each covariance row: a
    /// cheap conservative per-axis error bound.
    pub fn error_envelope(&self) -> DVector<Real> {
        DVector::from_iterator(
            self.covariance.nrows(),
            self.covariance
                .row_iter()
                .map(|row| row.iter().map(|v| v.abs()).sum::<Real>().sqrt()),
        )
    }

    /// Reinitialises the filter, clearing any divergence and returning it to the idle
    /// stage.
    pub fn reset(&mut self, state: StateVector<P::Key>, covariance: DMatrix<Real>) {
        let l = self.covariance_size();
        if covariance.nrows() != l || covariance.ncols() != l {
            panic!(
                "reset covariance is {}x{}, schema expects {l}x{l}",
                covariance.nrows(),
                covariance.ncols()
            );
        }
        self.a_priori_state = state.clone();
        self.state = state;
        self.covariance = covariance;
        self.innovation_covariance = DMatrix::zeros(0, 0);
        self.cross_covariance = DMatrix::zeros(l, 0);
        self.residual = DVector::zeros(0);
        self.sigma_points.clear();
        self.stage = Stage::Idle;
        self.skipped_innovation = false;
    }

    /// A-priori step: propagates the state distribution forward by `dt`.
    ///
    /// Generates the `2L + 1` sigma set from the scaled covariance square root,
    /// integrates each point through the process model, and rebuilds the mean (per-field
    /// weighted means, intrinsic for quaternions) and covariance (weighted outer
    /// products of tangent residuals plus the model's process noise). The propagated
    /// sigma set is retained for the innovation step.
    ///
    /// # Errors
    /// [FilterError::Divergence] when the covariance square root fails after
    /// regularisation or the process model produces a non-finite state.
    ///
    /// # Panics
    /// If called while a previous tick is incomplete.
    pub fn a_priori_step(&mut self, dt: Real, input: Option<&P::Input>) -> Result<(), FilterError> {
        if self.stage != Stage::Idle {
            panic!("a_priori_step called out of order (stage {:?})", self.stage);
        }
        let l = self.covariance_size();
        let sqrt = linalg::scaled_sqrt(
            &self.covariance,
            l as Real + self.lambda,
            "a-priori covariance square root",
        )?;

        let mut sigmas = Vec::with_capacity(2 * l + 1);
        sigmas.push(self.state.clone());
        for sign in [1.0 as Real, -1.0 as Real] {
            for i in 0..l {
                let column = sqrt.column(i) * sign;
                let mut point = self.state.clone();
                point.retract(&column)?;
                sigmas.push(point);
            }
        }

        let propagated: Vec<StateVector<P::Key>> = sigmas
            .iter()
            .map(|point| {
                self.integrator
                    .step(point, dt, |s| self.process.derivative(s, input))
            })
            .collect();
        for point in &propagated {
            if point.coefficients().iter().any(|c| !c.is_finite()) {
                return Err(FilterError::Divergence {
                    context: "process model propagation",
                });
            }
        }

        let mean = StateVector::weighted_mean(&propagated, &self.weights_mean);
        let mut p_bar = DMatrix::zeros(l, l);
        for (i, point) in propagated.iter().enumerate() {
            let d = point.difference(&mean);
            p_bar += self.weights_cov[i] * &d * d.transpose();
        }
        let q = self.process.process_noise(dt);
        if q.nrows() != l || q.ncols() != l {
            panic!(
                "process noise is {}x{}, schema expects {l}x{l}",
                q.nrows(),
                q.ncols()
            );
        }
        p_bar += q;

        self.covariance = linalg::symmetrize(&p_bar);
        self.state = mean.clone();
        self.a_priori_state = mean;
        self.sigma_points = propagated;
        self.stage = Stage::APrioriDone;
        Ok(())
    }

    /// Innovation step: maps the retained sigma set through the measurement model.
    ///
    /// For each enabled field (in the measurement's insertion order) the expected
    /// measurement of every sigma point is computed, combined per field by the model's
    /// reconciliation (weighted mean by default), and assembled into the predicted
    /// measurement, the innovation covariance `S_yy` (spread plus the noise diagonal),
    /// the cross-covariance `P_xy`, and the residual. Those three are left in the public
    /// fields for the coupling driver. Re-entering this step with identical inputs and
    /// no intervening a-posteriori recomputes identical outputs.
    ///
    /// An empty measurement vector skips the innovation: the a-posteriori step then
    /// commits the a-priori estimate unchanged.
    ///
    /// # Errors
    /// [FilterError::Divergence] when the measurement model produces non-finite output.
    ///
    /// # Panics
    /// If called before the a-priori step of the current tick, or if a model output or
    /// variance row does not match its field's arity.
    pub fn innovation_step(
        &mut self,
        measurement: &MeasurementVector<M::Key>,
        input: Option<&M::Input>,
    ) -> Result<(), FilterError> {
        match self.stage {
            Stage::APrioriDone | Stage::InnovationDone => {}
            Stage::Idle => panic!("innovation_step called before a_priori_step"),
        }
        let l = self.covariance_size();
        if measurement.is_empty() {
            self.innovation_covariance = DMatrix::zeros(0, 0);
            self.cross_covariance = DMatrix::zeros(l, 0);
            self.residual = DVector::zeros(0);
            self.skipped_innovation = true;
            self.stage = Stage::InnovationDone;
            return Ok(());
        }
        self.skipped_innovation = false;

        let n_sigma = self.sigma_points.len();
        let dim = measurement.dimension();
        let mut z = DMatrix::zeros(dim, n_sigma);
        let mut z_hat = DVector::zeros(dim);
        let mut noise_diag = DVector::zeros(dim);
        let mut offset = 0;
        for (key, observed) in measurement.fields() {
            let n = observed.len();
            let mut field_samples = DMatrix::zeros(n, n_sigma);
            for (i, point) in self.sigma_points.iter().enumerate() {
                let expected = self.measurement_model.expected(key, point, input);
                if expected.len() != n {
                    panic!(
                        "expected measurement for field {key:?} has {} components, observed value has {n}",
                        expected.len()
                    );
                }
                field_samples.set_column(i, &expected);
            }
            if field_samples.iter().any(|v| !v.is_finite()) {
                return Err(FilterError::Divergence {
                    context: "measurement model output",
                });
            }
            let field_mean =
                self.measurement_model
                    .reconcile(key, &field_samples, &self.weights_mean);
            let variance = self.measurement_model.variance(key);
            if variance.len() != n {
                panic!(
                    "variance for field {key:?} has {} components, observed value has {n}",
                    variance.len()
                );
            }
            z.view_mut((offset, 0), (n, n_sigma)).copy_from(&field_samples);
            z_hat.rows_mut(offset, n).copy_from(&field_mean);
            noise_diag.rows_mut(offset, n).copy_from(&variance);
            offset += n;
        }

        let mut s_yy = DMatrix::from_diagonal(&noise_diag);
        let mut p_xy = DMatrix::zeros(l, dim);
        for (i, point) in self.sigma_points.iter().enumerate() {
            let dz = z.column(i) - &z_hat;
            s_yy += self.weights_cov[i] * &dz * dz.transpose();
            let dx = point.difference(&self.a_priori_state);
            p_xy += self.weights_cov[i] * dx * dz.transpose();
        }

        self.residual = measurement.as_vector() - z_hat;
        self.innovation_covariance = s_yy;
        self.cross_covariance = p_xy;
        self.stage = Stage::InnovationDone;
        Ok(())
    }

    /// A-posteriori step: applies the Kalman correction and closes the tick.
    ///
    /// The gain is computed as `K = P_xy * S_yy^-1` through an SPD solve of the
    /// innovation covariance, the mean is retracted by `K * y`, and the covariance is
    /// downdated by `K * S_yy * K^T` and symmetrised.
    ///
    /// # Errors
    /// [FilterError::Divergence] when the innovation covariance cannot be factorized
    /// after regularisation, or the correction drives the state non-finite. The prior
    /// state and covariance are left readable.
    ///
    /// # Panics
    /// If called before the innovation step of the current tick.
    pub fn a_posteriori_step(&mut self) -> Result<(), FilterError> {
        if self.stage != Stage::InnovationDone {
            panic!(
                "a_posteriori_step called out of order (stage {:?})",
                self.stage
            );
        }
        if self.skipped_innovation {
            self.stage = Stage::Idle;
            return Ok(());
        }

        let gain_t = linalg::spd_solve(
            &self.innovation_covariance,
            &self.cross_covariance.transpose(),
            "a-posteriori gain",
        )?;
        let gain = gain_t.transpose();
        let correction = &gain * &self.residual;
        self.state.retract(&correction)?;
        let downdate = &gain * &self.innovation_covariance * gain.transpose();
        self.covariance = linalg::symmetrize(&(&self.covariance - downdate));
        self.stage = Stage::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldKind, Schema};
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector3;
    use std::sync::Arc;

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    enum Key {
        Position,
        Velocity,
    }

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    enum Obs {
        Position,
    }

    fn schema() -> Arc<Schema<Key>> {
        Arc::new(Schema::new(&[
            (Key::Position, FieldKind::Vector(3)),
            (Key::Velocity, FieldKind::Vector(3)),
        ]))
    }

    /// Constant-velocity dynamics.
    struct ConstantVelocity {
        noise: Real,
    }

    impl ProcessModel for ConstantVelocity {
        type Key = Key;
        type Input = ();

        fn derivative(&self, state: &StateVector<Key>, _input: Option<&()>) -> StateRate<Key> {
            let mut rate = StateRate::zeroed(Arc::clone(state.schema()));
            rate.set_vector3(Key::Position, state.vector3(Key::Velocity));
            rate
        }

        fn process_noise(&self, dt: Real) -> DMatrix<Real> {
            DMatrix::from_diagonal(&DVector::from_element(6, self.noise * dt))
        }
    }

    /// Direct position observation.
    struct PositionSensor {
        variance: Real,
    }

    impl MeasurementModel for PositionSensor {
        type StateKey = Key;
        type Key = Obs;
        type Input = ();

        fn expected(&self, _field: Obs, state: &StateVector<Key>, _input: Option<&()>) -> DVector<Real> {
            DVector::from_column_slice(state.vector3(Key::Position).as_slice())
        }

        fn variance(&self, _field: Obs) -> DVector<Real> {
            DVector::from_element(3, self.variance)
        }
    }

    fn filter(noise: Real, variance: Real) -> UnscentedKalmanFilter<ConstantVelocity, PositionSensor> {
        let state = StateVector::zeroed(schema());
        let covariance = DMatrix::from_diagonal(&DVector::from_element(6, 1.0));
        UnscentedKalmanFilter::new(
            state,
            covariance,
            ConstantVelocity { noise },
            PositionSensor { variance },
            Integrator::Rk4,
            UkfParams::default(),
        )
    }

    #[test]
    fn construction_computes_the_standard_weights() {
        let f = filter(1e-3, 0.1);
        let l = 6.0 as Real;
        let alpha = 1.0e-3 as Real;
        let lambda = alpha * alpha * l - l;
        assert_eq!(f.weights_mean().len(), 13);
        assert_approx_eq!(f.weights_mean()[0], lambda / (l + lambda), 1e-6);
        assert_approx_eq!(
            f.weights_cov()[0],
            lambda / (l + lambda) + (1.0 - alpha * alpha + 2.0),
            1e-6
        );
        let w = 1.0 as Real / (2.0 as Real * (l + lambda));
        for i in 1..13 {
            assert_approx_eq!(f.weights_mean()[i], w, 1e-6);
            assert_approx_eq!(f.weights_cov()[i], w, 1e-6);
        }
        // Mean weights sum to one.
        let total: Real = f.weights_mean().iter().sum();
        assert_approx_eq!(total, 1.0, 1e-9);
    }

    #[test]
    fn tracked_position_converges_to_measurements() {
        let mut f = filter(1e-3, 0.01);
        let mut meas = MeasurementVector::new();
        let target = Vector3::new(1.0, -2.0, 0.5);
        for _ in 0..50 {
            meas.set_vector3(Obs::Position, target);
            f.a_priori_step(0.1, None).unwrap();
            f.innovation_step(&meas, None).unwrap();
            f.a_posteriori_step().unwrap();
        }
        let p = f.state.vector3(Key::Position);
        assert!((p - target).norm() < 1e-2, "position did not converge: {p}");
    }

    #[test]
    fn innovation_is_idempotent_before_a_posteriori() {
        let mut f = filter(1e-3, 0.1);
        let mut meas = MeasurementVector::new();
        meas.set_vector3(Obs::Position, Vector3::new(0.3, 0.0, 0.0));
        f.a_priori_step(0.1, None).unwrap();
        f.innovation_step(&meas, None).unwrap();
        let s1 = f.innovation_covariance.clone();
        let c1 = f.cross_covariance.clone();
        let y1 = f.residual.clone();
        f.innovation_step(&meas, None).unwrap();
        assert_eq!(f.innovation_covariance, s1);
        assert_eq!(f.cross_covariance, c1);
        assert_eq!(f.residual, y1);
    }

    #[test]
    fn empty_measurement_skips_the_update() {
        let mut f = filter(1e-3, 0.1);
        f.a_priori_step(0.1, None).unwrap();
        let prior = f.state.clone();
        let prior_cov = f.covariance.clone();
        let empty: MeasurementVector<Obs> = MeasurementVector::new();
        f.innovation_step(&empty, None).unwrap();
        f.a_posteriori_step().unwrap();
        assert_eq!(f.state.coefficients(), prior.coefficients());
        assert_eq!(f.covariance, prior_cov);
        // The tick completed; the next a-priori step is legal.
        f.a_priori_step(0.1, None).unwrap();
    }

    #[test]
    #[should_panic(expected = "called before a_priori_step")]
    fn innovation_requires_a_priori_first() {
        let mut f = filter(1e-3, 0.1);
        let meas: MeasurementVector<Obs> = MeasurementVector::new();
        let _ = f.innovation_step(&meas, None);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn a_priori_cannot_be_reentered_mid_tick() {
        let mut f = filter(1e-3, 0.1);
        f.a_priori_step(0.1, None).unwrap();
        let _ = f.a_priori_step(0.1, None);
    }

    #[test]
    fn a_priori_state_is_retained_through_the_update() {
        let mut f = filter(1e-3, 0.01);
        let mut meas = MeasurementVector::new();
        meas.set_vector3(Obs::Position, Vector3::new(5.0, 0.0, 0.0));
        f.a_priori_step(0.1, None).unwrap();
        let a_priori = f.a_priori_state.clone();
        f.innovation_step(&meas, None).unwrap();
        f.a_posteriori_step().unwrap();
        assert_eq!(
            f.a_priori_state.coefficients(),
            a_priori.coefficients(),
            "a-priori mean must survive the a-posteriori update"
        );
        assert_ne!(f.state.coefficients(), a_priori.coefficients());
    }

    #[test]
    fn covariance_stays_symmetric_over_many_ticks() {
        let mut f = filter(1e-2, 0.05);
        let mut meas = MeasurementVector::new();
        for k in 0..200 {
            let x = (k as Real * 0.1).sin();
            meas.set_vector3(Obs::Position, Vector3::new(x, -x, 0.2));
            f.a_priori_step(0.05, None).unwrap();
            f.innovation_step(&meas, None).unwrap();
            f.a_posteriori_step().unwrap();
            let asym = (&f.covariance - f.covariance.transpose()).norm();
            assert!(asym < 1e-9, "covariance asymmetry {asym} at tick {k}");
        }
    }

    #[test]
    fn error_envelope_is_row_abs_sum_sqrt() {
        let f = filter(1e-3, 0.1);
        let envelope = f.error_envelope();
        assert_eq!(envelope.len(), 6);
        // Identity initial covariance: each row sums to 1.
        for i in 0..6 {
            assert_approx_eq!(envelope[i], 1.0, 1e-12);
        }
    }
}
