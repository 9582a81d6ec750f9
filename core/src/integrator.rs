//! Euler and Runge-Kutta stepping over the state manifold.
//!
//! Both schemes work through [StateVector::advanced], so the per-field apply rules live
//! with the state type: vector fields integrate additively and quaternion fields through
//! the exponential map of their rate quaternion. The Runge-Kutta stages combine their
//! stage rates component-wise (rates are linear objects) and apply the blended rate to
//! the original state in a single step, which keeps quaternion renormalisation out of
//! the derivative path.

use crate::state::{StateRate, StateVector};
use crate::{FieldKey, Real};

/// Integration scheme used by a filter's a-priori step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Integrator {
    /// First-order forward Euler. Adequate when the process model has no dynamics worth
    /// resolving, e.g. a parameter filter with an identically zero derivative.
    Euler,
    /// Classical fourth-order Runge-Kutta.
    Rk4,
}

impl Integrator {
    /// Advances `state` by `dt` under the supplied derivative.
    pub fn step<K, F>(&self, state: &StateVector<K>, dt: Real, derivative: F) -> StateVector<K>
    where
        K: FieldKey,
        F: Fn(&StateVector<K>) -> StateRate<K>,
    {
        match self {
            Integrator::Euler => state.advanced(&derivative(state), dt),
            Integrator::Rk4 => {
                let k1 = derivative(state);
                let k2 = derivative(&state.advanced(&k1, dt * (0.5 as Real)));
                let k3 = derivative(&state.advanced(&k2, dt * (0.5 as Real)));
                let k4 = derivative(&state.advanced(&k3, dt));
                let mut blended = k1;
                blended.scaled_add(2.0, &k2);
                blended.scaled_add(2.0, &k3);
                blended.scaled_add(1.0, &k4);
                blended.scale_mut(1.0 as Real / 6.0 as Real);
                state.advanced(&blended, dt)
            }
        }
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
        Value,
    }

    fn schema() -> Arc<Schema<Key>> {
        Arc::new(Schema::new(&[(Key::Value, FieldKind::Vector(3))]))
    }

    fn decay(state: &StateVector<Key>) -> StateRate<Key> {
        let mut rate = StateRate::zeroed(Arc::clone(state.schema()));
        rate.set_vector3(Key::Value, -state.vector3(Key::Value));
        rate
    }

    #[test]
    fn euler_takes_a_first_order_step() {
        let mut state = StateVector::zeroed(schema());
        state.set_vector3(Key::Value, Vector3::new(1.0, 2.0, 4.0));
        let next = Integrator::Euler.step(&state, 0.1, decay);
        let v = next.vector3(Key::Value);
        assert_approx_eq!(v.x, 0.9, 1e-12);
        assert_approx_eq!(v.y, 1.8, 1e-12);
        assert_approx_eq!(v.z, 3.6, 1e-12);
    }

    #[test]
    fn rk4_tracks_exponential_decay_to_fourth_order() {
        let mut state = StateVector::zeroed(schema());
        state.set_vector3(Key::Value, Vector3::new(1.0, 0.0, 0.0));
        let dt: Real = 0.1;
        for _ in 0..10 {
            state = Integrator::Rk4.step(&state, dt, decay);
        }
        let exact = (-1.0 as Real).exp();
        assert_approx_eq!(state.vector3(Key::Value).x, exact, 1e-7);
    }

    #[test]
    fn rk4_matches_euler_for_constant_derivative() {
        let constant = |state: &StateVector<Key>| {
            let mut rate = StateRate::zeroed(Arc::clone(state.schema()));
            rate.set_vector3(Key::Value, Vector3::new(0.5, -0.25, 1.0));
            rate
        };
        let state = StateVector::zeroed(schema());
        let euler = Integrator::Euler.step(&state, 0.2, constant);
        let rk4 = Integrator::Rk4.step(&state, 0.2, constant);
        let d = euler.vector3(Key::Value) - rk4.vector3(Key::Value);
        assert!(d.norm() < 1e-12);
    }
}
