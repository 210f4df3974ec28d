//! Configuration of the solver loop and of constraint softness.

use crate::math::Real;
use crate::utils::SimdRealCopy;

/// Parameters controlling the solver's stepping scheme and pool sizing.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SolverParameters {
    /// The number of solver iterations run per sub-step.
    pub iteration_count: usize,
    /// The number of sub-steps each `step` is split into.
    pub substep_count: usize,
    /// The maximum number of synchronized constraint batches. Constraints
    /// that conflict with every batch under this limit go to the fallback
    /// batch and are solved with Jacobi averaging.
    pub fallback_batch_threshold: usize,
    /// Initial capacity hint for bodies and constraints.
    pub initial_capacity: usize,
    /// Initial capacity hint for sleeping islands.
    pub initial_island_capacity: usize,
    /// The smallest capacity allocated for a new type batch.
    pub minimum_capacity_per_type_batch: usize,
}

impl Default for SolverParameters {
    fn default() -> Self {
        Self {
            iteration_count: 8,
            substep_count: 1,
            fallback_batch_threshold: 64,
            initial_capacity: 128,
            initial_island_capacity: 8,
            minimum_capacity_per_type_batch: 64,
        }
    }
}

impl SolverParameters {
    /// The duration of one sub-step for a step of length `dt`.
    pub fn substep_dt(&self, dt: Real) -> Real {
        dt / self.substep_count as Real
    }
}

/// The stiffness and damping of a spring-like constraint.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SpringSettings {
    /// The natural frequency (Hz) of the constraint. Higher values resolve
    /// violations more quickly.
    pub frequency: Real,
    /// The damping ratio. 1 is critical damping.
    pub damping_ratio: Real,
}

impl SpringSettings {
    /// Creates spring settings from a natural frequency and damping ratio.
    pub fn new(frequency: Real, damping_ratio: Real) -> Self {
        Self {
            frequency,
            damping_ratio,
        }
    }

    /// Settings stiff enough to behave as a hard constraint at interactive
    /// time steps.
    pub fn rigid() -> Self {
        Self::new(1.0e6, 1.0)
    }

    /// Default softness for contacts.
    pub fn contact_defaults() -> Self {
        Self::new(30.0, 5.0)
    }

    /// Default softness for joints.
    pub fn joint_defaults() -> Self {
        Self::new(30.0, 1.0)
    }
}

impl Default for SpringSettings {
    fn default() -> Self {
        Self::joint_defaults()
    }
}

/// Per-sub-step coefficients derived from [`SpringSettings`].
///
/// `bias` converts a position error into a corrective velocity;
/// `effective_mass_scale` softens the effective mass (CFM); `impulse_scale`
/// bleeds off part of the accumulated impulse each iteration, which is what
/// keeps a soft constraint from ringing.
#[derive(Copy, Clone, Debug)]
pub struct SoftnessCoefficients<N> {
    /// Position-error to corrective-velocity coefficient.
    pub bias: N,
    /// Scale applied to the inverse effective mass.
    pub effective_mass_scale: N,
    /// Scale applied to the accumulated impulse in each solve.
    pub impulse_scale: N,
}

impl<N: SimdRealCopy> SoftnessCoefficients<N> {
    /// Computes the coefficients of a spring for sub-steps of length `dt`.
    pub fn new(frequency: N, damping_ratio: N, dt: N) -> Self {
        let two = N::splat(2.0);
        let angular_frequency = frequency * N::simd_two_pi();
        let dt_angular_frequency = dt * angular_frequency;
        let bias = angular_frequency / (dt_angular_frequency + two * damping_ratio);
        let extra = N::one() / (dt_angular_frequency * (dt_angular_frequency + two * damping_ratio));
        let effective_mass_scale = N::one() / (N::one() + extra);
        Self {
            bias,
            effective_mass_scale,
            impulse_scale: extra * effective_mass_scale,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rigid_springs_behave_almost_hard() {
        let dt = 1.0 / 60.0;
        let s = SpringSettings::rigid();
        let c = SoftnessCoefficients::new(s.frequency, s.damping_ratio, dt);
        // Nearly the full position error is corrected within one sub-step.
        assert!((c.bias * dt - 1.0).abs() < 1.0e-3);
        assert!(c.effective_mass_scale > 0.999);
        assert!(c.impulse_scale < 1.0e-6);
    }

    #[test]
    fn soft_springs_keep_a_partial_bias() {
        let dt = 1.0 / 60.0;
        let s = SpringSettings::new(30.0, 1.0);
        let c = SoftnessCoefficients::new(s.frequency, s.damping_ratio, dt);
        assert!(c.bias * dt < 1.0);
        assert!(c.effective_mass_scale < 1.0);
        assert!(c.impulse_scale > 0.0);
    }
}
