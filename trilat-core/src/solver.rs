//! Multilateration by gradient descent
//!
//! Minimizes the sum of squared residuals between each anchor's measured
//! distance and the Euclidean distance from a candidate point to that anchor.
//! Non-convergence is not an error: the last candidate is returned with
//! diagnostics describing how far the descent got.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SolveError;
use crate::types::Position;

/// Minimum number of ranges needed for a 3D fix
pub const MIN_ANCHORS: usize = 3;

/// One anchor's contribution to a solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeObservation {
    pub anchor: Position,
    pub distance: f64,
}

impl RangeObservation {
    pub fn new(anchor: Position, distance: f64) -> Self {
        Self { anchor, distance }
    }
}

/// Result of a solve with its convergence diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub position: Position,
    /// Iterations actually performed
    pub iterations: usize,
    /// Whether the gradient magnitude fell below the threshold
    pub converged: bool,
    /// Sum of squared residuals at the last evaluated candidate
    pub residual: f64,
    /// Number of ranges used
    pub anchors_used: usize,
}

/// Where the descent starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitialGuess {
    /// Coordinate origin on every run
    #[default]
    Origin,
    /// Warm start from the previous target fix
    LastFix,
    /// Mean position of the anchors being solved
    Centroid,
}

impl std::str::FromStr for InitialGuess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "origin" => Ok(InitialGuess::Origin),
            "last-fix" => Ok(InitialGuess::LastFix),
            "centroid" => Ok(InitialGuess::Centroid),
            other => Err(format!("unknown initial guess strategy: {}", other)),
        }
    }
}

/// Gradient descent hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub max_iterations: usize,
    pub step_size: f64,
    pub convergence_threshold: f64,
    pub min_anchors: usize,
}

impl SolverConfig {
    /// Anchors actually required; never fewer than [`MIN_ANCHORS`]
    pub fn required_anchors(&self) -> usize {
        self.min_anchors.max(MIN_ANCHORS)
    }

    /// Check the hyperparameters describe a descent that can make progress
    pub fn validate(&self) -> Result<(), String> {
        if self.max_iterations == 0 {
            return Err("max_iterations must be at least 1".to_string());
        }
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(format!("step_size must be positive, got {}", self.step_size));
        }
        if !(self.convergence_threshold.is_finite() && self.convergence_threshold > 0.0) {
            return Err(format!(
                "convergence_threshold must be positive, got {}",
                self.convergence_threshold
            ));
        }
        Ok(())
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            step_size: 0.1,
            convergence_threshold: 0.001,
            min_anchors: MIN_ANCHORS,
        }
    }
}

/// Strategy that turns ranges into a position estimate
pub trait PositionSolver: Send + Sync {
    fn solve(
        &self,
        observations: &[RangeObservation],
        initial_guess: Position,
    ) -> Result<Solution, SolveError>;
}

/// Baseline fixed-step gradient descent
#[derive(Debug, Clone, Default)]
pub struct GradientDescent {
    config: SolverConfig,
}

impl GradientDescent {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }
}

impl PositionSolver for GradientDescent {
    fn solve(
        &self,
        observations: &[RangeObservation],
        initial_guess: Position,
    ) -> Result<Solution, SolveError> {
        let required = self.config.required_anchors();
        if observations.len() < required {
            return Err(SolveError::InsufficientAnchors {
                available: observations.len(),
                required,
            });
        }

        let mut position = initial_guess;
        let mut residual = 0.0;
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.config.max_iterations {
            let mut gradient = Position::ORIGIN;
            residual = 0.0;

            for obs in observations {
                let dx = position.x - obs.anchor.x;
                let dy = position.y - obs.anchor.y;
                let dz = position.z - obs.anchor.z;
                let calculated = (dx * dx + dy * dy + dz * dz).sqrt();

                let error = calculated - obs.distance;
                residual += error * error;

                // Direction is undefined on top of the anchor
                if calculated > 0.0 {
                    gradient.x += 2.0 * error * dx / calculated;
                    gradient.y += 2.0 * error * dy / calculated;
                    gradient.z += 2.0 * error * dz / calculated;
                }
            }

            position.x -= self.config.step_size * gradient.x;
            position.y -= self.config.step_size * gradient.y;
            position.z -= self.config.step_size * gradient.z;
            iterations += 1;

            let magnitude = gradient.distance_to(&Position::ORIGIN);
            if magnitude < self.config.convergence_threshold {
                converged = true;
                break;
            }
        }

        if converged {
            debug!(
                "Trilateration converged after {} iterations, error: {:.6}",
                iterations, residual
            );
        } else {
            warn!(
                "Trilateration did not fully converge after {} iterations, error: {:.6}",
                iterations, residual
            );
        }

        Ok(Solution {
            position,
            iterations,
            converged,
            residual,
            anchors_used: observations.len(),
        })
    }
}
