//! Learning-rate schedule: linear warm-up, constant plateau, optional linear
//! decay to zero.
//!
//! ```text
//! multiplier(step) = step / warmup_steps                         step < warmup_steps
//!                  = (steps - step) / (steps - decay_start)      decay_start <= step < steps
//!                  = 1.0                                         otherwise
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where a training step falls in the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingPhase {
    WarmingUp,
    Steady,
    Decaying,
    Finished,
}

/// Deterministic learning-rate multiplier over training steps.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    base_lr: f64,
    steps: usize,
    warmup_steps: usize,
    decay_start: Option<usize>,
    /// Number of scheduler advances so far
    last_step: usize,
}

impl LrSchedule {
    /// Validate boundaries: `warmup_steps < steps`, and if given,
    /// `warmup_steps < decay_start < steps`.
    pub fn new(
        base_lr: f64,
        steps: usize,
        warmup_steps: usize,
        decay_start: Option<usize>,
    ) -> Result<Self, ConfigError> {
        if warmup_steps >= steps {
            return Err(ConfigError::schedule(format!(
                "warmup_steps={warmup_steps} must be >= 0 and < steps={steps}"
            )));
        }
        if let Some(decay_start) = decay_start {
            if decay_start >= steps {
                return Err(ConfigError::schedule(format!(
                    "decay_start={decay_start} must be >= 0 and < steps={steps}"
                )));
            }
            if decay_start <= warmup_steps {
                return Err(ConfigError::schedule(format!(
                    "decay_start={decay_start} must be > warmup_steps={warmup_steps}"
                )));
            }
        }

        Ok(Self {
            base_lr,
            steps,
            warmup_steps,
            decay_start,
            last_step: 0,
        })
    }

    pub fn phase(&self, step: usize) -> TrainingPhase {
        if step >= self.steps {
            TrainingPhase::Finished
        } else if step < self.warmup_steps {
            TrainingPhase::WarmingUp
        } else if self.decay_start.is_some_and(|d| step >= d) {
            TrainingPhase::Decaying
        } else {
            TrainingPhase::Steady
        }
    }

    /// Multiplier applied to the base learning rate at `step`.
    pub fn multiplier(&self, step: usize) -> f64 {
        match self.phase(step) {
            TrainingPhase::WarmingUp => step as f64 / self.warmup_steps as f64,
            TrainingPhase::Steady => 1.0,
            TrainingPhase::Decaying => {
                let decay_start = self.decay_start.unwrap_or(self.steps);
                (self.steps - step) as f64 / (self.steps - decay_start) as f64
            }
            TrainingPhase::Finished => 0.0,
        }
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        self.base_lr * self.multiplier(step)
    }

    /// Learning rate for the scheduler's current position.
    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.last_step)
    }

    /// Move one step forward and return the new learning rate.
    pub fn advance(&mut self) -> f64 {
        self.last_step += 1;
        self.current_lr()
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn decay_start(&self) -> Option<usize> {
        self.decay_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplier_with_decay() {
        let schedule = LrSchedule::new(1.0, 1000, 100, Some(800)).unwrap();
        assert_eq!(schedule.multiplier(0), 0.0);
        assert_eq!(schedule.multiplier(50), 0.5);
        assert_eq!(schedule.multiplier(100), 1.0);
        assert_eq!(schedule.multiplier(799), 1.0);
        assert_eq!(schedule.multiplier(800), 1.0);
        assert_eq!(schedule.multiplier(900), 0.5);
        assert_eq!(schedule.multiplier(1000), 0.0);
    }

    #[test]
    fn test_phases() {
        let schedule = LrSchedule::new(1.0, 1000, 100, Some(800)).unwrap();
        assert_eq!(schedule.phase(0), TrainingPhase::WarmingUp);
        assert_eq!(schedule.phase(100), TrainingPhase::Steady);
        assert_eq!(schedule.phase(800), TrainingPhase::Decaying);
        assert_eq!(schedule.phase(1000), TrainingPhase::Finished);
    }

    #[test]
    fn test_no_warmup_no_decay() {
        let schedule = LrSchedule::new(2e-4, 10, 0, None).unwrap();
        assert_eq!(schedule.multiplier(0), 1.0);
        assert_eq!(schedule.multiplier(9), 1.0);
        assert_eq!(schedule.lr_at(5), 2e-4);
    }

    #[test]
    fn test_advance() {
        let mut schedule = LrSchedule::new(1.0, 10, 4, None).unwrap();
        assert_eq!(schedule.current_lr(), 0.0);
        assert_eq!(schedule.advance(), 0.25);
        assert_eq!(schedule.advance(), 0.5);
    }

    #[test]
    fn test_invalid_boundaries() {
        assert!(LrSchedule::new(1.0, 100, 100, None).is_err());
        assert!(LrSchedule::new(1.0, 100, 10, Some(10)).is_err());
        assert!(LrSchedule::new(1.0, 100, 10, Some(100)).is_err());
        let err = LrSchedule::new(1.0, 100, 50, Some(20)).unwrap_err();
        assert!(err.to_string().contains("decay_start=20"));
    }
}
