//! Learning-rate schedules.
//!
//! The scheduler produces a multiplier of the initial learning rate; every
//! optimizer of a model is rescaled by the same factor.

use atelier_core::{LrPolicy, TrainConfig};

const PLATEAU_FACTOR: f64 = 0.2;
const PLATEAU_THRESHOLD: f64 = 0.01;
const PLATEAU_PATIENCE: usize = 5;

#[derive(Debug, Clone)]
pub struct LrScheduler {
    policy: LrPolicy,
    epoch_count: usize,
    niter: usize,
    niter_decay: usize,
    lr_decay: usize,
    gamma: f64,
    /// Number of completed `step` calls
    steps: usize,
    plateau: PlateauState,
}

#[derive(Debug, Clone)]
struct PlateauState {
    best: f64,
    bad_epochs: usize,
    multiplier: f64,
}

impl Default for PlateauState {
    fn default() -> Self {
        Self {
            best: f64::INFINITY,
            bad_epochs: 0,
            multiplier: 1.0,
        }
    }
}

impl LrScheduler {
    pub fn new(train: &TrainConfig) -> Self {
        Self {
            policy: train.lr_policy,
            epoch_count: train.epoch_count,
            niter: train.niter,
            niter_decay: train.niter_decay,
            lr_decay: train.lr_decay.max(1),
            gamma: train.lr_gamma,
            steps: 0,
            plateau: PlateauState::default(),
        }
    }

    pub fn policy(&self) -> LrPolicy {
        self.policy
    }

    /// Current multiplier of the initial learning rate
    pub fn multiplier(&self) -> f64 {
        match self.policy {
            LrPolicy::Step => self.gamma.powi((self.steps / self.lr_decay) as i32),
            LrPolicy::Lambda => {
                let over = (self.steps + 1 + self.epoch_count) as f64 - self.niter as f64;
                (1.0 - over.max(0.0) / (self.niter_decay + 1) as f64).max(0.0)
            }
            LrPolicy::Plateau => self.plateau.multiplier,
        }
    }

    /// Advance one epoch. `metric` is only consulted by the plateau policy,
    /// which keeps the rate when it is absent.
    pub fn step(&mut self, metric: Option<f64>) -> f64 {
        if self.policy == LrPolicy::Plateau {
            if let Some(metric) = metric {
                self.observe(metric);
            }
        }
        self.steps += 1;
        self.multiplier()
    }

    fn observe(&mut self, metric: f64) {
        let state = &mut self.plateau;
        if metric < state.best * (1.0 - PLATEAU_THRESHOLD) {
            state.best = metric;
            state.bad_epochs = 0;
        } else {
            state.bad_epochs += 1;
        }
        if state.bad_epochs > PLATEAU_PATIENCE {
            state.multiplier *= PLATEAU_FACTOR;
            state.bad_epochs = 0;
        }
    }
}
