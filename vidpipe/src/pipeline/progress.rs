//! Weighted overall progress.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::status::Stage;
use crate::{Error, Result};

/// Share of the overall percentage each stage accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageWeights {
    pub download: u32,
    pub processing: u32,
    pub merge: u32,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self::new(30, 50, 20)
    }
}

impl StageWeights {
    pub fn new(download: u32, processing: u32, merge: u32) -> Self {
        Self {
            download,
            processing,
            merge,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sum = self.download + self.processing + self.merge;
        if sum != 100 {
            return Err(Error::validation(format!(
                "stage weights must sum to 100, got {}",
                sum
            )));
        }
        Ok(())
    }

    pub fn weight(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Download => self.download,
            Stage::Process => self.processing,
            Stage::Merge => self.merge,
        }
    }
}

/// Parses `"30,50,20"` as download, processing, merge.
impl FromStr for StageWeights {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [d, p, m] = parts.as_slice() else {
            return Err(Error::config(format!(
                "stage weights need three comma separated values, got '{}'",
                s
            )));
        };
        let parse = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| Error::config(format!("invalid stage weight '{}'", v)))
        };
        Ok(Self::new(parse(d)?, parse(p)?, parse(m)?))
    }
}

/// Tracks one run's overall percentage.
///
/// Weights are normalized over the planned stages, so a run without a
/// download stage still ends at 100. The reported value never decreases.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    stages: Vec<(Stage, f64)>,
    completed: Vec<Stage>,
    active: Option<(Stage, f64)>,
    high_water: f64,
}

impl ProgressTracker {
    pub fn new(stages: &[Stage], weights: &StageWeights) -> Self {
        let total: u32 = stages.iter().map(|s| weights.weight(*s)).sum();
        let stages = stages
            .iter()
            .map(|s| {
                let share = if total == 0 {
                    100.0 / stages.len() as f64
                } else {
                    weights.weight(*s) as f64 * 100.0 / total as f64
                };
                (*s, share)
            })
            .collect();
        Self {
            stages,
            completed: Vec::new(),
            active: None,
            high_water: 0.0,
        }
    }

    fn share(&self, stage: Stage) -> f64 {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, w)| *w)
            .unwrap_or(0.0)
    }

    fn recompute(&mut self) -> f64 {
        if !self.stages.is_empty() && self.completed.len() == self.stages.len() {
            self.high_water = 100.0;
            return self.high_water;
        }
        let done: f64 = self.completed.iter().map(|s| self.share(*s)).sum();
        let active = self
            .active
            .map(|(s, pct)| self.share(s) * pct / 100.0)
            .unwrap_or(0.0);
        let overall = (done + active).clamp(0.0, 100.0);
        if overall > self.high_water {
            self.high_water = overall;
        }
        self.high_water
    }

    pub fn start(&mut self, stage: Stage) -> f64 {
        self.active = Some((stage, 0.0));
        self.recompute()
    }

    /// Record `percent` (0..=100) for the active stage and return the overall value.
    pub fn update(&mut self, stage: Stage, percent: f64) -> f64 {
        if !self.completed.contains(&stage) {
            let percent = percent.clamp(0.0, 100.0);
            self.active = Some((stage, percent));
        }
        self.recompute()
    }

    pub fn complete(&mut self, stage: Stage) -> f64 {
        if !self.completed.contains(&stage) {
            self.completed.push(stage);
        }
        if self.active.is_some_and(|(s, _)| s == stage) {
            self.active = None;
        }
        self.recompute()
    }

    pub fn overall(&self) -> f64 {
        self.high_water
    }
}
