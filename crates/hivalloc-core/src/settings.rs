//! The simulation time grid and the disease-stage enumerations.

use serde::{Deserialize, Serialize};

/// Default timestep in years.
pub const DEFAULT_DT: f64 = 0.1;

/// Uniform time grid `[start, start+dt, ..., end]`.
///
/// All parameter series and state trajectories are indexed on this grid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeGrid {
    pub start: f64,
    pub end: f64,
    pub dt: f64,
}

impl TimeGrid {
    pub fn new(start: f64, end: f64, dt: f64) -> Self {
        TimeGrid { start, end, dt }
    }

    pub fn with_default_dt(start: f64, end: f64) -> Self {
        TimeGrid::new(start, end, DEFAULT_DT)
    }

    /// Number of grid points, inclusive of both endpoints.
    pub fn npts(&self) -> usize {
        ((self.end - self.start) / self.dt + 1e-9).floor() as usize + 1
    }

    /// Materialize the grid as a vector of years.
    pub fn tvec(&self) -> Vec<f64> {
        (0..self.npts()).map(|i| self.start + i as f64 * self.dt).collect()
    }

    /// Index of the grid point nearest to `year`, if it lies on the grid.
    pub fn index_of(&self, year: f64) -> Option<usize> {
        let idx = ((year - self.start) / self.dt).round();
        if idx < 0.0 || idx as usize >= self.npts() {
            None
        } else {
            Some(idx as usize)
        }
    }
}

/// CD4-defined disease stages, in progression order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cd4Stage {
    #[serde(rename = "acute")]
    Acute,
    #[serde(rename = "gt500")]
    Gt500,
    #[serde(rename = "gt350")]
    Gt350,
    #[serde(rename = "gt200")]
    Gt200,
    #[serde(rename = "gt50")]
    Gt50,
    #[serde(rename = "lt50")]
    Lt50,
}

/// Number of CD4 stages.
pub const NCD4: usize = 6;

impl Cd4Stage {
    pub const ALL: [Cd4Stage; NCD4] = [
        Cd4Stage::Acute,
        Cd4Stage::Gt500,
        Cd4Stage::Gt350,
        Cd4Stage::Gt200,
        Cd4Stage::Gt50,
        Cd4Stage::Lt50,
    ];

    pub fn index(self) -> usize {
        match self {
            Cd4Stage::Acute => 0,
            Cd4Stage::Gt500 => 1,
            Cd4Stage::Gt350 => 2,
            Cd4Stage::Gt200 => 3,
            Cd4Stage::Gt50 => 4,
            Cd4Stage::Lt50 => 5,
        }
    }
}

/// Map a CD4-count treatment-eligibility threshold to the first eligible
/// stage index. Everyone below the returned stage index is ineligible.
pub fn eligible_from_stage(cd4_threshold: f64) -> usize {
    if cd4_threshold > 500.0 {
        0
    } else if cd4_threshold > 350.0 {
        2
    } else if cd4_threshold > 200.0 {
        3
    } else if cd4_threshold > 50.0 {
        4
    } else {
        5
    }
}
