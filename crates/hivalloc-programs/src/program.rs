//! Program definitions: target parameters, cost-coverage data, and
//! coverage-outcome curves per effect.

use serde::{Deserialize, Serialize};

use hivalloc_core::{InputKey, PopulationSet};

use crate::costcov::CostCov;
use crate::covout::CovOut;

/// The population an effect applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PopTarget {
    /// All populations the program targets.
    All,
    /// One specific population by short name.
    Pop(String),
}

/// One program effect: a target parameter in a target population.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    pub param: InputKey,
    pub pop: PopTarget,
}

impl Effect {
    pub fn new(param: InputKey, pop: PopTarget) -> Self {
        Effect { param, pop }
    }
}

/// A historical cost/coverage point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostCovDatum {
    pub t: f64,
    pub cost: f64,
    /// People covered.
    pub coverage: f64,
    /// Target population size at the time, if reported.
    pub popsize: Option<f64>,
}

/// A single program (modality).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub short: String,
    pub name: String,
    /// Short names of the populations the program targets; empty means the
    /// whole population.
    pub targetpops: Vec<String>,
    /// Target parameters, parallel to `ccopars`.
    pub effects: Vec<Effect>,
    /// Historical cost/coverage points.
    pub ccdata: Vec<CostCovDatum>,
    /// Fitted cost-coverage curve.
    pub ccpars: CostCov,
    /// Coverage-outcome curve per effect.
    pub ccopars: Vec<CovOut>,
    /// Non-HIV DALYs averted per covered person-year.
    pub nonhiv_dalys: f64,
    /// Modality-level reach fraction of the target population, in (0, 1].
    pub reach: f64,
    /// Latest reported spend; used as the default budget entry and to pin
    /// non-optimizable programs.
    pub basespend: f64,
}

impl Program {
    pub fn new(short: impl Into<String>, name: impl Into<String>) -> Self {
        Program {
            short: short.into(),
            name: name.into(),
            targetpops: Vec::new(),
            effects: Vec::new(),
            ccdata: Vec::new(),
            ccpars: CostCov::new(Vec::new()),
            ccopars: Vec::new(),
            nonhiv_dalys: 0.0,
            reach: 1.0,
            basespend: 0.0,
        }
    }

    /// A program is optimizable iff it has at least one cost-coverage
    /// datum and at least one effect.
    pub fn is_optimizable(&self) -> bool {
        !self.ccdata.is_empty() && !self.effects.is_empty()
    }

    /// Latest reported spend from the cost-coverage data, falling back to
    /// the declared base spend.
    pub fn latest_spend(&self) -> f64 {
        self.ccdata
            .iter()
            .filter(|d| d.cost.is_finite() && d.cost > 0.0)
            .last()
            .map(|d| d.cost)
            .unwrap_or(self.basespend)
    }

    /// Indices of the populations this program targets; all populations
    /// when no target populations are declared.
    pub fn target_indices(&self, popset: &PopulationSet) -> Vec<usize> {
        if self.targetpops.is_empty() {
            (0..popset.len()).collect()
        } else {
            self.targetpops
                .iter()
                .filter_map(|short| popset.index_of(short))
                .collect()
        }
    }

    /// Fit the cost-coverage curve from the stored data points.
    pub fn fit_costcov(&mut self, saturation: f64, default_popsize: f64) {
        let points: Vec<(f64, f64, f64)> = self
            .ccdata
            .iter()
            .map(|d| (d.t, d.cost, d.coverage))
            .collect();
        let popsize = self
            .ccdata
            .iter()
            .filter_map(|d| d.popsize)
            .last()
            .unwrap_or(default_popsize);
        self.ccpars = CostCov::fit(&self.short, saturation, &points, popsize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivalloc_core::Population;

    #[test]
    fn test_optimizable_requires_data_and_effects() {
        let mut prog = Program::new("HTC", "HIV testing and counseling");
        assert!(!prog.is_optimizable());
        prog.ccdata.push(CostCovDatum {
            t: 2014.0,
            cost: 4e5,
            coverage: 3e4,
            popsize: None,
        });
        assert!(!prog.is_optimizable());
        prog.effects
            .push(Effect::new(InputKey::new("hivtest"), PopTarget::All));
        assert!(prog.is_optimizable());
    }

    #[test]
    fn test_target_indices_default_to_all() {
        let pops = PopulationSet::new(vec![
            Population::new("FSW", "Female sex workers").female().sexworker(),
            Population::new("MSM", "Men who have sex with men").male(),
        ])
        .unwrap();
        let mut prog = Program::new("HTC", "HIV testing and counseling");
        assert_eq!(prog.target_indices(&pops), vec![0, 1]);
        prog.targetpops = vec!["MSM".to_string()];
        assert_eq!(prog.target_indices(&pops), vec![1]);
    }
}
