//! The allocation problems evaluated by the solver: budget -> overlay ->
//! model parameters -> simulation -> scalar objective.

use argmin::core::{CostFunction, Error as ArgminError};
use ndarray::Array2;

use hivalloc_core::{PopulationSet, Result};
use hivalloc_engine::{ModelPars, Objectives, Results, Simulator};
use hivalloc_programs::ProgramSet;

/// Shared evaluation plumbing: embeds the optimizable sub-vector into the
/// full budget and runs the simulation pipeline for it.
#[derive(Clone)]
pub struct AllocationEvaluator {
    pub popset: PopulationSet,
    pub progset: ProgramSet,
    /// Baseline model parameters; cloned per evaluation.
    pub base_pars: ModelPars,
    /// Baseline population sizes, the coverage denominators.
    pub popsizes: Array2<f64>,
    pub tvec: Vec<f64>,
    /// Grid index at which program funding takes effect.
    pub start_index: usize,
    /// Full-length budget template carrying the pinned programs.
    pub full_budget: Vec<f64>,
    /// Indices of optimizable programs within the full budget.
    pub optimizable: Vec<usize>,
}

impl AllocationEvaluator {
    /// Expand the optimizable sub-vector to the full budget.
    pub fn embed(&self, sub: &[f64]) -> Vec<f64> {
        let mut full = self.full_budget.clone();
        for (slot, value) in self.optimizable.iter().zip(sub) {
            full[*slot] = *value;
        }
        full
    }

    /// Run the full pipeline for an optimizable sub-vector.
    pub fn run(&self, sub: &[f64]) -> Result<Results> {
        let full = self.embed(sub);
        let overlay = self.progset.outcomes(
            &full,
            &self.tvec,
            self.start_index,
            &self.popsizes,
            &self.popset,
        )?;
        let mut pars = self.base_pars.clone();
        pars.apply_overlay(&overlay)?;
        let consts = pars.consts;
        let sim = Simulator::new(pars, &self.popset)?.run()?;
        Ok(Results::from_sim(&sim, &consts))
    }
}

/// Outcome minimization at a fixed total budget.
#[derive(Clone)]
pub struct OutcomeProblem {
    pub eval: AllocationEvaluator,
    pub objectives: Objectives,
    /// Per-outcome normalizations from the baseline run.
    pub normalizations: [f64; 3],
}

impl CostFunction for OutcomeProblem {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, sub: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        let results = self.eval.run(sub).map_err(|e| ArgminError::msg(e.to_string()))?;
        self.objectives
            .outcome_objective(&results, Some(&self.normalizations))
            .map_err(|e| ArgminError::msg(e.to_string()))
    }
}

/// Reduction targets for money minimization, relative to baseline values
/// at the objectives' end year.
#[derive(Clone, Copy, Debug)]
pub struct MoneyTargets {
    pub baseline_inci: f64,
    pub baseline_death: f64,
    pub incifrac: Option<f64>,
    pub deathfrac: Option<f64>,
}

impl MoneyTargets {
    /// Total relative shortfall against the active targets; zero when all
    /// targets are met.
    pub fn gap(&self, results: &Results, objectives: &Objectives) -> Result<f64> {
        let mut gap = 0.0;
        if let Some(incifrac) = self.incifrac {
            let actual = results.at(&results.inci, objectives.end)?;
            let target = (1.0 - incifrac) * self.baseline_inci;
            if actual > target {
                gap += (actual - target) / target.max(1e-9);
            }
        }
        if let Some(deathfrac) = self.deathfrac {
            let actual = results.at(&results.death, objectives.end)?;
            let target = (1.0 - deathfrac) * self.baseline_death;
            if actual > target {
                gap += (actual - target) / target.max(1e-9);
            }
        }
        Ok(gap)
    }
}

/// Money minimization: the total spend plus a penalty for missed targets.
/// The driver escalates `penalty` until the optimum meets the targets.
#[derive(Clone)]
pub struct MoneyProblem {
    pub eval: AllocationEvaluator,
    pub objectives: Objectives,
    pub targets: MoneyTargets,
    pub penalty: f64,
}

impl CostFunction for MoneyProblem {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, sub: &Self::Param) -> std::result::Result<Self::Output, ArgminError> {
        let total: f64 = self.eval.embed(sub).iter().sum();
        let results = self.eval.run(sub).map_err(|e| ArgminError::msg(e.to_string()))?;
        let gap = self
            .targets
            .gap(&results, &self.objectives)
            .map_err(|e| ArgminError::msg(e.to_string()))?;
        Ok(total + self.penalty * gap)
    }
}
