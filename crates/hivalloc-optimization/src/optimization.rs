//! Optimization drivers: multi-start ASD over budget allocations, for
//! outcome minimization at a fixed budget and for money minimization
//! against outcome-reduction targets.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use argmin::core::observers::ObserverMode;
use argmin::core::{CostFunction, Executor, OptimizationResult};
use argmin_observer_slog::SlogLogger;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use hivalloc_core::{Error, Locus, ParameterSet, PopulationSet, Result, TimeGrid};
use hivalloc_engine::{ModelPars, Objectives};
use hivalloc_programs::ProgramSet;

use crate::asd::{AdaptiveStochasticDescent, AsdState};
use crate::constraints::{constraints_for, AllocationConstraints};
use crate::problem::{AllocationEvaluator, MoneyProblem, MoneyTargets, OutcomeProblem};

/// Configuration for an ASD optimization run.
#[derive(Clone, Debug)]
pub struct AsdConfig {
    /// Iteration cap per run.
    pub max_iters: u64,
    /// Wall-clock limit in seconds per run.
    pub maxtime: Option<f64>,
    /// Number of independent multi-start runs.
    pub mc: usize,
    /// Base random seed; run `s` uses `seed + s`.
    pub seed: u64,
    /// Initial step size as a fraction of the total optimizable budget.
    pub step_scale: f64,
    /// Relative perturbation of the multi-start initial points.
    pub perturbation: f64,
    /// Consecutive non-improving iterations before a stuck abort.
    pub patience: u64,
    /// Step-size floor relative to the initial step.
    pub step_floor: f64,
    /// Consecutive failed evaluations before a stuck abort.
    pub max_failures: u64,
    /// Attach a terminal logging observer to each run.
    pub verbose: bool,
    /// Cooperative cancellation; a cancelled run returns its best so far.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for AsdConfig {
    fn default() -> Self {
        AsdConfig {
            max_iters: 1000,
            maxtime: None,
            mc: 3,
            seed: 2017,
            step_scale: 0.1,
            perturbation: 0.3,
            patience: 200,
            step_floor: 1e-6,
            max_failures: 20,
            verbose: false,
            cancel: None,
        }
    }
}

impl AsdConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iters(mut self, max_iters: u64) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_maxtime(mut self, seconds: f64) -> Self {
        self.maxtime = Some(seconds);
        self
    }

    pub fn with_mc(mut self, mc: usize) -> Self {
        self.mc = mc;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

/// One multi-start run's summary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub seed: u64,
    pub objective: f64,
    pub termination: String,
}

/// Result of an outcome optimization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    /// Best full-length budget found (pinned programs included).
    pub best_allocation: Vec<f64>,
    pub best_objective: f64,
    pub baseline_objective: f64,
    /// Best-so-far objective per iteration, one trajectory per run.
    pub trajectories: Vec<Vec<f64>>,
    pub runs: Vec<RunSummary>,
    pub termination: String,
}

/// Result of a money minimization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoneyOutcome {
    pub budget: f64,
    pub allocation: Vec<f64>,
    pub baseline_budget: f64,
    pub targets_met: bool,
    /// Residual relative shortfall against the targets.
    pub gap: f64,
    pub penalty_rounds: usize,
    pub runs: Vec<RunSummary>,
}

/// Run an executor with the terminal logging observer attached.
fn run_with_logging<O, S>(
    executor: Executor<O, S, AsdState>,
) -> std::result::Result<OptimizationResult<O, S, AsdState>, argmin::core::Error>
where
    O: CostFunction<Param = Vec<f64>, Output = f64>,
    S: argmin::core::Solver<O, AsdState>,
{
    executor
        .add_observer(SlogLogger::term(), ObserverMode::Always)
        .run()
}

struct RunOutput {
    seed: u64,
    best_param: Vec<f64>,
    best_cost: f64,
    trajectory: Vec<f64>,
    termination: String,
}

/// Run `mc` independent ASD searches and collect their outputs.
fn multi_start<P>(
    problem: &P,
    constraints: &AllocationConstraints,
    start: &[f64],
    config: &AsdConfig,
) -> Result<Vec<RunOutput>>
where
    P: CostFunction<Param = Vec<f64>, Output = f64> + Clone + Send + Sync,
{
    let n = start.len();
    if n == 0 {
        return Err(Error::Infeasible {
            reason: "no optimizable programs".into(),
            locus: Locus::default(),
        });
    }
    constraints.check_feasible()?;
    let total: f64 = match constraints.total {
        Some(t) => t,
        None => start.iter().sum(),
    };
    let step = (config.step_scale * total / n as f64).max(1e-9);

    // Perturbed starting points; run 0 keeps the unperturbed start.
    let mut starts = Vec::with_capacity(config.mc.max(1));
    for s in 0..config.mc.max(1) {
        let mut point = start.to_vec();
        if s > 0 {
            let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(s as u64));
            for v in point.iter_mut() {
                let u: f64 = rng.gen();
                *v *= 1.0 + config.perturbation * (2.0 * u - 1.0);
            }
        }
        constraints.project(&mut point)?;
        starts.push((s as u64, point));
    }

    let outputs: Vec<Result<RunOutput>> = starts
        .into_par_iter()
        .map(|(s, point)| {
            let history = Arc::new(Mutex::new(Vec::new()));
            let mut solver = AdaptiveStochasticDescent::new(
                constraints.clone(),
                vec![step; n],
                config.seed.wrapping_add(1000 * s),
            )
            .with_patience(config.patience)
            .with_step_floor(step * config.step_floor)
            .with_max_failures(config.max_failures)
            .with_history(Arc::clone(&history));
            if let Some(maxtime) = config.maxtime {
                solver = solver.with_maxtime(maxtime);
            }
            if let Some(flag) = &config.cancel {
                solver = solver.with_cancel_flag(Arc::clone(flag));
            }
            let exit_reason = solver.exit_reason_handle();
            let executor = Executor::new(problem.clone(), solver)
                .configure(|state| state.param(point.clone()).max_iters(config.max_iters));
            let result = if config.verbose {
                run_with_logging(executor)
            } else {
                executor.run()
            }
            .map_err(|e| Error::Numerical {
                reason: format!("optimization run failed: {}", e),
                locus: Locus::default(),
            })?;
            let state = result.state();
            let best_param = state.best_param.clone().unwrap_or(point);
            let termination = exit_reason
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "iteration limit reached".to_string());
            let trajectory = history.lock().unwrap().clone();
            Ok(RunOutput {
                seed: s,
                best_param,
                best_cost: state.best_cost,
                trajectory,
                termination,
            })
        })
        .collect();
    outputs.into_iter().collect()
}

/// Pick the best run: smallest objective, ties broken by lexicographically
/// smallest allocation.
fn select_best(outputs: &[RunOutput]) -> usize {
    let mut best = 0;
    for (i, run) in outputs.iter().enumerate().skip(1) {
        let current = &outputs[best];
        if run.best_cost < current.best_cost
            || (run.best_cost == current.best_cost
                && run.best_param.as_slice() < current.best_param.as_slice())
        {
            best = i;
        }
    }
    best
}

/// Outcome minimization: search allocations at a fixed total budget to
/// minimize the weighted epidemiological objective.
pub fn optimize_outcomes(
    popset: &PopulationSet,
    parset: &ParameterSet,
    progset: &ProgramSet,
    grid: &TimeGrid,
    objectives: &Objectives,
    constraints: Option<AllocationConstraints>,
    config: &AsdConfig,
) -> Result<OptimizationOutcome> {
    let base_pars = ModelPars::from_parset(parset, popset, grid)?;
    let start_index = grid.index_of(objectives.start).ok_or(Error::NoData {
        locus: Locus::default().with_year(objectives.start),
    })?;

    let full_budget = progset.default_budget();
    let (default_constraints, optimizable) = constraints_for(progset, None);
    let start_sub: Vec<f64> = optimizable
        .iter()
        .map(|&i| full_budget[i] * objectives.budgetscale)
        .collect();
    let total: f64 = start_sub.iter().sum();
    let mut constraints = constraints.unwrap_or(default_constraints);
    if constraints.total.is_none() {
        constraints.total = Some(total);
    }

    let eval = AllocationEvaluator {
        popset: popset.clone(),
        progset: progset.clone(),
        popsizes: base_pars.popsize.clone(),
        tvec: grid.tvec(),
        start_index,
        full_budget,
        optimizable,
        base_pars,
    };

    // Baseline run for normalization and for the reported baseline.
    let mut baseline_sub = start_sub.clone();
    constraints.project(&mut baseline_sub)?;
    let baseline_results = eval.run(&baseline_sub)?;
    let normalizations = objectives.normalizations(&baseline_results)?;
    let baseline_objective =
        objectives.outcome_objective(&baseline_results, Some(&normalizations))?;

    let problem = OutcomeProblem {
        eval: eval.clone(),
        objectives: objectives.clone(),
        normalizations,
    };
    let outputs = multi_start(&problem, &constraints, &baseline_sub, config)?;
    let best = select_best(&outputs);

    Ok(OptimizationOutcome {
        best_allocation: eval.embed(&outputs[best].best_param),
        best_objective: outputs[best].best_cost,
        baseline_objective,
        trajectories: outputs.iter().map(|o| o.trajectory.clone()).collect(),
        runs: outputs
            .iter()
            .map(|o| RunSummary {
                seed: o.seed,
                objective: o.best_cost,
                termination: o.termination.clone(),
            })
            .collect(),
        termination: outputs[best].termination.clone(),
    })
}

/// Relative tolerance on the reduction targets.
const MONEY_GAP_TOLERANCE: f64 = 1e-3;

/// Money minimization: find the smallest budget meeting the declared
/// incidence/death reduction targets, escalating the penalty until the
/// optimum is feasible.
pub fn minimize_money(
    popset: &PopulationSet,
    parset: &ParameterSet,
    progset: &ProgramSet,
    grid: &TimeGrid,
    objectives: &Objectives,
    config: &AsdConfig,
) -> Result<MoneyOutcome> {
    if objectives.incifrac.is_none() && objectives.deathfrac.is_none() {
        return Err(Error::Infeasible {
            reason: "money minimization requires at least one reduction target".into(),
            locus: Locus::default(),
        });
    }
    let base_pars = ModelPars::from_parset(parset, popset, grid)?;
    let start_index = grid.index_of(objectives.start).ok_or(Error::NoData {
        locus: Locus::default().with_year(objectives.start),
    })?;

    let full_budget = progset.default_budget();
    let (mut constraints, optimizable) = constraints_for(progset, None);
    constraints.total = None;
    let start_sub: Vec<f64> = optimizable.iter().map(|&i| full_budget[i]).collect();
    let baseline_budget: f64 = start_sub.iter().sum();

    let eval = AllocationEvaluator {
        popset: popset.clone(),
        progset: progset.clone(),
        popsizes: base_pars.popsize.clone(),
        tvec: grid.tvec(),
        start_index,
        full_budget,
        optimizable,
        base_pars,
    };

    let baseline_results = eval.run(&start_sub)?;
    let targets = MoneyTargets {
        baseline_inci: baseline_results.at(&baseline_results.inci, objectives.end)?,
        baseline_death: baseline_results.at(&baseline_results.death, objectives.end)?,
        incifrac: objectives.incifrac,
        deathfrac: objectives.deathfrac,
    };

    // Seed the starting scale from the baseline shortfall: a budget short
    // of its targets starts proportionally larger.
    let baseline_gap = targets.gap(&baseline_results, objectives)?;
    let mut start = start_sub.clone();
    if baseline_gap > 0.0 {
        let scale = 1.0 + baseline_gap;
        for v in start.iter_mut() {
            *v *= scale;
        }
    }

    let mut penalty = baseline_budget.max(1.0);
    let mut rounds = 0;
    let mut all_runs = Vec::new();
    let mut best: Option<(Vec<f64>, f64, f64)> = None; // (sub, budget, gap)

    for round in 0..8 {
        rounds = round + 1;
        let problem = MoneyProblem {
            eval: eval.clone(),
            objectives: objectives.clone(),
            targets,
            penalty,
        };
        let round_config = AsdConfig {
            seed: config.seed.wrapping_add(round as u64 * 7919),
            ..config.clone()
        };
        let outputs = multi_start(&problem, &constraints, &start, &round_config)?;
        let idx = select_best(&outputs);
        let winner = &outputs[idx];
        let results = eval.run(&winner.best_param)?;
        let gap = targets.gap(&results, objectives)?;
        let budget: f64 = eval.embed(&winner.best_param).iter().sum();
        all_runs.extend(outputs.iter().map(|o| RunSummary {
            seed: o.seed,
            objective: o.best_cost,
            termination: o.termination.clone(),
        }));
        let better = match &best {
            None => true,
            Some((_, best_budget, best_gap)) => {
                (gap <= MONEY_GAP_TOLERANCE && budget < *best_budget)
                    || (*best_gap > MONEY_GAP_TOLERANCE && gap < *best_gap)
            }
        };
        if better {
            best = Some((winner.best_param.clone(), budget, gap));
        }
        if gap <= MONEY_GAP_TOLERANCE {
            break;
        }
        start = winner.best_param.clone();
        penalty *= 2.0;
    }

    let (sub, budget, gap) = best.ok_or(Error::Infeasible {
        reason: "money minimization found no candidate".into(),
        locus: Locus::default(),
    })?;
    Ok(MoneyOutcome {
        budget,
        allocation: eval.embed(&sub),
        baseline_budget,
        targets_met: gap <= MONEY_GAP_TOLERANCE,
        gap,
        penalty_rounds: rounds,
        runs: all_runs,
    })
}
