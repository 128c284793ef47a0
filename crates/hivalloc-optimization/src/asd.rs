//! Adaptive stochastic descent as an argmin solver.
//!
//! A derivative-free local search over the allocation vector: each
//! iteration samples one coordinate and direction from adaptive
//! probabilities, steps by that coordinate's adaptive step size, projects
//! back onto the constrained budget simplex, and accepts only
//! improvements. Step sizes and direction probabilities grow on acceptance
//! and shrink on rejection.
//!
//! Failing objective evaluations score `+inf` and count toward a stuck
//! abort; a wall-clock deadline and a cooperative cancel flag are checked
//! between evaluations, and a cancelled run keeps the best point found.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use argmin::core::{
    CostFunction, Error as ArgminError, IterState, Problem, Solver, State, TerminationReason,
    TerminationStatus, KV,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::constraints::AllocationConstraints;

/// The argmin state type driven by this solver.
pub type AsdState = IterState<Vec<f64>, (), (), (), (), f64>;

/// Why a run stopped, beyond argmin's own iteration bookkeeping.
pub type ExitReason = Arc<Mutex<Option<String>>>;

#[derive(Clone)]
pub struct AdaptiveStochasticDescent {
    constraints: AllocationConstraints,
    rng: ChaCha8Rng,
    stepsizes: Vec<f64>,
    /// Per-direction selection weights: `+e_i` for i < n, `-e_i` after.
    probabilities: Vec<f64>,
    step_grow: f64,
    step_shrink: f64,
    prob_grow: f64,
    prob_shrink: f64,
    step_floor: f64,
    /// Consecutive non-improving iterations tolerated before aborting.
    patience: u64,
    stale: u64,
    /// Consecutive failed (non-finite) evaluations tolerated.
    max_failures: u64,
    failures: u64,
    maxtime: Option<f64>,
    started: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
    /// Running best objective per iteration, shared with the driver.
    history: Option<Arc<Mutex<Vec<f64>>>>,
    exit_reason: ExitReason,
}

impl AdaptiveStochasticDescent {
    pub fn new(constraints: AllocationConstraints, initial_steps: Vec<f64>, seed: u64) -> Self {
        let n = initial_steps.len();
        AdaptiveStochasticDescent {
            constraints,
            rng: ChaCha8Rng::seed_from_u64(seed),
            stepsizes: initial_steps,
            probabilities: vec![1.0 / (2 * n.max(1)) as f64; 2 * n],
            step_grow: 2.0,
            step_shrink: 0.5,
            prob_grow: 2.0,
            prob_shrink: 0.5,
            step_floor: 1e-3,
            patience: 200,
            stale: 0,
            max_failures: 20,
            failures: 0,
            maxtime: None,
            started: None,
            cancel: None,
            history: None,
            exit_reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_maxtime(mut self, seconds: f64) -> Self {
        self.maxtime = Some(seconds);
        self
    }

    pub fn with_patience(mut self, patience: u64) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_step_floor(mut self, floor: f64) -> Self {
        self.step_floor = floor;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u64) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_history(mut self, history: Arc<Mutex<Vec<f64>>>) -> Self {
        self.history = Some(history);
        self
    }

    /// Handle to the recorded stop reason.
    pub fn exit_reason_handle(&self) -> ExitReason {
        Arc::clone(&self.exit_reason)
    }

    fn record_exit(&self, reason: &str) {
        let mut slot = self.exit_reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    fn sample_direction(&mut self) -> usize {
        let total: f64 = self.probabilities.iter().sum();
        let mut r = self.rng.gen::<f64>() * total;
        for (i, p) in self.probabilities.iter().enumerate() {
            r -= p;
            if r <= 0.0 {
                return i;
            }
        }
        self.probabilities.len() - 1
    }

    fn renormalize(&mut self) {
        let total: f64 = self.probabilities.iter().sum();
        if total > 0.0 {
            for p in self.probabilities.iter_mut() {
                *p /= total;
            }
        }
    }
}

impl<O> Solver<O, AsdState> for AdaptiveStochasticDescent
where
    O: CostFunction<Param = Vec<f64>, Output = f64>,
{
    const NAME: &'static str = "Adaptive stochastic descent";

    fn init(
        &mut self,
        problem: &mut Problem<O>,
        mut state: AsdState,
    ) -> Result<(AsdState, Option<KV>), ArgminError> {
        self.started = Some(Instant::now());
        let mut param = state
            .take_param()
            .ok_or_else(|| ArgminError::msg("initial allocation missing"))?;
        if param.len() != self.stepsizes.len() {
            return Err(ArgminError::msg(format!(
                "allocation length {} does not match {} step sizes",
                param.len(),
                self.stepsizes.len()
            )));
        }
        self.constraints
            .project(&mut param)
            .map_err(|e| ArgminError::msg(e.to_string()))?;
        let cost = problem.cost(&param).unwrap_or(f64::INFINITY);
        if let Some(history) = &self.history {
            history.lock().unwrap().push(cost);
        }
        Ok((state.param(param).cost(cost), None))
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<O>,
        mut state: AsdState,
    ) -> Result<(AsdState, Option<KV>), ArgminError> {
        let param = state
            .take_param()
            .ok_or_else(|| ArgminError::msg("allocation missing from state"))?;
        let cost = state.get_cost();
        let n = self.stepsizes.len();

        let direction = self.sample_direction();
        let coord = direction % n;
        let sign = if direction < n { 1.0 } else { -1.0 };

        let mut candidate = param.clone();
        candidate[coord] += sign * self.stepsizes[coord];
        let feasible = self.constraints.project(&mut candidate).is_ok();
        let newcost = if feasible {
            problem.cost(&candidate).unwrap_or(f64::INFINITY)
        } else {
            f64::INFINITY
        };
        if newcost.is_finite() {
            self.failures = 0;
        } else {
            self.failures += 1;
        }

        let (next_param, next_cost) = if newcost < cost {
            self.stepsizes[coord] *= self.step_grow;
            self.probabilities[direction] *= self.prob_grow;
            self.stale = 0;
            (candidate, newcost)
        } else {
            self.stepsizes[coord] *= self.step_shrink;
            self.probabilities[direction] *= self.prob_shrink;
            self.stale += 1;
            (param, cost)
        };
        self.renormalize();

        if let Some(history) = &self.history {
            let best = state.get_best_cost().min(next_cost);
            history.lock().unwrap().push(best);
        }
        Ok((state.param(next_param).cost(next_cost), None))
    }

    fn terminate(&mut self, _state: &AsdState) -> TerminationStatus {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                self.record_exit("cancelled");
                return TerminationStatus::Terminated(TerminationReason::SolverConverged);
            }
        }
        if let (Some(started), Some(maxtime)) = (self.started, self.maxtime) {
            if started.elapsed().as_secs_f64() >= maxtime {
                self.record_exit("wall-clock limit reached");
                return TerminationStatus::Terminated(TerminationReason::SolverConverged);
            }
        }
        if self.failures >= self.max_failures {
            self.record_exit("stuck: consecutive failed evaluations");
            return TerminationStatus::Terminated(TerminationReason::SolverConverged);
        }
        if self.stale >= self.patience {
            self.record_exit("stuck: no improvement within patience");
            return TerminationStatus::Terminated(TerminationReason::SolverConverged);
        }
        let max_step = self.stepsizes.iter().cloned().fold(0.0, f64::max);
        if max_step < self.step_floor {
            self.record_exit("step sizes below floor");
            return TerminationStatus::Terminated(TerminationReason::SolverConverged);
        }
        TerminationStatus::NotTerminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argmin::core::Executor;

    /// A smooth convex test objective with the optimum inside the simplex.
    struct Quadratic {
        target: Vec<f64>,
    }

    impl CostFunction for Quadratic {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, p: &Self::Param) -> Result<Self::Output, ArgminError> {
            Ok(p.iter()
                .zip(&self.target)
                .map(|(a, b)| (a - b) * (a - b))
                .sum())
        }
    }

    #[test]
    fn test_improves_quadratic_on_simplex() {
        let constraints = AllocationConstraints::fixed_total(3, 300.0);
        let problem = Quadratic {
            target: vec![200.0, 50.0, 50.0],
        };
        let history = Arc::new(Mutex::new(Vec::new()));
        let solver = AdaptiveStochasticDescent::new(constraints, vec![30.0; 3], 7)
            .with_history(Arc::clone(&history));
        let result = Executor::new(problem, solver)
            .configure(|state| state.param(vec![100.0, 100.0, 100.0]).max_iters(500))
            .run()
            .unwrap();
        let state = result.state();
        let best = state.best_param.clone().unwrap();
        let sum: f64 = best.iter().sum();
        assert!((sum - 300.0).abs() < 1e-6);
        assert!(state.best_cost < 1000.0, "best cost {}", state.best_cost);
        // Monotone non-increasing best-cost trajectory.
        let history = history.lock().unwrap();
        for pair in history.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12);
        }
    }

    #[test]
    fn test_failing_evaluations_abort_stuck() {
        struct AlwaysFails;
        impl CostFunction for AlwaysFails {
            type Param = Vec<f64>;
            type Output = f64;
            fn cost(&self, _p: &Self::Param) -> Result<Self::Output, ArgminError> {
                Err(ArgminError::msg("boom"))
            }
        }
        let constraints = AllocationConstraints::fixed_total(2, 100.0);
        let solver = AdaptiveStochasticDescent::new(constraints, vec![10.0; 2], 1)
            .with_max_failures(5);
        let reason = solver.exit_reason_handle();
        let result = Executor::new(AlwaysFails, solver)
            .configure(|state| state.param(vec![50.0, 50.0]).max_iters(1000))
            .run()
            .unwrap();
        assert!(result.state().iter < 1000);
        let reason = reason.lock().unwrap().clone().unwrap();
        assert!(reason.contains("stuck"));
    }

    #[test]
    fn test_cancel_flag_stops_run() {
        let constraints = AllocationConstraints::fixed_total(2, 100.0);
        let flag = Arc::new(AtomicBool::new(true));
        let solver = AdaptiveStochasticDescent::new(constraints, vec![10.0; 2], 1)
            .with_cancel_flag(Arc::clone(&flag));
        let reason = solver.exit_reason_handle();
        let problem = Quadratic {
            target: vec![60.0, 40.0],
        };
        let result = Executor::new(problem, solver)
            .configure(|state| state.param(vec![50.0, 50.0]).max_iters(1000))
            .run()
            .unwrap();
        // The pre-set flag stops the run immediately, keeping the best
        // point found so far (the projected start).
        assert!(result.state().iter <= 1);
        assert_eq!(reason.lock().unwrap().clone().unwrap(), "cancelled");
    }

    #[test]
    fn test_seeded_runs_reproduce() {
        let run = || {
            let constraints = AllocationConstraints::fixed_total(3, 300.0);
            let problem = Quadratic {
                target: vec![150.0, 100.0, 50.0],
            };
            let solver =
                AdaptiveStochasticDescent::new(constraints, vec![20.0; 3], 42);
            let result = Executor::new(problem, solver)
                .configure(|state| state.param(vec![100.0, 100.0, 100.0]).max_iters(200))
                .run()
                .unwrap();
            (
                result.state().best_param.clone().unwrap(),
                result.state().best_cost,
            )
        };
        let (a_param, a_cost) = run();
        let (b_param, b_cost) = run();
        assert_eq!(a_param, b_param);
        assert_eq!(a_cost, b_cost);
    }
}
