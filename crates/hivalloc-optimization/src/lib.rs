//! Budget-allocation optimization for hivalloc: adaptive stochastic
//! descent over the constrained allocation simplex, with multi-start and
//! money-minimization drivers.

pub mod asd;
pub mod constraints;
pub mod optimization;
pub mod problem;

pub use asd::AdaptiveStochasticDescent;
pub use constraints::{constraints_for, AllocationConstraints};
pub use optimization::{
    minimize_money, optimize_outcomes, AsdConfig, MoneyOutcome, OptimizationOutcome, RunSummary,
};
pub use problem::{AllocationEvaluator, MoneyProblem, MoneyTargets, OutcomeProblem};
