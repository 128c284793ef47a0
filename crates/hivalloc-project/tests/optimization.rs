//! End-to-end optimization scenarios on the example project.

use hivalloc_core::TimeGrid;
use hivalloc_engine::{ObjectiveKind, Objectives};
use hivalloc_optimization::{minimize_money, optimize_outcomes, AsdConfig};
use hivalloc_project::demo::{demo_project, PARSET_NAME, PROGSET_NAME};

fn outcome_objectives() -> Objectives {
    Objectives {
        which: ObjectiveKind::Outcomes,
        start: 2015.0,
        end: 2020.0,
        until: 2030.0,
        ..Objectives::default()
    }
}

#[test]
fn outcome_optimization_beats_baseline() {
    let project = demo_project().unwrap();
    let parset = &project.parset_named(PARSET_NAME).unwrap().item;
    let progset = &project.progset_named(PROGSET_NAME).unwrap().item;
    let grid = TimeGrid::new(2000.0, 2030.0, 0.2);
    let config = AsdConfig::new()
        .with_max_iters(250)
        .with_mc(3)
        .with_seed(11);

    let outcome = optimize_outcomes(
        &project.populations,
        parset,
        progset,
        &grid,
        &outcome_objectives(),
        None,
        &config,
    )
    .unwrap();

    // Strict improvement over the default allocation under a fixed seed.
    assert!(
        outcome.best_objective < outcome.baseline_objective,
        "best {} vs baseline {}",
        outcome.best_objective,
        outcome.baseline_objective
    );

    // The total optimizable budget is conserved by the projection.
    let flags = progset.optimizable_flags();
    let default_budget = progset.default_budget();
    let total_default: f64 = default_budget
        .iter()
        .zip(&flags)
        .filter(|(_, f)| **f)
        .map(|(v, _)| v)
        .sum();
    let total_best: f64 = outcome
        .best_allocation
        .iter()
        .zip(&flags)
        .filter(|(_, f)| **f)
        .map(|(v, _)| v)
        .sum();
    assert!((total_best - total_default).abs() / total_default < 1e-5);

    // Pinned overhead spending is untouched.
    for (i, f) in flags.iter().enumerate() {
        if !f {
            assert_eq!(outcome.best_allocation[i], default_budget[i]);
        }
    }

    // Non-negative allocation throughout.
    for v in &outcome.best_allocation {
        assert!(*v >= 0.0);
    }
}

#[test]
fn best_objective_trajectories_never_worsen() {
    let project = demo_project().unwrap();
    let parset = &project.parset_named(PARSET_NAME).unwrap().item;
    let progset = &project.progset_named(PROGSET_NAME).unwrap().item;
    let grid = TimeGrid::new(2000.0, 2030.0, 0.2);
    let config = AsdConfig::new().with_max_iters(120).with_mc(2).with_seed(3);

    let outcome = optimize_outcomes(
        &project.populations,
        parset,
        progset,
        &grid,
        &outcome_objectives(),
        None,
        &config,
    )
    .unwrap();

    for trajectory in &outcome.trajectories {
        for pair in trajectory.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12);
        }
    }
}

#[test]
fn multistart_best_is_at_least_single_runs() {
    let project = demo_project().unwrap();
    let parset = &project.parset_named(PARSET_NAME).unwrap().item;
    let progset = &project.progset_named(PROGSET_NAME).unwrap().item;
    let grid = TimeGrid::new(2000.0, 2030.0, 0.2);
    let config = AsdConfig::new().with_max_iters(120).with_mc(3).with_seed(5);

    let outcome = optimize_outcomes(
        &project.populations,
        parset,
        progset,
        &grid,
        &outcome_objectives(),
        None,
        &config,
    )
    .unwrap();

    for run in &outcome.runs {
        assert!(outcome.best_objective <= run.objective);
    }
}

#[test]
fn money_minimization_meets_targets() {
    let project = demo_project().unwrap();
    let parset = &project.parset_named(PARSET_NAME).unwrap().item;
    let progset = &project.progset_named(PROGSET_NAME).unwrap().item;
    let grid = TimeGrid::new(2000.0, 2030.0, 0.2);
    let objectives = Objectives {
        which: ObjectiveKind::Money,
        start: 2015.0,
        end: 2020.0,
        until: 2030.0,
        deathfrac: Some(0.1),
        incifrac: Some(0.2),
        ..Objectives::default()
    };
    let config = AsdConfig::new().with_max_iters(200).with_mc(2).with_seed(17);

    let outcome = minimize_money(
        &project.populations,
        parset,
        progset,
        &grid,
        &objectives,
        &config,
    )
    .unwrap();

    assert!(
        outcome.targets_met,
        "targets unmet, residual gap {}",
        outcome.gap
    );
    assert!(outcome.gap <= 1.1e-3);
    assert!(outcome.budget > 0.0);
    // The found budget stays within a sane multiple of the baseline.
    assert!(
        outcome.budget < 20.0 * outcome.baseline_budget,
        "budget blew up: {} vs baseline {}",
        outcome.budget,
        outcome.baseline_budget
    );
    for v in &outcome.allocation {
        assert!(*v >= 0.0);
    }
}

#[test]
fn stored_optimization_in_project_api() {
    let mut project = demo_project().unwrap();
    project.dt = 0.2;
    let id = project
        .optimize(
            "default",
            &outcome_objectives(),
            None,
            "asd",
            Some(5.0),
            2,
            PARSET_NAME,
            PROGSET_NAME,
        )
        .unwrap();
    let stored = project.optims().iter().find(|s| s.id == id).unwrap();
    assert_eq!(stored.item.name, "default");
    assert!(stored.item.result.is_some());
}
