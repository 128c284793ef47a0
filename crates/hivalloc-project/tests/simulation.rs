//! End-to-end simulation properties on the example project.

use hivalloc_core::TimeGrid;
use hivalloc_project::demo::{demo_project, PARSET_NAME, PROGSET_NAME};

#[test]
fn deterministic_simulation() {
    let mut a = demo_project().unwrap();
    let mut b = demo_project().unwrap();
    let id_a = a.simulate(PARSET_NAME, None, None, 2000.0, 2030.0).unwrap();
    let id_b = b.simulate(PARSET_NAME, None, None, 2000.0, 2030.0).unwrap();
    let ra = &a.results().iter().find(|s| s.id == id_a).unwrap().item.results;
    let rb = &b.results().iter().find(|s| s.id == id_b).unwrap().item.results;
    // Bit-for-bit identical trajectories across processes and runs.
    assert_eq!(ra, rb);

    let idx_2015 = ((2015.0 - 2000.0) / 0.1_f64).round() as usize;
    let prev_2015 = ra.prev.tot[idx_2015];
    assert!(
        prev_2015 > 0.005 && prev_2015 < 0.25,
        "implausible 2015 prevalence {}",
        prev_2015
    );
}

#[test]
fn trajectories_stay_nonnegative_and_bounded() {
    let mut project = demo_project().unwrap();
    let id = project
        .simulate(PARSET_NAME, Some(PROGSET_NAME), None, 2000.0, 2030.0)
        .unwrap();
    let results = &project.results().iter().find(|s| s.id == id).unwrap().item.results;
    for row in &results.inci.pops {
        for v in row {
            assert!(*v >= 0.0 && v.is_finite());
        }
    }
    for v in &results.prev.tot {
        assert!(*v >= 0.0 && *v <= 1.0);
    }
    for v in &results.daly.tot {
        assert!(*v >= 0.0 && v.is_finite());
    }
}

#[test]
fn zero_budget_equals_baseline() {
    let mut project = demo_project().unwrap();
    let nprogs = project.progsets()[0].item.len();
    let zeros = vec![0.0; nprogs];
    let baseline = project
        .simulate(PARSET_NAME, None, None, 2000.0, 2025.0)
        .unwrap();
    let unfunded = project
        .simulate(PARSET_NAME, Some(PROGSET_NAME), Some(&zeros), 2000.0, 2025.0)
        .unwrap();
    let find = |id| {
        &project
            .results()
            .iter()
            .find(|s| s.id == id)
            .unwrap()
            .item
            .results
    };
    // An unfunded program set has no effect at all.
    assert_eq!(find(baseline), find(unfunded));
}

#[test]
fn funded_programs_change_the_epidemic() {
    let mut project = demo_project().unwrap();
    let baseline = project
        .simulate(PARSET_NAME, None, None, 2000.0, 2025.0)
        .unwrap();
    let funded = project
        .simulate(PARSET_NAME, Some(PROGSET_NAME), None, 2000.0, 2025.0)
        .unwrap();
    let find = |id| {
        &project
            .results()
            .iter()
            .find(|s| s.id == id)
            .unwrap()
            .item
            .results
    };
    assert_ne!(find(baseline), find(funded));
}

#[test]
fn coverage_series_monotone_in_spend() {
    let project = demo_project().unwrap();
    let grid = TimeGrid::new(2015.0, 2016.0, 1.0);
    let nprogs = project.progsets()[0].item.len();
    let low = project
        .getcoverage(PARSET_NAME, PROGSET_NAME, &vec![1e5; nprogs], &grid)
        .unwrap();
    let high = project
        .getcoverage(PARSET_NAME, PROGSET_NAME, &vec![5e5; nprogs], &grid)
        .unwrap();
    let progset = &project.progsets()[0].item;
    for (p, prog) in progset.programs().iter().enumerate() {
        if prog.is_optimizable() {
            assert!(
                high[[p, 0]] >= low[[p, 0]],
                "coverage of {} decreased with spend",
                prog.short
            );
        }
    }
}

#[test]
fn overlay_is_idempotent() {
    let project = demo_project().unwrap();
    let grid = TimeGrid::new(2015.0, 2020.0, 0.5);
    let budget = project.progsets()[0].item.default_budget();
    let a = project
        .getoutcomes(PARSET_NAME, PROGSET_NAME, &budget, &grid)
        .unwrap();
    let b = project
        .getoutcomes(PARSET_NAME, PROGSET_NAME, &budget, &grid)
        .unwrap();
    assert_eq!(a, b);
    assert!(!a.is_empty());
}
