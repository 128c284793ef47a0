//! Allocation constraints: per-program bounds and projection onto the
//! fixed-total-budget simplex.

use serde::{Deserialize, Serialize};

use hivalloc_core::{Error, Locus, Result};
use hivalloc_programs::ProgramSet;

/// Bounds and budget constraint for the optimizable allocation vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationConstraints {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    /// Fixed total budget; `None` leaves the total free
    /// (money-minimization).
    pub total: Option<f64>,
}

impl AllocationConstraints {
    /// Unbounded coordinates with a fixed total.
    pub fn fixed_total(n: usize, total: f64) -> Self {
        AllocationConstraints {
            lower: vec![0.0; n],
            upper: vec![f64::MAX; n],
            total: Some(total),
        }
    }

    /// Unbounded coordinates, free total.
    pub fn free(n: usize) -> Self {
        AllocationConstraints {
            lower: vec![0.0; n],
            upper: vec![f64::MAX; n],
            total: None,
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    /// Check the constraint set admits any point at all.
    pub fn check_feasible(&self) -> Result<()> {
        if self.lower.len() != self.upper.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} bounds", self.lower.len()),
                actual: format!("{}", self.upper.len()),
                locus: Locus::default(),
            });
        }
        for (i, (lo, hi)) in self.lower.iter().zip(&self.upper).enumerate() {
            if lo > hi {
                return Err(Error::Infeasible {
                    reason: format!("lower bound {} above upper bound {} at program {}", lo, hi, i),
                    locus: Locus::default(),
                });
            }
        }
        if let Some(total) = self.total {
            let lo_sum: f64 = self.lower.iter().sum();
            let hi_sum: f64 = self.upper.iter().sum();
            if lo_sum > total || hi_sum < total {
                return Err(Error::Infeasible {
                    reason: format!(
                        "total budget {} outside the bound envelope [{}, {}]",
                        total, lo_sum, hi_sum
                    ),
                    locus: Locus::default(),
                });
            }
        }
        Ok(())
    }

    /// Project an allocation onto the feasible set: clamp to the bounds,
    /// then rescale free coordinates until the total matches.
    pub fn project(&self, alloc: &mut [f64]) -> Result<()> {
        if alloc.len() != self.lower.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} entries", self.lower.len()),
                actual: format!("{}", alloc.len()),
                locus: Locus::default(),
            });
        }
        for (i, v) in alloc.iter_mut().enumerate() {
            *v = v.clamp(self.lower[i], self.upper[i]);
        }
        let total = match self.total {
            Some(t) => t,
            None => return Ok(()),
        };
        for _ in 0..32 {
            let sum: f64 = alloc.iter().sum();
            let diff = total - sum;
            if diff.abs() <= 1e-9 * total.max(1.0) {
                return Ok(());
            }
            // Coordinates with slack in the direction we need to move.
            let free: Vec<usize> = (0..alloc.len())
                .filter(|&i| {
                    if diff > 0.0 {
                        alloc[i] < self.upper[i]
                    } else {
                        alloc[i] > self.lower[i]
                    }
                })
                .collect();
            if free.is_empty() {
                return Err(Error::Infeasible {
                    reason: "no coordinate can absorb the budget residual".into(),
                    locus: Locus::default(),
                });
            }
            let weight_sum: f64 = free.iter().map(|&i| alloc[i].max(1.0)).sum();
            for &i in &free {
                let share = alloc[i].max(1.0) / weight_sum;
                alloc[i] =
                    (alloc[i] + diff * share).clamp(self.lower[i], self.upper[i]);
            }
        }
        let sum: f64 = alloc.iter().sum();
        if (total - sum).abs() <= 1e-6 * total.max(1.0) {
            Ok(())
        } else {
            Err(Error::Infeasible {
                reason: format!("projection did not converge: total {} target {}", sum, total),
                locus: Locus::default(),
            })
        }
    }
}

/// Build constraints for a program set: optimizable programs keep the given
/// bounds; non-optimizable programs are pinned to their latest spend.
pub fn constraints_for(
    progset: &ProgramSet,
    total: Option<f64>,
) -> (AllocationConstraints, Vec<usize>) {
    let flags = progset.optimizable_flags();
    let optimizable: Vec<usize> = flags
        .iter()
        .enumerate()
        .filter(|(_, f)| **f)
        .map(|(i, _)| i)
        .collect();
    let n = optimizable.len();
    let constraints = AllocationConstraints {
        lower: vec![0.0; n],
        upper: vec![f64::MAX; n],
        total,
    };
    (constraints, optimizable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_to_total() {
        let constraints = AllocationConstraints::fixed_total(3, 300.0);
        let mut alloc = vec![50.0, 100.0, 50.0];
        constraints.project(&mut alloc).unwrap();
        let sum: f64 = alloc.iter().sum();
        assert!((sum - 300.0).abs() < 1e-6);
        // Proportions are preserved by the proportional redistribution.
        assert!(alloc[1] > alloc[0]);
    }

    #[test]
    fn test_project_respects_bounds() {
        let constraints = AllocationConstraints {
            lower: vec![0.0, 0.0],
            upper: vec![80.0, f64::INFINITY],
            total: Some(300.0),
        };
        let mut alloc = vec![200.0, 10.0];
        constraints.project(&mut alloc).unwrap();
        assert!(alloc[0] <= 80.0 + 1e-9);
        assert!((alloc[0] + alloc[1] - 300.0).abs() < 1e-6);
    }

    #[test]
    fn test_infeasible_envelope() {
        let constraints = AllocationConstraints {
            lower: vec![10.0, 10.0],
            upper: vec![20.0, 20.0],
            total: Some(100.0),
        };
        assert!(matches!(
            constraints.check_feasible(),
            Err(Error::Infeasible { .. })
        ));
    }

    #[test]
    fn test_free_total_only_clamps() {
        let constraints = AllocationConstraints::free(2);
        let mut alloc = vec![-5.0, 10.0];
        constraints.project(&mut alloc).unwrap();
        assert_eq!(alloc, vec![0.0, 10.0]);
    }
}
