//! Program sets: the ordered program catalog of a project, and the
//! translation of a budget vector into coverage and parameter overrides.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use hivalloc_core::{
    is_coverage_key, key_spec, Domain, Error, InputKey, Locus, ParameterOverlay, PopulationSet,
    Result,
};

use crate::program::{PopTarget, Program};

/// An ordered collection of programs with unique short names. The order is
/// stable and defines the budget-vector coordinate system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgramSet {
    pub name: String,
    programs: Vec<Program>,
}

impl ProgramSet {
    pub fn new(name: impl Into<String>) -> Self {
        ProgramSet {
            name: name.into(),
            programs: Vec::new(),
        }
    }

    pub fn add(&mut self, program: Program) -> Result<()> {
        if self.programs.iter().any(|p| p.short == program.short) {
            return Err(Error::Infeasible {
                reason: format!("duplicate program short name '{}'", program.short),
                locus: Locus::program(program.short.clone()),
            });
        }
        self.programs.push(program);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn get(&self, short: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.short == short)
    }

    pub fn get_mut(&mut self, short: &str) -> Option<&mut Program> {
        self.programs.iter_mut().find(|p| p.short == short)
    }

    pub fn index_of(&self, short: &str) -> Option<usize> {
        self.programs.iter().position(|p| p.short == short)
    }

    /// Which programs are optimizable, in budget order.
    pub fn optimizable_flags(&self) -> Vec<bool> {
        self.programs.iter().map(|p| p.is_optimizable()).collect()
    }

    pub fn n_optimizable(&self) -> usize {
        self.programs.iter().filter(|p| p.is_optimizable()).count()
    }

    /// The default budget: each program's latest reported spend.
    pub fn default_budget(&self) -> Vec<f64> {
        self.programs.iter().map(|p| p.latest_spend()).collect()
    }

    /// Programs (by index) targeting the given parameter in any population.
    pub fn programs_for_par(&self, key: &InputKey) -> Vec<usize> {
        self.programs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.effects.iter().any(|e| &e.param == key))
            .map(|(i, _)| i)
            .collect()
    }

    /// Programs (by index) targeting the given population.
    pub fn programs_for_pop(&self, short: &str) -> Vec<usize> {
        self.programs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.targetpops.is_empty() || p.targetpops.iter().any(|t| t == short))
            .map(|(i, _)| i)
            .collect()
    }

    fn check_budget(&self, budget: &[f64]) -> Result<()> {
        if budget.len() != self.programs.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} budget entries", self.programs.len()),
                actual: format!("{}", budget.len()),
                locus: Locus::program(self.name.clone()),
            });
        }
        Ok(())
    }

    /// Target population size per program over the grid.
    fn target_popsizes(
        &self,
        tvec: &[f64],
        popsizes: &Array2<f64>,
        popset: &PopulationSet,
    ) -> Result<Array2<f64>> {
        if popsizes.shape() != [popset.len(), tvec.len()] {
            return Err(Error::ShapeMismatch {
                expected: format!("{}x{} popsize array", popset.len(), tvec.len()),
                actual: format!("{:?}", popsizes.shape()),
                locus: Locus::program(self.name.clone()),
            });
        }
        let mut out = Array2::zeros((self.programs.len(), tvec.len()));
        for (p, prog) in self.programs.iter().enumerate() {
            let targets = prog.target_indices(popset);
            for j in 0..tvec.len() {
                out[[p, j]] = targets.iter().map(|&i| popsizes[[i, j]]).sum();
            }
        }
        Ok(out)
    }

    /// Coverage in people per program over the grid, for a constant yearly
    /// spend per program.
    pub fn coverage(
        &self,
        budget: &[f64],
        tvec: &[f64],
        popsizes: &Array2<f64>,
        popset: &PopulationSet,
    ) -> Result<Array2<f64>> {
        self.check_budget(budget)?;
        let targets = self.target_popsizes(tvec, popsizes, popset)?;
        let mut out = Array2::zeros((self.programs.len(), tvec.len()));
        for (p, prog) in self.programs.iter().enumerate() {
            for (j, &t) in tvec.iter().enumerate() {
                out[[p, j]] = prog.ccpars.evaluate(budget[p], targets[[p, j]], t);
            }
        }
        Ok(out)
    }

    /// Non-HIV DALYs averted per year across all programs.
    pub fn nonhiv_dalys_averted(
        &self,
        budget: &[f64],
        tvec: &[f64],
        popsizes: &Array2<f64>,
        popset: &PopulationSet,
    ) -> Result<Array1<f64>> {
        let coverage = self.coverage(budget, tvec, popsizes, popset)?;
        let mut out = Array1::zeros(tvec.len());
        for (p, prog) in self.programs.iter().enumerate() {
            for j in 0..tvec.len() {
                out[j] += prog.nonhiv_dalys * coverage[[p, j]];
            }
        }
        Ok(out)
    }

    /// Translate a budget into a parameter overlay on the grid.
    ///
    /// Programs with zero spend contribute nothing, so a zero budget yields
    /// an empty overlay and simulation falls back to the baseline exactly.
    /// Entries replace the baseline from `start_index` onward.
    pub fn outcomes(
        &self,
        budget: &[f64],
        tvec: &[f64],
        start_index: usize,
        popsizes: &Array2<f64>,
        popset: &PopulationSet,
    ) -> Result<ParameterOverlay> {
        self.check_budget(budget)?;
        let targets = self.target_popsizes(tvec, popsizes, popset)?;
        let coverage = self.coverage(budget, tvec, popsizes, popset)?;
        let npts = tvec.len();

        // Group effect contributions by (key, population).
        type GroupKey = (String, Option<usize>);
        let mut groups: BTreeMap<GroupKey, Vec<(usize, usize)>> = BTreeMap::new();
        for (p, prog) in self.programs.iter().enumerate() {
            if budget[p] <= 0.0 {
                continue;
            }
            for (e, effect) in prog.effects.iter().enumerate() {
                let (domain, _) = key_spec(&effect.param)?;
                let pops: Vec<Option<usize>> = if is_coverage_key(&effect.param)
                    || domain == Domain::Scalar
                {
                    vec![None]
                } else {
                    match &effect.pop {
                        PopTarget::Pop(short) => {
                            let idx = popset.index_of(short).ok_or_else(|| Error::NoData {
                                locus: Locus::program(prog.short.clone())
                                    .with_parameter(effect.param.to_string())
                                    .with_population(short.clone()),
                            })?;
                            vec![Some(idx)]
                        }
                        PopTarget::All => prog
                            .target_indices(popset)
                            .into_iter()
                            .map(Some)
                            .collect(),
                    }
                };
                for pop in pops {
                    groups
                        .entry((effect.param.to_string(), pop))
                        .or_default()
                        .push((p, e));
                }
            }
        }

        let mut overlay = ParameterOverlay::new(tvec.to_vec(), start_index);
        for ((key_name, pop), contributors) in groups {
            let key: InputKey = key_name.parse()?;
            let (_, range) = key_spec(&key)?;
            let (low, high) = range.bounds();
            let mut values = vec![0.0; npts];

            if is_coverage_key(&key) {
                // Coverage parameters take the summed program coverage directly.
                for j in 0..npts {
                    let total: f64 = contributors.iter().map(|&(p, _)| coverage[[p, j]]).sum();
                    values[j] = total.clamp(low, high);
                }
            } else {
                // Effects declared without a usable curve produce no override.
                let curved: Vec<(usize, usize)> = contributors
                    .iter()
                    .copied()
                    .filter(|&(p, e)| {
                        self.programs[p]
                            .ccopars
                            .get(e)
                            .map_or(false, |co| !co.anchors().is_empty())
                    })
                    .collect();
                if curved.is_empty() {
                    continue;
                }
                if let [(p, e)] = curved.as_slice() {
                    let prog = &self.programs[*p];
                    let covout = &prog.ccopars[*e];
                    for (j, &t) in tvec.iter().enumerate() {
                        let n = targets[[*p, j]];
                        let frac = if n > 0.0 { coverage[[*p, j]] / n } else { 0.0 };
                        let rho = (frac * prog.reach).clamp(0.0, 1.0);
                        if let Some(v) = covout.evaluate(rho, t) {
                            values[j] = v.clamp(low, high);
                        }
                    }
                } else {
                    // Modality combination: inclusion-exclusion over
                    // independent reach, value averaged over the covered
                    // fraction, baseline for the unreached remainder.
                    for (j, &t) in tvec.iter().enumerate() {
                        let mut unreached = 1.0;
                        let mut rho_sum = 0.0;
                        let mut full_sum = 0.0;
                        let mut zero_sum = 0.0;
                        let mut zero_plain = 0.0;
                        for &(p, e) in &curved {
                            let prog = &self.programs[p];
                            let covout = &prog.ccopars[e];
                            let n = targets[[p, j]];
                            let frac = if n > 0.0 { coverage[[p, j]] / n } else { 0.0 };
                            let rho = (frac * prog.reach).clamp(0.0, 1.0);
                            let full = covout.evaluate(1.0, t).unwrap_or(0.0);
                            let zero = covout.zero_at(t).unwrap_or(0.0);
                            unreached *= 1.0 - rho;
                            rho_sum += rho;
                            full_sum += rho * full;
                            zero_sum += rho * zero;
                            zero_plain += zero;
                        }
                        let reached = 1.0 - unreached;
                        let (covered_value, baseline) = if rho_sum > 1e-12 {
                            (full_sum / rho_sum, zero_sum / rho_sum)
                        } else {
                            (0.0, zero_plain / curved.len() as f64)
                        };
                        let v = (1.0 - reached) * baseline + reached * covered_value;
                        values[j] = v.clamp(low, high);
                    }
                }
            }
            overlay.push(key, pop, values);
        }
        Ok(overlay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::costcov::{CostCov, CostCovAnchor};
    use crate::covout::{CovOut, CovOutAnchor};
    use crate::program::{CostCovDatum, Effect};
    use hivalloc_core::Population;

    fn popset() -> PopulationSet {
        PopulationSet::new(vec![
            Population::new("FSW", "Female sex workers").female().sexworker(),
            Population::new("MSM", "Men who have sex with men").male(),
        ])
        .unwrap()
    }

    fn popsizes(npts: usize) -> Array2<f64> {
        let mut arr = Array2::zeros((2, npts));
        for j in 0..npts {
            arr[[0, j]] = 1e4;
            arr[[1, j]] = 5e4;
        }
        arr
    }

    fn testing_program(short: &str, pop: &str, zero: f64, full: f64) -> Program {
        let mut prog = Program::new(short, format!("{} testing", short));
        prog.targetpops = vec![pop.to_string()];
        prog.effects.push(Effect::new(
            InputKey::new("hivtest"),
            PopTarget::Pop(pop.to_string()),
        ));
        prog.ccdata.push(CostCovDatum {
            t: 2014.0,
            cost: 1e5,
            coverage: 4e3,
            popsize: None,
        });
        prog.ccpars = CostCov::new(vec![CostCovAnchor::new(2014.0, 0.9, 20.0)]);
        prog.ccopars
            .push(CovOut::new(vec![CovOutAnchor::linear(2014.0, zero, full)]));
        prog.basespend = 1e5;
        prog
    }

    #[test]
    fn test_duplicate_program_rejected() {
        let mut set = ProgramSet::new("default");
        set.add(Program::new("HTC", "Testing")).unwrap();
        assert!(set.add(Program::new("HTC", "Testing again")).is_err());
    }

    #[test]
    fn test_zero_budget_empty_overlay() {
        let mut set = ProgramSet::new("default");
        set.add(testing_program("HTC", "FSW", 0.1, 0.8)).unwrap();
        let pops = popset();
        let tvec = vec![2015.0, 2016.0];
        let overlay = set
            .outcomes(&[0.0], &tvec, 0, &popsizes(2), &pops)
            .unwrap();
        assert!(overlay.is_empty());
    }

    #[test]
    fn test_single_program_override() {
        let mut set = ProgramSet::new("default");
        set.add(testing_program("HTC", "FSW", 0.1, 0.8)).unwrap();
        let pops = popset();
        let tvec = vec![2015.0];
        let budget = vec![2e5];
        let overlay = set
            .outcomes(&budget, &tvec, 0, &popsizes(1), &pops)
            .unwrap();
        let entry = overlay.get(&InputKey::new("hivtest"), Some(0)).unwrap();
        // Value must sit between the zero- and full-coverage bounds.
        assert!(entry.values[0] > 0.1 && entry.values[0] < 0.8);
        // And must equal the CCO at the program's coverage fraction.
        let cov = set
            .coverage(&budget, &tvec, &popsizes(1), &pops)
            .unwrap()[[0, 0]];
        let frac = cov / 1e4;
        let expected = 0.1 + (0.8 - 0.1) * frac;
        assert!((entry.values[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn two_modalities_combine() {
        let mut set = ProgramSet::new("default");
        set.add(testing_program("HTC", "FSW", 0.1, 0.8)).unwrap();
        set.add(testing_program("FSWP", "FSW", 0.1, 0.6)).unwrap();
        let pops = popset();
        let tvec = vec![2015.0];
        let budget = vec![2e5, 1e5];
        let cov = set.coverage(&budget, &tvec, &popsizes(1), &pops).unwrap();
        let rho1 = cov[[0, 0]] / 1e4;
        let rho2 = cov[[1, 0]] / 1e4;
        // Hand-computed inclusion-exclusion composition.
        let reached = 1.0 - (1.0 - rho1) * (1.0 - rho2);
        let covered = (rho1 * 0.8 + rho2 * 0.6) / (rho1 + rho2);
        let expected = (1.0 - reached) * 0.1 + reached * covered;
        let overlay = set
            .outcomes(&budget, &tvec, 0, &popsizes(1), &pops)
            .unwrap();
        let entry = overlay.get(&InputKey::new("hivtest"), Some(0)).unwrap();
        assert!((entry.values[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_coverage_parameter_passthrough() {
        let mut art = Program::new("ART", "Antiretroviral therapy");
        art.effects
            .push(Effect::new(InputKey::new("numfirstline"), PopTarget::All));
        art.ccdata.push(CostCovDatum {
            t: 2014.0,
            cost: 1e6,
            coverage: 2e4,
            popsize: None,
        });
        art.ccpars = CostCov::new(vec![CostCovAnchor::new(2014.0, 0.9, 400.0)]);
        art.ccopars.push(CovOut::new(Vec::new()));
        let mut set = ProgramSet::new("default");
        set.add(art).unwrap();
        let pops = popset();
        let tvec = vec![2015.0];
        let budget = vec![2e6];
        let overlay = set
            .outcomes(&budget, &tvec, 0, &popsizes(1), &pops)
            .unwrap();
        let entry = overlay.get(&InputKey::new("numfirstline"), None).unwrap();
        let cov = set.coverage(&budget, &tvec, &popsizes(1), &pops).unwrap()[[0, 0]];
        assert!((entry.values[0] - cov).abs() < 1e-9);
        assert!(cov > 0.0);
    }

    #[test]
    fn test_overlay_idempotent_inputs() {
        // Same budget twice gives the identical overlay.
        let mut set = ProgramSet::new("default");
        set.add(testing_program("HTC", "FSW", 0.1, 0.8)).unwrap();
        let pops = popset();
        let tvec = vec![2015.0, 2016.0];
        let a = set
            .outcomes(&[2e5], &tvec, 0, &popsizes(2), &pops)
            .unwrap();
        let b = set
            .outcomes(&[2e5], &tvec, 0, &popsizes(2), &pops)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_budget_length_checked() {
        let mut set = ProgramSet::new("default");
        set.add(testing_program("HTC", "FSW", 0.1, 0.8)).unwrap();
        let pops = popset();
        let err = set
            .coverage(&[1.0, 2.0], &[2015.0], &popsizes(1), &pops)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
