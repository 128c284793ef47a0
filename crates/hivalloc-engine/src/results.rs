//! Results extraction: epidemiological series, DALYs, horizon aggregation,
//! and the scalar objectives consumed by the optimizer.

use serde::{Deserialize, Serialize};

use hivalloc_core::{Constants, Error, Locus, Result, NCD4};

use crate::model::{dx, fail, tx1, tx2, undx, SimOutput};

/// A per-population series with its total.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSeries {
    /// One row per population.
    pub pops: Vec<Vec<f64>>,
    pub tot: Vec<f64>,
}

impl ResultSeries {
    fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let npts = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut tot = vec![0.0; npts];
        for row in &rows {
            for (j, v) in row.iter().enumerate() {
                tot[j] += v;
            }
        }
        ResultSeries { pops: rows, tot }
    }
}

/// Extracted results of one simulation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Results {
    pub tvec: Vec<f64>,
    pub dt: f64,
    /// New infections per year.
    pub inci: ResultSeries,
    /// HIV-attributable deaths per year.
    pub death: ResultSeries,
    /// People living with HIV.
    pub plhiv: ResultSeries,
    /// People on treatment (both lines).
    pub numtx: ResultSeries,
    /// Diagnoses per year.
    pub numdx: ResultSeries,
    /// Prevalence by population; the total row is the overall prevalence.
    pub prev: ResultSeries,
    /// DALYs per year (YLL + YLD).
    pub daly: ResultSeries,
    /// Births and mother-to-child transmissions per year.
    pub births: Vec<f64>,
    pub mtct: Vec<f64>,
}

impl Results {
    /// Compute all series from a raw simulation output.
    pub fn from_sim(sim: &SimOutput, consts: &Constants) -> Results {
        let npts = sim.tvec.len();
        let npops = sim.inci.shape()[0];
        let to_rows = |arr: &ndarray::Array2<f64>| -> Vec<Vec<f64>> {
            (0..npops)
                .map(|p| (0..npts).map(|j| arr[[p, j]]).collect())
                .collect()
        };

        let disutil = consts.disutil.stage.as_array();
        let mut plhiv_rows = vec![vec![0.0; npts]; npops];
        let mut numtx_rows = vec![vec![0.0; npts]; npops];
        let mut daly_rows = vec![vec![0.0; npts]; npops];
        for p in 0..npops {
            for j in 0..npts {
                let mut plhiv = 0.0;
                let mut on_tx = 0.0;
                let mut yld = 0.0;
                for cd4 in 0..NCD4 {
                    let untreated = sim.people[[undx(cd4), p, j]]
                        + sim.people[[dx(cd4), p, j]]
                        + sim.people[[fail(cd4), p, j]];
                    let treated = sim.people[[tx1(cd4), p, j]] + sim.people[[tx2(cd4), p, j]];
                    plhiv += untreated + treated;
                    on_tx += treated;
                    yld += untreated * disutil[cd4];
                }
                yld += on_tx * consts.disutil.tx;
                plhiv_rows[p][j] = plhiv;
                numtx_rows[p][j] = on_tx;
                // DALYs per year: years of life lost plus years lived with
                // disability.
                daly_rows[p][j] = sim.death[[p, j]] * consts.yearslostperdeath + yld;
            }
        }

        let mut prev = ResultSeries::from_rows(to_rows(&sim.prev));
        prev.tot = sim.allprev.to_vec();

        Results {
            tvec: sim.tvec.clone(),
            dt: sim.dt,
            inci: ResultSeries::from_rows(to_rows(&sim.inci)),
            death: ResultSeries::from_rows(to_rows(&sim.death)),
            plhiv: ResultSeries::from_rows(plhiv_rows),
            numtx: ResultSeries::from_rows(numtx_rows),
            numdx: ResultSeries::from_rows(to_rows(&sim.dxrate)),
            prev,
            daly: ResultSeries::from_rows(daly_rows),
            births: sim.births.to_vec(),
            mtct: sim.mtct.to_vec(),
        }
    }

    fn index_of(&self, year: f64) -> Result<usize> {
        let idx = ((year - self.tvec[0]) / self.dt).round();
        if idx < 0.0 || idx as usize >= self.tvec.len() {
            return Err(Error::NoData {
                locus: Locus::default().with_year(year),
            });
        }
        Ok(idx as usize)
    }

    /// Integrate an annualized total series over `[start, end]`.
    pub fn cumulative(&self, series: &ResultSeries, start: f64, end: f64) -> Result<f64> {
        let lo = self.index_of(start)?;
        let hi = self.index_of(end)?;
        Ok(series.tot[lo..=hi].iter().sum::<f64>() * self.dt)
    }

    /// The total-series value at a single year.
    pub fn at(&self, series: &ResultSeries, year: f64) -> Result<f64> {
        Ok(series.tot[self.index_of(year)?])
    }
}

/// What an optimization minimizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveKind {
    /// Minimize weighted epidemiological outcomes at a fixed budget.
    Outcomes,
    /// Minimize spend subject to outcome-reduction targets.
    Money,
}

/// Optimization objectives (spec: `{which, start, end, until, weights, ...}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Objectives {
    pub which: ObjectiveKind,
    /// Year the allocation takes effect.
    pub start: f64,
    /// Year the allocation ends.
    pub end: f64,
    /// Year outcomes are projected to.
    pub until: f64,
    pub inciweight: f64,
    pub deathweight: f64,
    pub dalyweight: f64,
    /// Scale applied to the default budget to form the total budget.
    pub budgetscale: f64,
    /// Required fractional reduction in deaths (money-minimization).
    pub deathfrac: Option<f64>,
    /// Required fractional reduction in incidence (money-minimization).
    pub incifrac: Option<f64>,
}

impl Default for Objectives {
    fn default() -> Self {
        Objectives {
            which: ObjectiveKind::Outcomes,
            start: 2015.0,
            end: 2020.0,
            until: 2030.0,
            inciweight: 1.0,
            deathweight: 0.0,
            dalyweight: 0.0,
            budgetscale: 1.0,
            deathfrac: None,
            incifrac: None,
        }
    }
}

impl Objectives {
    /// Number of active outcome weights.
    pub fn active_weights(&self) -> usize {
        [self.inciweight, self.deathweight, self.dalyweight]
            .iter()
            .filter(|w| **w > 0.0)
            .count()
    }

    /// The weighted outcome objective over `[start, until]`, optionally
    /// normalized per outcome (used when several weights are active).
    pub fn outcome_objective(
        &self,
        results: &Results,
        normalizations: Option<&[f64; 3]>,
    ) -> Result<f64> {
        let norms = normalizations.copied().unwrap_or([1.0, 1.0, 1.0]);
        let mut j = 0.0;
        for (weight, series, norm) in [
            (self.inciweight, &results.inci, norms[0]),
            (self.deathweight, &results.death, norms[1]),
            (self.dalyweight, &results.daly, norms[2]),
        ] {
            if weight > 0.0 {
                j += weight * results.cumulative(series, self.start, self.until)? / norm.max(1e-12);
            }
        }
        Ok(j)
    }

    /// Per-outcome normalization factors from a baseline run.
    pub fn normalizations(&self, baseline: &Results) -> Result<[f64; 3]> {
        if self.active_weights() <= 1 {
            return Ok([1.0, 1.0, 1.0]);
        }
        Ok([
            baseline.cumulative(&baseline.inci, self.start, self.until)?,
            baseline.cumulative(&baseline.death, self.start, self.until)?,
            baseline.cumulative(&baseline.daly, self.start, self.until)?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, Array3};

    fn tiny_sim() -> SimOutput {
        // One population, three time points, hand-filled series.
        let npts = 3;
        let mut people = Array3::zeros((crate::model::NSTATES, 1, npts));
        for j in 0..npts {
            people[[crate::model::SUS, 0, j]] = 900.0;
            people[[undx(1), 0, j]] = 60.0;
            people[[tx1(1), 0, j]] = 40.0;
        }
        let mut inci = Array2::zeros((1, npts));
        let mut death = Array2::zeros((1, npts));
        for j in 0..npts {
            inci[[0, j]] = 10.0;
            death[[0, j]] = 2.0;
        }
        SimOutput {
            tvec: vec![2015.0, 2016.0, 2017.0],
            dt: 1.0,
            people,
            inci,
            sexinci: Array2::zeros((1, npts)),
            injinci: Array2::zeros((1, npts)),
            dxrate: Array2::zeros((1, npts)),
            newtx1: Array2::zeros((1, npts)),
            newtx2: Array2::zeros((1, npts)),
            death,
            prev: Array2::from_elem((1, npts), 0.1),
            allprev: Array1::from_elem(npts, 0.1),
            births: Array1::zeros(npts),
            mtct: Array1::zeros(npts),
            numcircum: Array2::zeros((1, npts)),
            newcircum: Array2::zeros((1, npts)),
            reqcircum: Array1::zeros(npts),
        }
    }

    #[test]
    fn test_daly_composition() {
        let consts = Constants::default();
        let results = Results::from_sim(&tiny_sim(), &consts);
        // YLL: 2 deaths/yr * 15 yr; YLD: 60 untreated gt500 + 40 treated.
        let expected = 2.0 * 15.0 + 60.0 * consts.disutil.stage.gt500 + 40.0 * consts.disutil.tx;
        assert!((results.daly.tot[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_cumulative() {
        let consts = Constants::default();
        let results = Results::from_sim(&tiny_sim(), &consts);
        let total = results.cumulative(&results.inci, 2015.0, 2017.0).unwrap();
        assert!((total - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_objective_single_weight_unnormalized() {
        let consts = Constants::default();
        let results = Results::from_sim(&tiny_sim(), &consts);
        let objectives = Objectives {
            start: 2015.0,
            end: 2016.0,
            until: 2017.0,
            ..Objectives::default()
        };
        assert_eq!(objectives.active_weights(), 1);
        let j = objectives.outcome_objective(&results, None).unwrap();
        assert!((j - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalized_multi_objective_is_weight_sum_at_baseline() {
        let consts = Constants::default();
        let results = Results::from_sim(&tiny_sim(), &consts);
        let objectives = Objectives {
            start: 2015.0,
            end: 2016.0,
            until: 2017.0,
            inciweight: 1.0,
            deathweight: 1.0,
            ..Objectives::default()
        };
        let norms = objectives.normalizations(&results).unwrap();
        let j = objectives.outcome_objective(&results, Some(&norms)).unwrap();
        assert!((j - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_grid_year() {
        let consts = Constants::default();
        let results = Results::from_sim(&tiny_sim(), &consts);
        assert!(results.cumulative(&results.inci, 2015.0, 2050.0).is_err());
    }
}
