//! The project container: populations, observed data, and arena-owned
//! parameter sets, program sets, results, and optimizations, referenced by
//! stable integer ids. Exposes the programmatic API of the engine:
//! `simulate`, `optimize`, `getcoverage`, and `getoutcomes`.

pub mod demo;

use std::time::{SystemTime, UNIX_EPOCH};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use hivalloc_core::{
    Error, InputKey, Locus, ParameterOverlay, ParameterSet, PopulationSet, RawData, Result,
    TimeGrid, DEFAULT_DT,
};
use hivalloc_engine::{ModelPars, ObjectiveKind, Objectives, Results, Simulator};
use hivalloc_optimization::{
    minimize_money, optimize_outcomes, AllocationConstraints, AsdConfig, MoneyOutcome,
    OptimizationOutcome,
};
use hivalloc_programs::ProgramSet;

/// An arena slot: a stable id plus the owned item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub id: u32,
    pub item: T,
}

/// A stored simulation result, referencing its inputs by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub name: String,
    pub parset: u32,
    pub progset: Option<u32>,
    pub allocation: Option<Vec<f64>>,
    pub results: Results,
}

/// The outcome attached to a stored optimization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OptimResult {
    Outcome(OptimizationOutcome),
    Money(MoneyOutcome),
}

/// A stored optimization configuration with its latest result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredOptim {
    pub name: String,
    pub parset: u32,
    pub progset: u32,
    pub objectives: Objectives,
    pub constraints: Option<AllocationConstraints>,
    pub result: Option<OptimResult>,
}

/// A country or regional project.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// Creation time, seconds since the Unix epoch.
    pub created: u64,
    pub populations: PopulationSet,
    pub data: RawData,
    /// Simulation timestep in years.
    pub dt: f64,
    parsets: Vec<Stored<ParameterSet>>,
    progsets: Vec<Stored<ProgramSet>>,
    results: Vec<Stored<StoredResult>>,
    optims: Vec<Stored<StoredOptim>>,
    next_id: u32,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Project {
            name: name.into(),
            created,
            populations: PopulationSet::default(),
            data: RawData::default(),
            dt: DEFAULT_DT,
            parsets: Vec::new(),
            progsets: Vec::new(),
            results: Vec::new(),
            optims: Vec::new(),
            next_id: 1,
        }
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Install populations and observed data from an external loader.
    pub fn hydrate(&mut self, populations: PopulationSet, data: RawData) {
        self.populations = populations;
        self.data = data;
    }

    /// Fit a parameter set from the observed data and store it.
    pub fn make_parset(&mut self, name: &str) -> Result<u32> {
        let parset = ParameterSet::from_data(name, &self.data, &self.populations)?;
        Ok(self.add_parset(parset))
    }

    pub fn add_parset(&mut self, parset: ParameterSet) -> u32 {
        let id = self.fresh_id();
        self.parsets.push(Stored { id, item: parset });
        id
    }

    pub fn add_progset(&mut self, progset: ProgramSet) -> u32 {
        let id = self.fresh_id();
        self.progsets.push(Stored { id, item: progset });
        id
    }

    pub fn parsets(&self) -> &[Stored<ParameterSet>] {
        &self.parsets
    }

    pub fn progsets(&self) -> &[Stored<ProgramSet>] {
        &self.progsets
    }

    pub fn results(&self) -> &[Stored<StoredResult>] {
        &self.results
    }

    pub fn optims(&self) -> &[Stored<StoredOptim>] {
        &self.optims
    }

    pub fn parset_named(&self, name: &str) -> Result<&Stored<ParameterSet>> {
        self.parsets
            .iter()
            .find(|s| s.item.name == name)
            .ok_or_else(|| Error::NoData {
                locus: Locus::parameter(format!("parset '{}'", name)),
            })
    }

    pub fn progset_named(&self, name: &str) -> Result<&Stored<ProgramSet>> {
        self.progsets
            .iter()
            .find(|s| s.item.name == name)
            .ok_or_else(|| Error::NoData {
                locus: Locus::parameter(format!("progset '{}'", name)),
            })
    }

    /// Simulate a parameter set, optionally under a funded program set, and
    /// store the result. Returns the stored result's id.
    pub fn simulate(
        &mut self,
        parsetname: &str,
        progsetname: Option<&str>,
        allocation: Option<&[f64]>,
        tstart: f64,
        tend: f64,
    ) -> Result<u32> {
        let grid = TimeGrid::new(tstart, tend, self.dt);
        let parset = self.parset_named(parsetname)?;
        let parset_id = parset.id;
        let mut pars = ModelPars::from_parset(&parset.item, &self.populations, &grid)?;

        let mut progset_id = None;
        let mut stored_allocation = None;
        if let Some(progsetname) = progsetname {
            let progset = self.progset_named(progsetname)?;
            let budget = match allocation {
                Some(a) => a.to_vec(),
                None => progset.item.default_budget(),
            };
            let popsizes = pars.popsize.clone();
            let overlay =
                progset
                    .item
                    .outcomes(&budget, &grid.tvec(), 0, &popsizes, &self.populations)?;
            pars.apply_overlay(&overlay)?;
            progset_id = Some(progset.id);
            stored_allocation = Some(budget);
        }

        let consts = pars.consts;
        let sim = Simulator::new(pars, &self.populations)?.run()?;
        let results = Results::from_sim(&sim, &consts);

        let id = self.fresh_id();
        self.results.push(Stored {
            id,
            item: StoredResult {
                name: format!("sim-{}", id),
                parset: parset_id,
                progset: progset_id,
                allocation: stored_allocation,
                results,
            },
        });
        Ok(id)
    }

    /// Run an optimization and store its configuration and result.
    /// Returns the stored optimization's id.
    #[allow(clippy::too_many_arguments)]
    pub fn optimize(
        &mut self,
        name: &str,
        objectives: &Objectives,
        constraints: Option<AllocationConstraints>,
        method: &str,
        maxtime: Option<f64>,
        mc: usize,
        parsetname: &str,
        progsetname: &str,
    ) -> Result<u32> {
        if method != "asd" {
            return Err(Error::Infeasible {
                reason: format!("unknown optimization method '{}'", method),
                locus: Locus::default(),
            });
        }
        let parset = self.parset_named(parsetname)?;
        let progset = self.progset_named(progsetname)?;
        let (parset_id, progset_id) = (parset.id, progset.id);
        let start = self.data.data_start().unwrap_or(objectives.start);
        let grid = TimeGrid::new(start, objectives.until, self.dt);

        let mut config = AsdConfig::new().with_mc(mc);
        if let Some(maxtime) = maxtime {
            config = config.with_maxtime(maxtime);
        }

        let result = match objectives.which {
            ObjectiveKind::Outcomes => OptimResult::Outcome(optimize_outcomes(
                &self.populations,
                &parset.item,
                &progset.item,
                &grid,
                objectives,
                constraints.clone(),
                &config,
            )?),
            ObjectiveKind::Money => OptimResult::Money(minimize_money(
                &self.populations,
                &parset.item,
                &progset.item,
                &grid,
                objectives,
                &config,
            )?),
        };

        let id = self.fresh_id();
        self.optims.push(Stored {
            id,
            item: StoredOptim {
                name: name.to_string(),
                parset: parset_id,
                progset: progset_id,
                objectives: objectives.clone(),
                constraints,
                result: Some(result),
            },
        });
        Ok(id)
    }

    /// Per-program coverage series for an allocation.
    pub fn getcoverage(
        &self,
        parsetname: &str,
        progsetname: &str,
        allocation: &[f64],
        grid: &TimeGrid,
    ) -> Result<Array2<f64>> {
        let parset = self.parset_named(parsetname)?;
        let progset = self.progset_named(progsetname)?;
        let tvec = grid.tvec();
        let popsizes = parset.item.values(&InputKey::new("popsize"), &tvec)?;
        progset
            .item
            .coverage(allocation, &tvec, &popsizes, &self.populations)
    }

    /// The parameter overlay an allocation produces.
    pub fn getoutcomes(
        &self,
        parsetname: &str,
        progsetname: &str,
        allocation: &[f64],
        grid: &TimeGrid,
    ) -> Result<ParameterOverlay> {
        let parset = self.parset_named(parsetname)?;
        let progset = self.progset_named(progsetname)?;
        let tvec = grid.tvec();
        let popsizes = parset.item.values(&InputKey::new("popsize"), &tvec)?;
        progset
            .item
            .outcomes(allocation, &tvec, 0, &popsizes, &self.populations)
    }

    /// Serialize the whole project.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Numerical {
            reason: format!("serialization failed: {}", e),
            locus: Locus::default(),
        })
    }

    /// Load a project back; the round-trip is exact.
    pub fn from_json(text: &str) -> Result<Project> {
        serde_json::from_str(text).map_err(|e| Error::Numerical {
            reason: format!("deserialization failed: {}", e),
            locus: Locus::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable_and_unique() {
        let mut project = demo::demo_project().unwrap();
        let first = project.make_parset("extra").unwrap();
        let second = project.make_parset("extra2").unwrap();
        assert!(second > first);
        assert!(project.parset_named("extra").is_ok());
    }

    #[test]
    fn test_unknown_names_fail() {
        let project = demo::demo_project().unwrap();
        assert!(project.parset_named("nope").is_err());
        assert!(project.progset_named("nope").is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut project = demo::demo_project().unwrap();
        let objectives = Objectives::default();
        let err = project
            .optimize(
                "opt",
                &objectives,
                None,
                "simplex",
                None,
                1,
                demo::PARSET_NAME,
                demo::PROGSET_NAME,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Infeasible { .. }));
    }
}
