//! The built-in example project: six populations, seven programs, observed
//! data for 2000-2015. Used by the integration tests and as a template for
//! wiring real data.

use hivalloc_core::{
    CostCoverageData, InputKey, Population, PopulationSet, RawData, Result,
};
use hivalloc_programs::{
    CostCovDatum, CovOut, CovOutAnchor, Effect, PopTarget, Program, ProgramSet,
};

use crate::Project;

pub const PARSET_NAME: &str = "default";
pub const PROGSET_NAME: &str = "default";

const DATA_START: f64 = 2000.0;
const DATA_END: f64 = 2015.0;
const NYEARS: usize = 16;

fn years() -> Vec<f64> {
    (0..NYEARS).map(|i| DATA_START + i as f64).collect()
}

/// A sparse observed series: anchors at the first and last data year.
fn ramp(v0: f64, v1: f64) -> Vec<Option<f64>> {
    let mut row = vec![None; NYEARS];
    row[0] = Some(v0);
    row[NYEARS - 1] = Some(v1);
    row
}

fn flat(v: f64) -> Vec<Option<f64>> {
    ramp(v, v)
}

pub fn demo_populations() -> Result<PopulationSet> {
    PopulationSet::new(vec![
        Population::new("FSW", "Female sex workers").female().sexworker(),
        Population::new("CLI", "Clients of sex workers").male().client(),
        Population::new("MSM", "Men who have sex with men").male(),
        Population::new("PWID", "People who inject drugs").male().injects(),
        Population::new("M15", "Males 15-49").male(),
        Population::new("F15", "Females 15-49").female(),
    ])
}

pub fn demo_data() -> RawData {
    let mut data = RawData {
        years: years(),
        growth: 0.025,
        ..RawData::default()
    };

    let per_pop = |rows: [Vec<Option<f64>>; 6]| rows.to_vec();

    data.series.insert(
        InputKey::new("popsize"),
        per_pop([
            flat(8_000.0),
            flat(120_000.0),
            flat(40_000.0),
            flat(25_000.0),
            flat(1_200_000.0),
            flat(1_300_000.0),
        ]),
    );
    data.series.insert(
        InputKey::new("hivprev"),
        per_pop([
            flat(0.12),
            flat(0.04),
            flat(0.09),
            flat(0.15),
            flat(0.015),
            flat(0.02),
        ]),
    );
    data.series.insert(
        InputKey::new("death"),
        per_pop([
            flat(0.013),
            flat(0.012),
            flat(0.012),
            flat(0.02),
            flat(0.012),
            flat(0.011),
        ]),
    );
    data.series.insert(
        InputKey::new("stiprevulc"),
        per_pop([
            ramp(0.12, 0.08),
            flat(0.04),
            flat(0.05),
            flat(0.04),
            flat(0.03),
            flat(0.03),
        ]),
    );
    data.series.insert(
        InputKey::new("tbprev"),
        per_pop([
            flat(0.005),
            flat(0.005),
            flat(0.005),
            flat(0.01),
            flat(0.005),
            flat(0.005),
        ]),
    );
    data.series.insert(
        InputKey::new("hivtest"),
        per_pop([
            ramp(0.05, 0.35),
            ramp(0.02, 0.10),
            ramp(0.04, 0.25),
            ramp(0.03, 0.15),
            ramp(0.02, 0.10),
            ramp(0.03, 0.15),
        ]),
    );
    data.series
        .insert(InputKey::new("aidstest"), vec![ramp(0.4, 0.6)]);
    data.series
        .insert(InputKey::new("numfirstline"), vec![ramp(200.0, 18_000.0)]);
    data.series
        .insert(InputKey::new("numsecondline"), vec![ramp(50.0, 1_500.0)]);
    data.series
        .insert(InputKey::new("txelig"), vec![ramp(200.0, 500.0)]);
    data.series
        .insert(InputKey::new("numpmtct"), vec![ramp(100.0, 4_000.0)]);
    data.series.insert(
        InputKey::new("birth"),
        per_pop([
            flat(0.02),
            flat(0.0),
            flat(0.0),
            flat(0.0),
            flat(0.0),
            flat(0.03),
        ]),
    );
    data.series
        .insert(InputKey::new("breast"), vec![ramp(0.7, 0.4)]);
    data.series.insert(
        InputKey::sub("numacts", "reg"),
        per_pop([
            flat(40.0),
            flat(60.0),
            flat(70.0),
            flat(50.0),
            flat(75.0),
            flat(75.0),
        ]),
    );
    data.series.insert(
        InputKey::sub("numacts", "cas"),
        per_pop([
            flat(12.0),
            flat(15.0),
            flat(20.0),
            flat(10.0),
            flat(8.0),
            flat(8.0),
        ]),
    );
    data.series.insert(
        InputKey::sub("numacts", "com"),
        per_pop([
            flat(300.0),
            flat(25.0),
            flat(0.0),
            flat(0.0),
            flat(0.0),
            flat(0.0),
        ]),
    );
    data.series.insert(
        InputKey::sub("numacts", "inj"),
        per_pop([
            flat(0.0),
            flat(0.0),
            flat(0.0),
            flat(70.0),
            flat(0.0),
            flat(0.0),
        ]),
    );
    data.series.insert(
        InputKey::sub("condom", "reg"),
        per_pop([
            ramp(0.15, 0.30),
            ramp(0.10, 0.25),
            ramp(0.20, 0.40),
            ramp(0.10, 0.25),
            ramp(0.10, 0.30),
            ramp(0.10, 0.30),
        ]),
    );
    data.series.insert(
        InputKey::sub("condom", "cas"),
        per_pop([
            ramp(0.30, 0.50),
            ramp(0.20, 0.40),
            ramp(0.30, 0.55),
            ramp(0.20, 0.40),
            ramp(0.20, 0.45),
            ramp(0.20, 0.45),
        ]),
    );
    data.series.insert(
        InputKey::sub("condom", "com"),
        per_pop([
            ramp(0.50, 0.80),
            ramp(0.45, 0.75),
            flat(0.0),
            flat(0.0),
            flat(0.0),
            flat(0.0),
        ]),
    );
    data.series.insert(
        InputKey::new("circum"),
        per_pop([
            flat(0.0),
            flat(0.12),
            flat(0.10),
            flat(0.10),
            flat(0.12),
            flat(0.0),
        ]),
    );
    data.series
        .insert(InputKey::new("numost"), vec![ramp(0.0, 500.0)]);
    data.series
        .insert(InputKey::new("sharing"), vec![ramp(0.5, 0.25)]);

    let mut pships_reg = vec![vec![0.0; 6]; 6];
    pships_reg[4][5] = 1.0; // general males with general females
    pships_reg[1][5] = 0.3;
    pships_reg[3][5] = 0.5;
    pships_reg[2][2] = 1.0;
    data.matrices.insert(InputKey::sub("pships", "reg"), pships_reg);

    let mut pships_cas = vec![vec![0.0; 6]; 6];
    pships_cas[4][5] = 0.5;
    pships_cas[1][5] = 0.3;
    pships_cas[3][5] = 0.3;
    pships_cas[2][2] = 0.8;
    data.matrices.insert(InputKey::sub("pships", "cas"), pships_cas);

    let mut pships_com = vec![vec![0.0; 6]; 6];
    pships_com[1][0] = 1.0; // clients with female sex workers
    data.matrices.insert(InputKey::sub("pships", "com"), pships_com);

    let mut pships_inj = vec![vec![0.0; 6]; 6];
    pships_inj[3][3] = 1.0;
    data.matrices.insert(InputKey::sub("pships", "inj"), pships_inj);

    data
}

fn costcov_points(points: &[(f64, f64, f64)]) -> (Vec<CostCovDatum>, CostCoverageData) {
    let data = points
        .iter()
        .map(|&(t, cost, coverage)| CostCovDatum {
            t,
            cost,
            coverage,
            popsize: None,
        })
        .collect();
    let block = CostCoverageData {
        years: points.iter().map(|p| p.0).collect(),
        cost: points.iter().map(|p| Some(p.1)).collect(),
        coverage: points.iter().map(|p| Some(p.2)).collect(),
    };
    (data, block)
}

pub fn demo_progset(data: &mut RawData) -> Result<ProgramSet> {
    let mut progset = ProgramSet::new(PROGSET_NAME);
    let whole_population = 8_000.0 + 120_000.0 + 40_000.0 + 25_000.0 + 1_200_000.0 + 1_300_000.0;

    let mut cond = Program::new("COND", "Condom promotion and distribution");
    cond.effects.push(Effect::new(InputKey::sub("condom", "reg"), PopTarget::All));
    cond.effects.push(Effect::new(InputKey::sub("condom", "cas"), PopTarget::All));
    cond.ccopars.push(CovOut::new(vec![CovOutAnchor::linear(DATA_END, 0.20, 0.70)]));
    cond.ccopars.push(CovOut::new(vec![CovOutAnchor::linear(DATA_END, 0.35, 0.65)]));
    let (ccdata, block) = costcov_points(&[
        (2013.0, 2.5e5, 2.0e5),
        (2014.0, 4.0e5, 3.2e5),
    ]);
    cond.ccdata = ccdata;
    data.costcov.insert("COND".into(), block);
    cond.fit_costcov(0.7, whole_population);
    cond.basespend = 4.0e5;
    progset.add(cond)?;

    let mut fswp = Program::new("FSWP", "Programs for female sex workers and clients");
    fswp.targetpops = vec!["FSW".into()];
    fswp.reach = 0.9;
    fswp.effects.push(Effect::new(
        InputKey::sub("condom", "com"),
        PopTarget::Pop("FSW".into()),
    ));
    fswp.effects.push(Effect::new(
        InputKey::new("hivtest"),
        PopTarget::Pop("FSW".into()),
    ));
    fswp.ccopars.push(CovOut::new(vec![CovOutAnchor::linear(DATA_END, 0.55, 0.95)]));
    fswp.ccopars.push(CovOut::new(vec![CovOutAnchor::linear(DATA_END, 0.20, 0.75)]));
    let (ccdata, block) = costcov_points(&[(2014.0, 1.5e5, 4.0e3)]);
    fswp.ccdata = ccdata;
    data.costcov.insert("FSWP".into(), block);
    fswp.fit_costcov(0.9, 8_000.0);
    fswp.basespend = 1.5e5;
    progset.add(fswp)?;

    let mut msmp = Program::new("MSMP", "Programs for men who have sex with men");
    msmp.targetpops = vec!["MSM".into()];
    msmp.effects.push(Effect::new(
        InputKey::sub("condom", "reg"),
        PopTarget::Pop("MSM".into()),
    ));
    msmp.effects.push(Effect::new(
        InputKey::sub("condom", "cas"),
        PopTarget::Pop("MSM".into()),
    ));
    msmp.ccopars.push(CovOut::new(vec![CovOutAnchor::linear(DATA_END, 0.20, 0.75)]));
    msmp.ccopars.push(CovOut::new(vec![CovOutAnchor::linear(DATA_END, 0.30, 0.70)]));
    let (ccdata, block) = costcov_points(&[(2014.0, 1.2e5, 9.0e3)]);
    msmp.ccdata = ccdata;
    data.costcov.insert("MSMP".into(), block);
    msmp.fit_costcov(0.8, 40_000.0);
    msmp.basespend = 1.2e5;
    progset.add(msmp)?;

    let mut htc = Program::new("HTC", "HIV testing and counseling");
    htc.effects.push(Effect::new(InputKey::new("hivtest"), PopTarget::All));
    htc.ccopars.push(CovOut::new(vec![CovOutAnchor::linear(DATA_END, 0.10, 0.60)]));
    let (ccdata, block) = costcov_points(&[
        (2013.0, 4.0e5, 2.5e5),
        (2014.0, 6.0e5, 3.6e5),
    ]);
    htc.ccdata = ccdata;
    data.costcov.insert("HTC".into(), block);
    htc.fit_costcov(0.8, whole_population);
    htc.basespend = 6.0e5;
    progset.add(htc)?;

    let mut art = Program::new("ART", "Antiretroviral therapy");
    art.effects.push(Effect::new(InputKey::new("numfirstline"), PopTarget::All));
    art.ccopars.push(CovOut::new(Vec::new()));
    let (ccdata, block) = costcov_points(&[
        (2013.0, 4.5e6, 1.2e4),
        (2014.0, 6.0e6, 1.5e4),
    ]);
    art.ccdata = ccdata;
    data.costcov.insert("ART".into(), block);
    art.fit_costcov(0.9, whole_population);
    art.basespend = 6.0e6;
    progset.add(art)?;

    let mut pmtct = Program::new("PMTCT", "Prevention of mother-to-child transmission");
    pmtct.effects.push(Effect::new(InputKey::new("numpmtct"), PopTarget::All));
    pmtct.ccopars.push(CovOut::new(Vec::new()));
    pmtct.nonhiv_dalys = 0.05;
    let (ccdata, block) = costcov_points(&[(2014.0, 3.0e5, 3.0e3)]);
    pmtct.ccdata = ccdata;
    data.costcov.insert("PMTCT".into(), block);
    pmtct.fit_costcov(0.9, 40_000.0);
    pmtct.basespend = 3.0e5;
    progset.add(pmtct)?;

    // Overhead spending with no modelled effects; pinned in optimizations.
    let mut mgmt = Program::new("MGMT", "Management");
    mgmt.basespend = 5.0e5;
    progset.add(mgmt)?;

    Ok(progset)
}

/// Build the complete example project.
pub fn demo_project() -> Result<Project> {
    let mut project = Project::new("example");
    let populations = demo_populations()?;
    let mut data = demo_data();
    let progset = demo_progset(&mut data)?;
    project.hydrate(populations, data);
    project.make_parset(PARSET_NAME)?;
    project.add_progset(progset);
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_shape() {
        let project = demo_project().unwrap();
        assert_eq!(project.populations.len(), 6);
        assert_eq!(project.progsets()[0].item.len(), 7);
        assert_eq!(project.data.data_start(), Some(2000.0));
        assert_eq!(project.data.data_end(), Some(2015.0));
    }

    #[test]
    fn test_demo_optimizable_programs() {
        let project = demo_project().unwrap();
        let progset = &project.progsets()[0].item;
        // MGMT is overhead; the other six are optimizable.
        assert_eq!(progset.n_optimizable(), 6);
        assert!(!progset.get("MGMT").unwrap().is_optimizable());
    }

    #[test]
    fn test_demo_costcov_fits_cleanly() {
        let project = demo_project().unwrap();
        let progset = &project.progsets()[0].item;
        for prog in progset.programs() {
            if prog.is_optimizable() {
                assert!(
                    prog.ccpars.fallbacks.is_empty(),
                    "program {} fell back to defaults",
                    prog.short
                );
            }
        }
    }
}
