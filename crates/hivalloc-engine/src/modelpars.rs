//! The model-parameter builder: materializes the time-discretized tensors
//! consumed by the simulator from a parameter store, and merges
//! budget-derived overlays over them.

use ndarray::{Array1, Array2, Array3};

use hivalloc_core::{
    key_spec, Constants, Error, InputKey, Locus, ParameterOverlay, ParameterSet, PopulationSet,
    Result, TimeGrid,
};

const EPS: f64 = 1e-3;

/// Per-act-type container.
#[derive(Clone, Debug, PartialEq)]
pub struct ByAct<T> {
    pub reg: T,
    pub cas: T,
    pub com: T,
    pub inj: T,
}

impl<T> ByAct<T> {
    pub fn get(&self, act: ActType) -> &T {
        match act {
            ActType::Regular => &self.reg,
            ActType::Casual => &self.cas,
            ActType::Commercial => &self.com,
            ActType::Injecting => &self.inj,
        }
    }
}

/// The four transmission routes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActType {
    Regular,
    Casual,
    Commercial,
    Injecting,
}

impl ActType {
    pub const SEXUAL: [ActType; 3] = [ActType::Regular, ActType::Casual, ActType::Commercial];
    pub const ALL: [ActType; 4] = [
        ActType::Regular,
        ActType::Casual,
        ActType::Commercial,
        ActType::Injecting,
    ];
}

/// Condom-use probabilities per sexual act type (npops x npts).
#[derive(Clone, Debug, PartialEq)]
pub struct CondomPars {
    pub reg: Array2<f64>,
    pub cas: Array2<f64>,
    pub com: Array2<f64>,
}

impl CondomPars {
    pub fn get(&self, act: ActType) -> &Array2<f64> {
        match act {
            ActType::Regular => &self.reg,
            ActType::Casual => &self.cas,
            ActType::Commercial => &self.com,
            ActType::Injecting => unreachable!("condoms do not apply to injecting"),
        }
    }
}

/// Everything the simulator consumes, on the simulation grid.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelPars {
    pub tvec: Vec<f64>,
    pub dt: f64,

    /// Population sizes (npops x npts).
    pub popsize: Array2<f64>,
    /// Initial HIV prevalence per population.
    pub hivprev: Vec<f64>,

    /// Background (non-HIV) mortality rate.
    pub death: Array2<f64>,
    pub stiprevulc: Array2<f64>,
    pub tbprev: Array2<f64>,

    pub hivtest: Array2<f64>,
    pub aidstest: Array1<f64>,
    pub propaware: Array2<f64>,
    /// First- and second-line treatment number targets.
    pub tx1: Array1<f64>,
    pub tx2: Array1<f64>,
    /// CD4 treatment-eligibility threshold over time.
    pub txelig: Array1<f64>,
    /// Total treatment target (number or proportion); zero disables it.
    pub txtotal: Array1<f64>,

    pub numpmtct: Array1<f64>,
    pub birth: Array2<f64>,
    pub breast: Array1<f64>,

    pub circum: Array2<f64>,
    pub numcircum: Array2<f64>,
    pub prep: Array2<f64>,
    pub pep: Array2<f64>,

    pub numost: Array1<f64>,
    pub sharing: Array1<f64>,

    pub numacts: ByAct<Array2<f64>>,
    pub condom: CondomPars,
    pub pships: ByAct<Array2<f64>>,
    /// Symmetric and asymmetric population transition matrices.
    pub transit_sym: Array2<f64>,
    pub transit_asym: Array2<f64>,

    /// Balanced acts per person per year (npops x npops x npts) per type.
    pub totalacts: ByAct<Array3<f64>>,

    pub consts: Constants,
}

fn values_or(
    parset: &ParameterSet,
    key: &InputKey,
    tvec: &[f64],
    npops: usize,
    default: f64,
) -> Result<Array2<f64>> {
    if parset.contains(key) {
        parset.values(key, tvec)
    } else {
        Ok(Array2::from_elem((npops, tvec.len()), default))
    }
}

fn series_or(
    parset: &ParameterSet,
    key: &InputKey,
    tvec: &[f64],
    default: f64,
) -> Result<Array1<f64>> {
    if parset.contains(key) {
        parset.series(key, tvec)
    } else {
        Ok(Array1::from_elem(tvec.len(), default))
    }
}

fn matrix_or(parset: &ParameterSet, key: &InputKey, npops: usize) -> Result<Array2<f64>> {
    if parset.contains(key) {
        parset.matrix(key)
    } else {
        Ok(Array2::zeros((npops, npops)))
    }
}

impl ModelPars {
    /// Build the full tensor set from a parameter store.
    pub fn from_parset(
        parset: &ParameterSet,
        popset: &PopulationSet,
        grid: &TimeGrid,
    ) -> Result<Self> {
        let tvec = grid.tvec();
        let npops = popset.len();
        if parset.npops() != npops {
            return Err(Error::ShapeMismatch {
                expected: format!("{} populations", npops),
                actual: format!("{}", parset.npops()),
                locus: Locus::parameter("parset"),
            });
        }

        let popsize = parset.values(&InputKey::new("popsize"), &tvec)?;
        let hivprev_key = InputKey::new("hivprev");
        let mut hivprev = Vec::with_capacity(npops);
        for pop in 0..npops {
            hivprev.push(parset.get(&hivprev_key, tvec[0], Some(pop))?);
        }

        let numacts = ByAct {
            reg: values_or(parset, &InputKey::sub("numacts", "reg"), &tvec, npops, 0.0)?,
            cas: values_or(parset, &InputKey::sub("numacts", "cas"), &tvec, npops, 0.0)?,
            com: values_or(parset, &InputKey::sub("numacts", "com"), &tvec, npops, 0.0)?,
            inj: values_or(parset, &InputKey::sub("numacts", "inj"), &tvec, npops, 0.0)?,
        };
        let pships = ByAct {
            reg: matrix_or(parset, &InputKey::sub("pships", "reg"), npops)?,
            cas: matrix_or(parset, &InputKey::sub("pships", "cas"), npops)?,
            com: matrix_or(parset, &InputKey::sub("pships", "com"), npops)?,
            inj: matrix_or(parset, &InputKey::sub("pships", "inj"), npops)?,
        };

        let mut pars = ModelPars {
            dt: grid.dt,
            popsize: popsize.clone(),
            hivprev,
            death: values_or(parset, &InputKey::new("death"), &tvec, npops, 0.0)?,
            stiprevulc: values_or(parset, &InputKey::new("stiprevulc"), &tvec, npops, 0.0)?,
            tbprev: values_or(parset, &InputKey::new("tbprev"), &tvec, npops, 0.0)?,
            hivtest: values_or(parset, &InputKey::new("hivtest"), &tvec, npops, 0.0)?,
            aidstest: series_or(parset, &InputKey::new("aidstest"), &tvec, 0.0)?,
            propaware: values_or(parset, &InputKey::new("propaware"), &tvec, npops, 0.0)?,
            tx1: series_or(parset, &InputKey::new("numfirstline"), &tvec, 0.0)?,
            tx2: series_or(parset, &InputKey::new("numsecondline"), &tvec, 0.0)?,
            txelig: series_or(parset, &InputKey::new("txelig"), &tvec, 500.0)?,
            txtotal: series_or(parset, &InputKey::new("txtotal"), &tvec, 0.0)?,
            numpmtct: series_or(parset, &InputKey::new("numpmtct"), &tvec, 0.0)?,
            birth: values_or(parset, &InputKey::new("birth"), &tvec, npops, 0.0)?,
            breast: series_or(parset, &InputKey::new("breast"), &tvec, 0.0)?,
            circum: values_or(parset, &InputKey::new("circum"), &tvec, npops, 0.0)?,
            numcircum: values_or(parset, &InputKey::new("numcircum"), &tvec, npops, 0.0)?,
            prep: values_or(parset, &InputKey::new("prep"), &tvec, npops, 0.0)?,
            pep: values_or(parset, &InputKey::new("pep"), &tvec, npops, 0.0)?,
            numost: series_or(parset, &InputKey::new("numost"), &tvec, 0.0)?,
            sharing: series_or(parset, &InputKey::new("sharing"), &tvec, 0.0)?,
            condom: CondomPars {
                reg: values_or(parset, &InputKey::sub("condom", "reg"), &tvec, npops, 0.0)?,
                cas: values_or(parset, &InputKey::sub("condom", "cas"), &tvec, npops, 0.0)?,
                com: values_or(parset, &InputKey::sub("condom", "com"), &tvec, npops, 0.0)?,
            },
            totalacts: ByAct {
                reg: Array3::zeros((npops, npops, tvec.len())),
                cas: Array3::zeros((npops, npops, tvec.len())),
                com: Array3::zeros((npops, npops, tvec.len())),
                inj: Array3::zeros((npops, npops, tvec.len())),
            },
            numacts,
            pships,
            transit_sym: matrix_or(parset, &InputKey::sub("transit", "sym"), npops)?,
            transit_asym: matrix_or(parset, &InputKey::sub("transit", "asym"), npops)?,
            consts: parset.constants,
            tvec,
        };
        pars.recompute_totalacts();
        Ok(pars)
    }

    pub fn npops(&self) -> usize {
        self.popsize.shape()[0]
    }

    pub fn npts(&self) -> usize {
        self.tvec.len()
    }

    /// Recompute the balanced acts tensors from the partnership matrices,
    /// per-population act numbers, and population sizes.
    pub fn recompute_totalacts(&mut self) {
        self.totalacts = ByAct {
            reg: total_acts(&self.pships.reg, &self.numacts.reg, &self.popsize),
            cas: total_acts(&self.pships.cas, &self.numacts.cas, &self.popsize),
            com: total_acts(&self.pships.com, &self.numacts.com, &self.popsize),
            inj: total_acts(&self.pships.inj, &self.numacts.inj, &self.popsize),
        };
    }

    /// Merge a budget-derived overlay over these parameters, replacing the
    /// overlaid series from the overlay's start index onward and clipping
    /// to each key's declared range.
    pub fn apply_overlay(&mut self, overlay: &ParameterOverlay) -> Result<()> {
        let npts = self.npts();
        if !overlay.entries.is_empty() && overlay.tvec.len() != npts {
            return Err(Error::ShapeMismatch {
                expected: format!("{} grid points", npts),
                actual: format!("{}", overlay.tvec.len()),
                locus: Locus::parameter("overlay"),
            });
        }
        let start = overlay.start_index.min(npts);
        for entry in &overlay.entries {
            if entry.values.len() != npts {
                return Err(Error::ShapeMismatch {
                    expected: format!("{} values", npts),
                    actual: format!("{}", entry.values.len()),
                    locus: Locus::parameter(entry.key.to_string()),
                });
            }
            let (_, range) = key_spec(&entry.key)?;
            let (low, high) = range.bounds();
            let clipped: Vec<f64> = entry.values.iter().map(|v| v.clamp(low, high)).collect();
            let name = entry.key.to_string();
            match name.as_str() {
                "hivtest" | "stiprevulc" | "tbprev" | "death" | "prep" | "pep" | "circum"
                | "numcircum" | "birth" | "propaware" => {
                    let arr = match name.as_str() {
                        "hivtest" => &mut self.hivtest,
                        "stiprevulc" => &mut self.stiprevulc,
                        "tbprev" => &mut self.tbprev,
                        "death" => &mut self.death,
                        "prep" => &mut self.prep,
                        "pep" => &mut self.pep,
                        "circum" => &mut self.circum,
                        "numcircum" => &mut self.numcircum,
                        "birth" => &mut self.birth,
                        _ => &mut self.propaware,
                    };
                    apply_rows(arr, entry.pop, &clipped, start);
                }
                "condom.reg" => apply_rows(&mut self.condom.reg, entry.pop, &clipped, start),
                "condom.cas" => apply_rows(&mut self.condom.cas, entry.pop, &clipped, start),
                "condom.com" => apply_rows(&mut self.condom.com, entry.pop, &clipped, start),
                "numacts.reg" => apply_rows(&mut self.numacts.reg, entry.pop, &clipped, start),
                "numacts.cas" => apply_rows(&mut self.numacts.cas, entry.pop, &clipped, start),
                "numacts.com" => apply_rows(&mut self.numacts.com, entry.pop, &clipped, start),
                "numacts.inj" => apply_rows(&mut self.numacts.inj, entry.pop, &clipped, start),
                "aidstest" | "numost" | "sharing" | "breast" | "numpmtct" | "txelig"
                | "txtotal" | "numfirstline" | "numsecondline" => {
                    let arr = match name.as_str() {
                        "aidstest" => &mut self.aidstest,
                        "numost" => &mut self.numost,
                        "sharing" => &mut self.sharing,
                        "breast" => &mut self.breast,
                        "numpmtct" => &mut self.numpmtct,
                        "txelig" => &mut self.txelig,
                        "txtotal" => &mut self.txtotal,
                        "numfirstline" => &mut self.tx1,
                        _ => &mut self.tx2,
                    };
                    for j in start..npts {
                        arr[j] = clipped[j];
                    }
                }
                _ => {
                    return Err(Error::UnknownKey { key: name });
                }
            }
        }
        self.recompute_totalacts();
        Ok(())
    }
}

fn apply_rows(arr: &mut Array2<f64>, pop: Option<usize>, values: &[f64], start: usize) {
    let (npops, npts) = (arr.shape()[0], arr.shape()[1]);
    match pop {
        Some(p) if p < npops => {
            for j in start..npts {
                arr[[p, j]] = values[j];
            }
        }
        Some(_) => {}
        None => {
            for p in 0..npops {
                for j in start..npts {
                    arr[[p, j]] = values[j];
                }
            }
        }
    }
}

/// Balanced total acts per person per year.
///
/// The partnership matrix is symmetrized, scaled into a total-acts estimate
/// per ordered pair, and the two per-population estimates reconciled by
/// population-size weighting.
fn total_acts(pships: &Array2<f64>, numacts: &Array2<f64>, popsize: &Array2<f64>) -> Array3<f64> {
    let npops = popsize.shape()[0];
    let npts = popsize.shape()[1];
    let mut out = Array3::zeros((npops, npops, npts));
    if pships.iter().all(|&v| v == 0.0) {
        return out;
    }

    let mut sym = Array2::zeros((npops, npops));
    for i in 0..npops {
        for j in 0..npops {
            let nz = (pships[[i, j]] > 0.0) as usize + (pships[[j, i]] > 0.0) as usize;
            sym[[i, j]] = (pships[[i, j]] + pships[[j, i]]) / (EPS + nz as f64);
        }
    }

    for t in 0..npts {
        let balanced = reconcile_acts(&sym, popsize, numacts, t);
        for i in 0..npops {
            for j in 0..npops {
                out[[i, j, t]] = balanced[[i, j]];
            }
        }
    }
    out
}

fn reconcile_acts(
    sym: &Array2<f64>,
    popsize: &Array2<f64>,
    numacts: &Array2<f64>,
    t: usize,
) -> Array2<f64> {
    let npops = sym.shape()[0];
    let mut work = sym.clone();
    for i in 0..npops {
        for j in 0..npops {
            work[[i, j]] *= popsize[[i, t]];
        }
    }
    // Normalize each column into a mixing probability, then scale by the
    // partner population's total acts.
    for j in 0..npops {
        let colsum: f64 = (0..npops).map(|i| work[[i, j]]).sum();
        for i in 0..npops {
            work[[i, j]] = popsize[[j, t]] * numacts[[j, t]] * work[[i, j]] / (EPS + colsum);
        }
    }
    // Reconcile the two estimates for each unordered pair.
    let mut balanced = Array2::zeros((npops, npops));
    for i in 0..npops {
        for j in 0..npops {
            let ni = popsize[[i, t]];
            let nj = popsize[[j, t]];
            let total = (work[[i, j]] * ni + work[[j, i]] * nj) / (ni + nj + EPS);
            balanced[[j, i]] = total / (nj + EPS);
            balanced[[i, j]] = total / (ni + EPS);
        }
    }
    balanced
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivalloc_core::{Anchors, Par, Population};

    fn popset() -> PopulationSet {
        PopulationSet::new(vec![
            Population::new("M", "Males 15-49").male(),
            Population::new("F", "Females 15-49").female(),
        ])
        .unwrap()
    }

    fn parset(pops: &PopulationSet) -> ParameterSet {
        let mut parset = ParameterSet::new("default", pops);
        parset
            .insert(
                InputKey::new("popsize"),
                Par::PopulationSize {
                    init: vec![1e6, 1e6],
                    growth: 0.02,
                    t0: 2000.0,
                },
            )
            .unwrap();
        parset
            .insert(
                InputKey::new("hivprev"),
                Par::PerPopulation(vec![
                    Anchors::new(vec![2000.0], vec![0.05]),
                    Anchors::new(vec![2000.0], vec![0.08]),
                ]),
            )
            .unwrap();
        parset
            .insert(
                InputKey::sub("numacts", "reg"),
                Par::PerPopulation(vec![
                    Anchors::new(vec![2000.0], vec![80.0]),
                    Anchors::new(vec![2000.0], vec![80.0]),
                ]),
            )
            .unwrap();
        parset
            .insert(
                InputKey::sub("pships", "reg"),
                Par::Matrix(vec![vec![0.0, 1.0], vec![1.0, 0.0]]),
            )
            .unwrap();
        parset
    }

    #[test]
    fn test_shapes() {
        let pops = popset();
        let parset = parset(&pops);
        let grid = TimeGrid::new(2000.0, 2010.0, 0.5);
        let pars = ModelPars::from_parset(&parset, &pops, &grid).unwrap();
        assert_eq!(pars.popsize.shape(), &[2, 21]);
        assert_eq!(pars.totalacts.reg.shape(), &[2, 2, 21]);
        assert_eq!(pars.aidstest.len(), 21);
    }

    #[test]
    fn test_acts_balance() {
        let pops = popset();
        let parset = parset(&pops);
        let grid = TimeGrid::new(2000.0, 2001.0, 1.0);
        let pars = ModelPars::from_parset(&parset, &pops, &grid).unwrap();
        // Equal population sizes and equal declared acts: total acts must
        // balance across the partnership.
        let a = pars.totalacts.reg[[0, 1, 0]] * pars.popsize[[0, 0]];
        let b = pars.totalacts.reg[[1, 0, 0]] * pars.popsize[[1, 0]];
        assert!((a - b).abs() / a < 1e-6);
        assert!(a > 0.0);
    }

    #[test]
    fn test_overlay_merge_and_clip() {
        let pops = popset();
        let parset = parset(&pops);
        let grid = TimeGrid::new(2000.0, 2002.0, 1.0);
        let mut pars = ModelPars::from_parset(&parset, &pops, &grid).unwrap();
        let mut overlay = ParameterOverlay::new(grid.tvec(), 1);
        overlay.push(InputKey::sub("condom", "reg"), Some(0), vec![0.5, 0.5, 1.8]);
        pars.apply_overlay(&overlay).unwrap();
        // Before the start index the baseline (zero) is kept.
        assert_eq!(pars.condom.reg[[0, 0]], 0.0);
        assert_eq!(pars.condom.reg[[0, 1]], 0.5);
        // Probability clipped to 1.
        assert_eq!(pars.condom.reg[[0, 2]], 1.0);
    }

    #[test]
    fn test_overlay_idempotent() {
        let pops = popset();
        let parset = parset(&pops);
        let grid = TimeGrid::new(2000.0, 2002.0, 1.0);
        let mut once = ModelPars::from_parset(&parset, &pops, &grid).unwrap();
        let mut overlay = ParameterOverlay::new(grid.tvec(), 0);
        overlay.push(InputKey::new("hivtest"), Some(1), vec![0.3, 0.3, 0.3]);
        once.apply_overlay(&overlay).unwrap();
        let mut twice = once.clone();
        twice.apply_overlay(&overlay).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_overlay_shape_mismatch() {
        let pops = popset();
        let parset = parset(&pops);
        let grid = TimeGrid::new(2000.0, 2002.0, 1.0);
        let mut pars = ModelPars::from_parset(&parset, &pops, &grid).unwrap();
        let mut overlay = ParameterOverlay::new(grid.tvec(), 0);
        overlay.push(InputKey::new("hivtest"), Some(0), vec![0.5]);
        assert!(matches!(
            pars.apply_overlay(&overlay),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
