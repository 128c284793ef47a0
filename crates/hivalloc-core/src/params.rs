//! The parameter store: named epidemiological parameters over
//! (population x time), with range enforcement and linear interpolation.
//!
//! Keys are two-level `group[.field]` names ("hivtest", "condom.reg").
//! Each key has a declared domain (scalar series, per-population series,
//! population matrix, or the exponential population-size form) and a range
//! class (probability, rate, count, proportion). Writes outside the range
//! fail with [`Error::OutOfRange`]; unknown keys with [`Error::UnknownKey`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Locus, Result};
use crate::populations::PopulationSet;
use crate::settings::NCD4;

/// A parameter input key: a group name plus an optional field,
/// e.g. `("condom","reg")` or `("hivtest",)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputKey {
    pub group: String,
    pub field: Option<String>,
}

impl InputKey {
    pub fn new(group: impl Into<String>) -> Self {
        InputKey {
            group: group.into(),
            field: None,
        }
    }

    pub fn sub(group: impl Into<String>, field: impl Into<String>) -> Self {
        InputKey {
            group: group.into(),
            field: Some(field.into()),
        }
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}", self.group, field),
            None => write!(f, "{}", self.group),
        }
    }
}

impl FromStr for InputKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(2, '.');
        let group = parts.next().unwrap_or_default();
        if group.is_empty() {
            return Err(Error::UnknownKey { key: s.to_string() });
        }
        Ok(match parts.next() {
            Some(field) => InputKey::sub(group, field),
            None => InputKey::new(group),
        })
    }
}

impl Serialize for InputKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InputKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(|_| D::Error::custom("invalid input key"))
    }
}

/// Range class declared per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Range {
    Probability,
    Rate,
    Count,
    Proportion,
}

impl Range {
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Range::Probability | Range::Proportion => (0.0, 1.0),
            Range::Rate | Range::Count => (0.0, f64::INFINITY),
        }
    }

    pub fn check(self, value: f64, locus: Locus) -> Result<()> {
        let (low, high) = self.bounds();
        if value.is_nan() || value < low || value > high {
            return Err(Error::OutOfRange {
                value,
                low,
                high,
                locus,
            });
        }
        Ok(())
    }
}

/// Declared domain of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Domain {
    /// One time series shared by all populations.
    Scalar,
    /// One time series per population.
    PerPopulation,
    /// A population x population matrix, constant in time.
    Matrix,
    /// Initial sizes plus an exponential growth rate.
    PopulationSize,
}

/// The registry of known input keys with their domains and ranges.
const KEY_REGISTRY: &[(&str, Domain, Range)] = &[
    ("popsize", Domain::PopulationSize, Range::Count),
    ("hivprev", Domain::PerPopulation, Range::Probability),
    ("death", Domain::PerPopulation, Range::Rate),
    ("stiprevulc", Domain::PerPopulation, Range::Probability),
    ("tbprev", Domain::PerPopulation, Range::Probability),
    ("hivtest", Domain::PerPopulation, Range::Rate),
    ("aidstest", Domain::Scalar, Range::Rate),
    ("numfirstline", Domain::Scalar, Range::Count),
    ("numsecondline", Domain::Scalar, Range::Count),
    ("txelig", Domain::Scalar, Range::Count),
    ("txtotal", Domain::Scalar, Range::Count),
    ("propaware", Domain::PerPopulation, Range::Proportion),
    ("prep", Domain::PerPopulation, Range::Proportion),
    ("pep", Domain::PerPopulation, Range::Proportion),
    ("numpmtct", Domain::Scalar, Range::Count),
    ("birth", Domain::PerPopulation, Range::Rate),
    ("breast", Domain::Scalar, Range::Proportion),
    ("numacts.reg", Domain::PerPopulation, Range::Rate),
    ("numacts.cas", Domain::PerPopulation, Range::Rate),
    ("numacts.com", Domain::PerPopulation, Range::Rate),
    ("numacts.inj", Domain::PerPopulation, Range::Rate),
    ("condom.reg", Domain::PerPopulation, Range::Probability),
    ("condom.cas", Domain::PerPopulation, Range::Probability),
    ("condom.com", Domain::PerPopulation, Range::Probability),
    ("circum", Domain::PerPopulation, Range::Proportion),
    ("numcircum", Domain::PerPopulation, Range::Count),
    ("numost", Domain::Scalar, Range::Count),
    ("sharing", Domain::Scalar, Range::Proportion),
    ("pships.reg", Domain::Matrix, Range::Rate),
    ("pships.cas", Domain::Matrix, Range::Rate),
    ("pships.com", Domain::Matrix, Range::Rate),
    ("pships.inj", Domain::Matrix, Range::Rate),
    ("transit.sym", Domain::Matrix, Range::Rate),
    ("transit.asym", Domain::Matrix, Range::Rate),
];

/// Look up the registry entry for `key`.
pub fn key_spec(key: &InputKey) -> Result<(Domain, Range)> {
    let name = key.to_string();
    KEY_REGISTRY
        .iter()
        .find(|(k, _, _)| *k == name)
        .map(|(_, d, r)| (*d, *r))
        .ok_or(Error::UnknownKey { key: name })
}

/// Keys whose program effects are coverage counts rather than CCO-mapped
/// parameter values (spec: the coverage-parameter special case).
pub const COVERAGE_KEYS: &[&str] = &[
    "numfirstline",
    "numsecondline",
    "numpmtct",
    "numost",
    "numcircum",
];

pub fn is_coverage_key(key: &InputKey) -> bool {
    let name = key.to_string();
    COVERAGE_KEYS.iter().any(|k| *k == name)
}

/// Year-anchored series for one population.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Anchors {
    pub t: Vec<f64>,
    pub y: Vec<f64>,
}

impl Anchors {
    pub fn new(t: Vec<f64>, y: Vec<f64>) -> Self {
        Anchors { t, y }
    }

    /// Linear interpolation between anchors, held constant outside.
    pub fn interp(&self, t: f64) -> Option<f64> {
        if self.t.is_empty() {
            return None;
        }
        if t <= self.t[0] {
            return Some(self.y[0]);
        }
        let last = self.t.len() - 1;
        if t >= self.t[last] {
            return Some(self.y[last]);
        }
        let hi = self.t.iter().position(|&a| a > t).unwrap_or(last);
        let lo = hi - 1;
        let frac = (t - self.t[lo]) / (self.t[hi] - self.t[lo]);
        Some(self.y[lo] + frac * (self.y[hi] - self.y[lo]))
    }

    /// Insert or replace the anchor at year `t`, keeping anchors sorted.
    pub fn upsert(&mut self, t: f64, y: f64) {
        match self.t.iter().position(|&a| (a - t).abs() < 1e-9) {
            Some(i) => self.y[i] = y,
            None => {
                let i = self.t.iter().position(|&a| a > t).unwrap_or(self.t.len());
                self.t.insert(i, t);
                self.y.insert(i, y);
            }
        }
    }
}

/// A stored parameter in one of the declared domains.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Par {
    /// One time series shared by all populations.
    Scalar(Anchors),
    /// One time series per population (outer index = population).
    PerPopulation(Vec<Anchors>),
    /// Population x population matrix.
    Matrix(Vec<Vec<f64>>),
    /// Exponential population-size form: `init * exp(growth * (t - t0))`.
    PopulationSize {
        init: Vec<f64>,
        growth: f64,
        t0: f64,
    },
}

/// Per-CD4-stage constant values.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageVals {
    pub acute: f64,
    pub gt500: f64,
    pub gt350: f64,
    pub gt200: f64,
    pub gt50: f64,
    pub lt50: f64,
}

impl StageVals {
    pub fn as_array(&self) -> [f64; NCD4] {
        [
            self.acute, self.gt500, self.gt350, self.gt200, self.gt50, self.lt50,
        ]
    }
}

/// Per-act transmission probabilities.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransConsts {
    /// Male insertive with a female partner.
    pub mfi: f64,
    /// Female receptive with a male partner.
    pub mfr: f64,
    /// Male insertive with a male partner.
    pub mmi: f64,
    /// Male receptive with a male partner.
    pub mmr: f64,
    /// Shared injecting equipment.
    pub inj: f64,
    /// Mother-to-child, breastfeeding.
    pub mtctbreast: f64,
    /// Mother-to-child, no breastfeeding.
    pub mtctnobreast: f64,
}

/// HIV-related death rates by stage plus on-treatment and TB terms.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeathConsts {
    pub stage: StageVals,
    /// Death rate while virally suppressed on treatment.
    pub treat: f64,
    /// Relative increase in death rate per unit TB prevalence.
    pub tb: f64,
}

/// Intervention efficacies, stored directly as efficacies in [0,1]
/// (the force-of-infection applies `1 - coverage * efficacy`).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffConsts {
    pub condom: f64,
    pub circ: f64,
    /// Transmission reduction from post-diagnosis behavior change.
    pub dx: f64,
    /// Relative transmissibility increase per unit ulcerative-STI prevalence.
    pub sti: f64,
    pub ost: f64,
    pub pmtct: f64,
    /// Viral suppression on treatment.
    pub tx: f64,
    pub prep: f64,
    pub pep: f64,
}

/// Disability weights by stage, plus the on-treatment weight.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisutilConsts {
    pub stage: StageVals,
    pub tx: f64,
}

/// The typed constants block of the parameter store.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constants {
    pub trans: TransConsts,
    /// Relative infectiousness by CD4 stage.
    pub cd4trans: StageVals,
    /// Progression rates between consecutive stages (acute -> ... -> lt50).
    pub prog: [f64; NCD4 - 1],
    /// On-treatment recovery rates, one per stage that can recover upward
    /// (gt350 -> gt500 through lt50 -> gt50; none into acute).
    pub recov: [f64; NCD4 - 2],
    /// First- and second-line treatment failure rates per year.
    pub failfirst: f64,
    pub failsecond: f64,
    pub death: DeathConsts,
    pub eff: EffConsts,
    pub disutil: DisutilConsts,
    /// Years of life lost per HIV death, for the YLL component of DALYs.
    pub yearslostperdeath: f64,
}

impl Default for Constants {
    fn default() -> Self {
        Constants {
            trans: TransConsts {
                mfi: 0.0004,
                mfr: 0.0008,
                mmi: 0.0011,
                mmr: 0.0138,
                inj: 0.008,
                mtctbreast: 0.35,
                mtctnobreast: 0.205,
            },
            cd4trans: StageVals {
                acute: 6.0,
                gt500: 1.0,
                gt350: 1.0,
                gt200: 1.5,
                gt50: 2.0,
                lt50: 3.0,
            },
            prog: [4.0, 0.22, 0.35, 0.45, 0.6],
            recov: [0.35, 0.45, 0.55, 0.65],
            failfirst: 0.16,
            failsecond: 0.10,
            death: DeathConsts {
                stage: StageVals {
                    acute: 0.005,
                    gt500: 0.004,
                    gt350: 0.01,
                    gt200: 0.05,
                    gt50: 0.27,
                    lt50: 0.7,
                },
                treat: 0.023,
                tb: 1.5,
            },
            eff: EffConsts {
                condom: 0.95,
                circ: 0.58,
                dx: 0.5,
                sti: 3.0,
                ost: 0.54,
                pmtct: 0.9,
                tx: 0.92,
                prep: 0.73,
                pep: 0.8,
            },
            disutil: DisutilConsts {
                stage: StageVals {
                    acute: 0.146,
                    gt500: 0.008,
                    gt350: 0.036,
                    gt200: 0.079,
                    gt50: 0.27,
                    lt50: 0.547,
                },
                tx: 0.053,
            },
            yearslostperdeath: 15.0,
        }
    }
}

/// A named parameter store: input key -> [`Par`], plus the constants block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub name: String,
    pars: BTreeMap<InputKey, Par>,
    pub constants: Constants,
    npops: usize,
}

impl ParameterSet {
    pub fn new(name: impl Into<String>, popset: &PopulationSet) -> Self {
        ParameterSet {
            name: name.into(),
            pars: BTreeMap::new(),
            constants: Constants::default(),
            npops: popset.len(),
        }
    }

    pub fn npops(&self) -> usize {
        self.npops
    }

    pub fn keys(&self) -> impl Iterator<Item = &InputKey> {
        self.pars.keys()
    }

    pub fn contains(&self, key: &InputKey) -> bool {
        self.pars.contains_key(key)
    }

    /// Install a whole parameter, checking its domain and shape.
    pub fn insert(&mut self, key: InputKey, par: Par) -> Result<()> {
        let (domain, range) = key_spec(&key)?;
        let locus = Locus::parameter(key.to_string());
        match (&par, domain) {
            (Par::Scalar(anchors), Domain::Scalar) => {
                for (&t, &y) in anchors.t.iter().zip(&anchors.y) {
                    range.check(y, locus.clone().with_year(t))?;
                }
            }
            (Par::PerPopulation(rows), Domain::PerPopulation) => {
                if rows.len() != self.npops {
                    return Err(Error::ShapeMismatch {
                        expected: format!("{} populations", self.npops),
                        actual: format!("{} rows", rows.len()),
                        locus,
                    });
                }
                for anchors in rows {
                    for (&t, &y) in anchors.t.iter().zip(&anchors.y) {
                        range.check(y, locus.clone().with_year(t))?;
                    }
                }
            }
            (Par::Matrix(m), Domain::Matrix) => {
                if m.len() != self.npops || m.iter().any(|row| row.len() != self.npops) {
                    return Err(Error::ShapeMismatch {
                        expected: format!("{0}x{0} matrix", self.npops),
                        actual: format!("{} rows", m.len()),
                        locus,
                    });
                }
            }
            (Par::PopulationSize { init, .. }, Domain::PopulationSize) => {
                if init.len() != self.npops {
                    return Err(Error::ShapeMismatch {
                        expected: format!("{} populations", self.npops),
                        actual: format!("{} entries", init.len()),
                        locus,
                    });
                }
            }
            _ => {
                return Err(Error::ShapeMismatch {
                    expected: format!("{:?} parameter", domain),
                    actual: "different domain".into(),
                    locus,
                })
            }
        }
        self.pars.insert(key, par);
        Ok(())
    }

    /// Write one anchor value, with range enforcement.
    ///
    /// `pop` is required for per-population keys and ignored for scalar keys.
    pub fn set(&mut self, key: &InputKey, pop: Option<usize>, t: f64, value: f64) -> Result<()> {
        let (domain, range) = key_spec(key)?;
        let locus = Locus::parameter(key.to_string()).with_year(t);
        range.check(value, locus.clone())?;
        match domain {
            Domain::Scalar => {
                let par = self
                    .pars
                    .entry(key.clone())
                    .or_insert_with(|| Par::Scalar(Anchors::default()));
                if let Par::Scalar(anchors) = par {
                    anchors.upsert(t, value);
                }
            }
            Domain::PerPopulation => {
                let pop = pop.ok_or_else(|| Error::NoData {
                    locus: locus.clone(),
                })?;
                if pop >= self.npops {
                    return Err(Error::ShapeMismatch {
                        expected: format!("population index < {}", self.npops),
                        actual: format!("{}", pop),
                        locus,
                    });
                }
                let npops = self.npops;
                let par = self
                    .pars
                    .entry(key.clone())
                    .or_insert_with(|| Par::PerPopulation(vec![Anchors::default(); npops]));
                if let Par::PerPopulation(rows) = par {
                    rows[pop].upsert(t, value);
                }
            }
            Domain::Matrix | Domain::PopulationSize => {
                return Err(Error::ShapeMismatch {
                    expected: "time-series parameter".into(),
                    actual: format!("{:?}", domain),
                    locus,
                });
            }
        }
        Ok(())
    }

    /// Read a single interpolated value.
    pub fn get(&self, key: &InputKey, t: f64, pop: Option<usize>) -> Result<f64> {
        let par = self.pars.get(key).ok_or_else(|| Error::UnknownKey {
            key: key.to_string(),
        })?;
        let locus = Locus::parameter(key.to_string()).with_year(t);
        match par {
            Par::Scalar(anchors) => anchors.interp(t).ok_or(Error::NoData { locus }),
            Par::PerPopulation(rows) => {
                let pop = pop.ok_or_else(|| Error::NoData {
                    locus: locus.clone(),
                })?;
                rows.get(pop)
                    .and_then(|a| a.interp(t))
                    .ok_or(Error::NoData { locus })
            }
            Par::PopulationSize { init, growth, t0 } => {
                let pop = pop.ok_or_else(|| Error::NoData {
                    locus: locus.clone(),
                })?;
                init.get(pop)
                    .map(|&n| n * (growth * (t - t0)).exp())
                    .ok_or(Error::NoData { locus })
            }
            Par::Matrix(_) => Err(Error::ShapeMismatch {
                expected: "time-series parameter".into(),
                actual: "matrix".into(),
                locus,
            }),
        }
    }

    /// Materialize a scalar series on the grid.
    pub fn series(&self, key: &InputKey, tvec: &[f64]) -> Result<Array1<f64>> {
        let values: Result<Vec<f64>> = tvec.iter().map(|&t| self.get(key, t, None)).collect();
        Ok(Array1::from_vec(values?))
    }

    /// Materialize a per-population series as (npops x npts).
    pub fn values(&self, key: &InputKey, tvec: &[f64]) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((self.npops, tvec.len()));
        for pop in 0..self.npops {
            for (j, &t) in tvec.iter().enumerate() {
                out[[pop, j]] = self.get(key, t, Some(pop))?;
            }
        }
        Ok(out)
    }

    /// Read a matrix parameter.
    pub fn matrix(&self, key: &InputKey) -> Result<Array2<f64>> {
        match self.pars.get(key) {
            Some(Par::Matrix(m)) => {
                let mut out = Array2::zeros((self.npops, self.npops));
                for (i, row) in m.iter().enumerate() {
                    for (j, &v) in row.iter().enumerate() {
                        out[[i, j]] = v;
                    }
                }
                Ok(out)
            }
            Some(_) => Err(Error::ShapeMismatch {
                expected: "matrix parameter".into(),
                actual: "time-series".into(),
                locus: Locus::parameter(key.to_string()),
            }),
            None => Err(Error::UnknownKey {
                key: key.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::populations::Population;

    fn popset() -> PopulationSet {
        PopulationSet::new(vec![
            Population::new("FSW", "Female sex workers").female().sexworker(),
            Population::new("MSM", "Men who have sex with men").male(),
        ])
        .unwrap()
    }

    #[test]
    fn test_key_parse_roundtrip() {
        let key: InputKey = "condom.reg".parse().unwrap();
        assert_eq!(key, InputKey::sub("condom", "reg"));
        assert_eq!(key.to_string(), "condom.reg");
        let key: InputKey = "hivtest".parse().unwrap();
        assert_eq!(key, InputKey::new("hivtest"));
    }

    #[test]
    fn test_interpolation_held_outside_anchors() {
        let anchors = Anchors::new(vec![2000.0, 2010.0], vec![0.2, 0.4]);
        assert_eq!(anchors.interp(1995.0), Some(0.2));
        assert_eq!(anchors.interp(2015.0), Some(0.4));
        let mid = anchors.interp(2005.0).unwrap();
        assert!((mid - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_set_enforces_range() {
        let pops = popset();
        let mut parset = ParameterSet::new("default", &pops);
        let key = InputKey::sub("condom", "reg");
        assert!(parset.set(&key, Some(0), 2000.0, 0.5).is_ok());
        let err = parset.set(&key, Some(0), 2000.0, 1.5).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn test_unknown_key() {
        let pops = popset();
        let mut parset = ParameterSet::new("default", &pops);
        let key = InputKey::new("nonsense");
        let err = parset.set(&key, Some(0), 2000.0, 0.5).unwrap_err();
        assert!(matches!(err, Error::UnknownKey { .. }));
    }

    #[test]
    fn test_popsize_growth() {
        let pops = popset();
        let mut parset = ParameterSet::new("default", &pops);
        parset
            .insert(
                InputKey::new("popsize"),
                Par::PopulationSize {
                    init: vec![1000.0, 2000.0],
                    growth: 0.03,
                    t0: 2000.0,
                },
            )
            .unwrap();
        let n0 = parset.get(&InputKey::new("popsize"), 2000.0, Some(0)).unwrap();
        let n10 = parset.get(&InputKey::new("popsize"), 2010.0, Some(0)).unwrap();
        assert!((n0 - 1000.0).abs() < 1e-9);
        assert!((n10 - 1000.0 * (0.3f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_values_shape() {
        let pops = popset();
        let mut parset = ParameterSet::new("default", &pops);
        let key = InputKey::new("hivtest");
        parset.set(&key, Some(0), 2000.0, 0.1).unwrap();
        parset.set(&key, Some(0), 2010.0, 0.3).unwrap();
        parset.set(&key, Some(1), 2000.0, 0.05).unwrap();
        let tvec = vec![2000.0, 2005.0, 2010.0];
        let arr = parset.values(&key, &tvec).unwrap();
        assert_eq!(arr.shape(), &[2, 3]);
        assert!((arr[[0, 1]] - 0.2).abs() < 1e-12);
        assert!((arr[[1, 2]] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_matrix_shape_checked() {
        let pops = popset();
        let mut parset = ParameterSet::new("default", &pops);
        let bad = Par::Matrix(vec![vec![0.0; 3]; 3]);
        let err = parset.insert(InputKey::sub("pships", "reg"), bad).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_coverage_keys() {
        assert!(is_coverage_key(&InputKey::new("numfirstline")));
        assert!(!is_coverage_key(&InputKey::sub("condom", "reg")));
    }
}
