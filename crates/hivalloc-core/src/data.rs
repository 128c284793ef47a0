//! The raw observed-data contract.
//!
//! An external loader (spreadsheet reader, database, ...) fills a
//! [`RawData`] with observed series per input key, per population, per year,
//! plus cost/coverage points per program and a constants block. The core
//! never parses files itself; it only consumes this structure, and a
//! [`crate::params::ParameterSet`] can be fit from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Locus, Result};
use crate::params::{key_spec, Anchors, Constants, Domain, InputKey, Par, ParameterSet};
use crate::populations::PopulationSet;

/// Observed cost and coverage points for one program.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostCoverageData {
    pub years: Vec<f64>,
    /// Spend per year; `None` where not reported.
    pub cost: Vec<Option<f64>>,
    /// People covered per year; `None` where not reported.
    pub coverage: Vec<Option<f64>>,
}

/// Everything the core needs from an external data source.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawData {
    /// The observed data years (e.g. 2000..=2015).
    pub years: Vec<f64>,
    /// Observed time series: key -> per-population rows of per-year values.
    /// Scalar keys carry a single row. `None` marks a missing cell.
    pub series: BTreeMap<InputKey, Vec<Vec<Option<f64>>>>,
    /// Population x population matrices.
    pub matrices: BTreeMap<InputKey, Vec<Vec<f64>>>,
    /// The constants block.
    pub constants: Constants,
    /// Exponential population growth rate applied to first-year sizes.
    pub growth: f64,
    /// Cost/coverage points keyed by program short name.
    pub costcov: BTreeMap<String, CostCoverageData>,
}

impl RawData {
    pub fn data_start(&self) -> Option<f64> {
        self.years.first().copied()
    }

    pub fn data_end(&self) -> Option<f64> {
        self.years.last().copied()
    }
}

impl ParameterSet {
    /// Fit a parameter store from observed data: each reported cell becomes
    /// a year anchor; missing cells are skipped; population sizes use the
    /// first reported year plus the declared growth rate.
    pub fn from_data(name: impl Into<String>, data: &RawData, popset: &PopulationSet) -> Result<Self> {
        let mut parset = ParameterSet::new(name, popset);
        parset.constants = data.constants;

        for (key, rows) in &data.series {
            let (domain, _) = key_spec(key)?;
            match domain {
                Domain::PopulationSize => {
                    let mut init = Vec::with_capacity(popset.len());
                    for (pop, row) in rows.iter().enumerate() {
                        let first = row.iter().flatten().next().copied();
                        match first {
                            Some(v) => init.push(v),
                            None => {
                                return Err(Error::NoData {
                                    locus: Locus::parameter(key.to_string()).with_population(
                                        popset.get(pop).map(|p| p.short.clone()).unwrap_or_default(),
                                    ),
                                })
                            }
                        }
                    }
                    parset.insert(
                        key.clone(),
                        Par::PopulationSize {
                            init,
                            growth: data.growth,
                            t0: data.data_start().unwrap_or(2000.0),
                        },
                    )?;
                }
                Domain::Scalar => {
                    let row = rows.first().ok_or_else(|| Error::NoData {
                        locus: Locus::parameter(key.to_string()),
                    })?;
                    let anchors = collect_anchors(&data.years, row);
                    if anchors.t.is_empty() {
                        return Err(Error::NoData {
                            locus: Locus::parameter(key.to_string()),
                        });
                    }
                    parset.insert(key.clone(), Par::Scalar(anchors))?;
                }
                Domain::PerPopulation => {
                    let mut pop_rows = Vec::with_capacity(rows.len());
                    for row in rows {
                        pop_rows.push(collect_anchors(&data.years, row));
                    }
                    // A population with no data inherits the across-population mean.
                    let fallback = mean_anchors(&pop_rows);
                    for row in pop_rows.iter_mut() {
                        if row.t.is_empty() {
                            *row = fallback.clone().ok_or_else(|| Error::NoData {
                                locus: Locus::parameter(key.to_string()),
                            })?;
                        }
                    }
                    parset.insert(key.clone(), Par::PerPopulation(pop_rows))?;
                }
                Domain::Matrix => {
                    return Err(Error::ShapeMismatch {
                        expected: "series data".into(),
                        actual: "matrix key".into(),
                        locus: Locus::parameter(key.to_string()),
                    })
                }
            }
        }

        for (key, m) in &data.matrices {
            parset.insert(key.clone(), Par::Matrix(m.clone()))?;
        }

        Ok(parset)
    }
}

fn collect_anchors(years: &[f64], row: &[Option<f64>]) -> Anchors {
    let mut anchors = Anchors::default();
    for (&year, value) in years.iter().zip(row) {
        if let Some(v) = value {
            anchors.upsert(year, *v);
        }
    }
    anchors
}

/// Year-wise mean of the rows that have data, used as a fallback series.
fn mean_anchors(rows: &[Anchors]) -> Option<Anchors> {
    let mut accum: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for row in rows {
        for (&t, &y) in row.t.iter().zip(&row.y) {
            let entry = accum.entry((t * 10.0).round() as i64).or_insert((0.0, 0));
            entry.0 += y;
            entry.1 += 1;
        }
    }
    if accum.is_empty() {
        return None;
    }
    let mut anchors = Anchors::default();
    for (tkey, (sum, n)) in accum {
        anchors.upsert(tkey as f64 / 10.0, sum / n as f64);
    }
    Some(anchors)
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
    fn test_from_data_skips_missing_cells() {
        let pops = popset();
        let mut data = RawData {
            years: vec![2000.0, 2005.0, 2010.0],
            growth: 0.02,
            ..RawData::default()
        };
        data.series.insert(
            InputKey::new("hivtest"),
            vec![
                vec![Some(0.1), None, Some(0.3)],
                vec![None, Some(0.2), None],
            ],
        );
        data.series.insert(
            InputKey::new("popsize"),
            vec![vec![Some(1000.0), None, None], vec![Some(5000.0), None, None]],
        );
        let parset = ParameterSet::from_data("default", &data, &pops).unwrap();
        let key = InputKey::new("hivtest");
        // Interpolated across the missing middle anchor.
        let v = parset.get(&key, 2005.0, Some(0)).unwrap();
        assert!((v - 0.2).abs() < 1e-12);
        // Second population has a single anchor, held constant.
        let v = parset.get(&key, 2010.0, Some(1)).unwrap();
        assert!((v - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_population_without_data_uses_mean() {
        let pops = popset();
        let mut data = RawData {
            years: vec![2000.0],
            ..RawData::default()
        };
        data.series.insert(
            InputKey::sub("condom", "reg"),
            vec![vec![Some(0.4)], vec![None]],
        );
        let parset = ParameterSet::from_data("default", &data, &pops).unwrap();
        let v = parset
            .get(&InputKey::sub("condom", "reg"), 2000.0, Some(1))
            .unwrap();
        assert!((v - 0.4).abs() < 1e-12);
    }
}
