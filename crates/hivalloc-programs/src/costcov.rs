//! Cost-coverage curves.
//!
//! Each program carries a saturating spend -> coverage function. With
//! `x = spend / popsize`:
//!
//! - 2-parameter form: `cov_frac = s * (2 / (1 + exp(-2x/u)) - 1)`
//! - 4-parameter form: adds a lower asymptote `alpha` and a threshold
//!   `beta`; the curve is `(s - alpha) * (2/(1+exp(-2x/u)) - 1) + alpha`
//!   for `x >= beta` and linear from the origin below the threshold, so
//!   coverage at zero cost is exactly zero.
//!
//! Parameters are year-anchored and interpolate linearly in time.

use serde::{Deserialize, Serialize};

use hivalloc_core::{Error, Locus, Result};

/// Default saturation used when a program has no usable cost-coverage data.
pub const DEFAULT_SATURATION: f64 = 0.8;
/// Default unit cost used when a program has no usable cost-coverage data.
pub const DEFAULT_UNITCOST: f64 = 30.0;

/// Annotation of a default substituted during fitting, and why.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallbackNote {
    pub field: String,
    pub reason: String,
}

/// Cost-coverage parameters anchored at one year.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostCovAnchor {
    pub t: f64,
    /// Saturation coverage fraction, in [0, 1].
    pub saturation: f64,
    /// Cost per person-year of coverage at low coverage.
    pub unitcost: f64,
    /// Lower asymptote of the 4-parameter form.
    pub lower: Option<f64>,
    /// Pre-saturation cost threshold (per capita) of the 4-parameter form.
    pub threshold: Option<f64>,
}

impl CostCovAnchor {
    pub fn new(t: f64, saturation: f64, unitcost: f64) -> Self {
        CostCovAnchor {
            t,
            saturation,
            unitcost,
            lower: None,
            threshold: None,
        }
    }
}

/// A fitted cost-coverage curve with year anchors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostCov {
    anchors: Vec<CostCovAnchor>,
    /// Defaults substituted during fitting, if any.
    pub fallbacks: Vec<FallbackNote>,
}

impl CostCov {
    pub fn new(mut anchors: Vec<CostCovAnchor>) -> Self {
        anchors.sort_by(|a, b| a.t.total_cmp(&b.t));
        CostCov {
            anchors,
            fallbacks: Vec::new(),
        }
    }

    /// The declared-default curve, annotated as a fallback.
    pub fn fallback(t: f64, reason: impl Into<String>) -> Self {
        let mut cc = CostCov::new(vec![CostCovAnchor::new(t, DEFAULT_SATURATION, DEFAULT_UNITCOST)]);
        cc.fallbacks.push(FallbackNote {
            field: "saturation,unitcost".into(),
            reason: reason.into(),
        });
        cc
    }

    /// Fit the unit cost so the curve passes through the last historical
    /// point at the declared saturation. Falls back to defaults (with an
    /// annotation) when no usable point exists.
    pub fn fit(
        program: &str,
        saturation: f64,
        points: &[(f64, f64, f64)], // (year, cost, coverage_people)
        popsize: f64,
    ) -> Self {
        let last = points
            .iter()
            .filter(|(_, cost, cov)| cost.is_finite() && cov.is_finite() && *cost > 0.0 && *cov > 0.0)
            .last();
        let (t, cost, coverage) = match last {
            Some(&p) => p,
            None => {
                return CostCov::fallback(
                    2015.0,
                    format!("no cost-coverage data for program {}", program),
                )
            }
        };
        if popsize <= 0.0 {
            return CostCov::fallback(t, format!("no target popsize for program {}", program));
        }
        let x = cost / popsize;
        let mut c = coverage / popsize;
        let mut fallbacks = Vec::new();
        // A reported coverage at or above saturation cannot be hit by the
        // curve; pull it just inside and note the substitution.
        if c >= saturation {
            c = saturation * 0.999;
            fallbacks.push(FallbackNote {
                field: "coverage".into(),
                reason: format!(
                    "reported coverage {:.0} at or above saturation for program {}",
                    coverage, program
                ),
            });
        }
        let ratio = c / saturation;
        let unitcost = 2.0 * x / ((1.0 + ratio) / (1.0 - ratio)).ln();
        let mut cc = CostCov::new(vec![CostCovAnchor::new(t, saturation, unitcost)]);
        cc.fallbacks = fallbacks;
        cc
    }

    pub fn anchors(&self) -> &[CostCovAnchor] {
        &self.anchors
    }

    /// Interpolated parameters at year `t` (held constant outside anchors).
    pub fn params_at(&self, t: f64) -> Option<CostCovAnchor> {
        if self.anchors.is_empty() {
            return None;
        }
        if t <= self.anchors[0].t || self.anchors.len() == 1 {
            return Some(self.anchors[0].clone());
        }
        let last = self.anchors.len() - 1;
        if t >= self.anchors[last].t {
            return Some(self.anchors[last].clone());
        }
        let hi = self.anchors.iter().position(|a| a.t > t).unwrap_or(last);
        let lo = hi - 1;
        let frac = (t - self.anchors[lo].t) / (self.anchors[hi].t - self.anchors[lo].t);
        let lerp = |a: f64, b: f64| a + frac * (b - a);
        let lower = match (self.anchors[lo].lower, self.anchors[hi].lower) {
            (Some(a), Some(b)) => Some(lerp(a, b)),
            (a, b) => a.or(b),
        };
        let threshold = match (self.anchors[lo].threshold, self.anchors[hi].threshold) {
            (Some(a), Some(b)) => Some(lerp(a, b)),
            (a, b) => a.or(b),
        };
        Some(CostCovAnchor {
            t,
            saturation: lerp(self.anchors[lo].saturation, self.anchors[hi].saturation),
            unitcost: lerp(self.anchors[lo].unitcost, self.anchors[hi].unitcost),
            lower,
            threshold,
        })
    }

    fn fraction(pars: &CostCovAnchor, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        let sat = |x: f64| 2.0 / (1.0 + (-2.0 * x / pars.unitcost).exp()) - 1.0;
        match (pars.lower, pars.threshold) {
            (Some(alpha), Some(beta)) if beta > 0.0 => {
                let at_threshold = (pars.saturation - alpha) * sat(beta) + alpha;
                if x >= beta {
                    (pars.saturation - alpha) * sat(x) + alpha
                } else {
                    x / beta * at_threshold
                }
            }
            _ => pars.saturation * sat(x),
        }
    }

    /// Coverage in people for the given spend and target population size.
    pub fn evaluate(&self, spend: f64, popsize: f64, t: f64) -> f64 {
        if popsize <= 0.0 {
            return 0.0;
        }
        match self.params_at(t) {
            Some(pars) => Self::fraction(&pars, spend / popsize).clamp(0.0, 1.0) * popsize,
            None => 0.0,
        }
    }

    /// Spend required for a target coverage in people. `Infeasible` when
    /// the target is at or beyond the saturating level.
    pub fn inverse(&self, target_coverage: f64, popsize: f64, t: f64) -> Result<f64> {
        if target_coverage <= 0.0 || popsize <= 0.0 {
            return Ok(0.0);
        }
        let pars = self.params_at(t).ok_or_else(|| Error::NoData {
            locus: Locus::parameter("costcov").with_year(t),
        })?;
        let c = target_coverage / popsize;
        if c >= pars.saturation {
            return Err(Error::Infeasible {
                reason: format!(
                    "target coverage fraction {:.3} at or above saturation {:.3}",
                    c, pars.saturation
                ),
                locus: Locus::default().with_year(t),
            });
        }
        // Invert the saturating branch.
        let invert_sat = |frac: f64, floor: f64| -> f64 {
            let ratio = (frac - floor) / (pars.saturation - floor);
            pars.unitcost / 2.0 * ((1.0 + ratio) / (1.0 - ratio)).ln()
        };
        let x = match (pars.lower, pars.threshold) {
            (Some(alpha), Some(beta)) if beta > 0.0 => {
                let at_threshold = Self::fraction(&pars, beta);
                if c <= at_threshold {
                    c / at_threshold * beta
                } else {
                    invert_sat(c, alpha)
                }
            }
            _ => invert_sat(c, 0.0),
        };
        Ok(x * popsize)
    }
}
