//! Coverage-outcome curves.
//!
//! For each (program, effect) a curve maps a coverage fraction to a target
//! parameter value, bounded below by the zero-coverage value `z` and above
//! by the full-coverage value `f`. The linear form is
//! `y = z + (f - z) * c`; the saturating variant is
//! `y = z + (f - z) * (2 / (1 + exp(-2c/h)) - 1)` with half-saturation `h`.

use serde::{Deserialize, Serialize};

use crate::costcov::FallbackNote;

/// Coverage-outcome parameters anchored at one year.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CovOutAnchor {
    pub t: f64,
    /// Parameter value at zero coverage.
    pub zero: f64,
    /// Parameter value at full coverage.
    pub full: f64,
    /// Half-saturation constant; `None` selects the linear form.
    pub half: Option<f64>,
}

impl CovOutAnchor {
    pub fn linear(t: f64, zero: f64, full: f64) -> Self {
        CovOutAnchor {
            t,
            zero,
            full,
            half: None,
        }
    }

    pub fn saturating(t: f64, zero: f64, full: f64, half: f64) -> Self {
        CovOutAnchor {
            t,
            zero,
            full,
            half: Some(half),
        }
    }
}

/// A coverage-outcome curve with year anchors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CovOut {
    anchors: Vec<CovOutAnchor>,
    /// Defaults substituted when anchors were missing.
    pub fallbacks: Vec<FallbackNote>,
}

impl CovOut {
    pub fn new(mut anchors: Vec<CovOutAnchor>) -> Self {
        anchors.sort_by(|a, b| a.t.total_cmp(&b.t));
        CovOut {
            anchors,
            fallbacks: Vec::new(),
        }
    }

    /// A no-effect curve pinned at the given baseline value, annotated.
    pub fn fallback(t: f64, baseline: f64, reason: impl Into<String>) -> Self {
        let mut co = CovOut::new(vec![CovOutAnchor::linear(t, baseline, baseline)]);
        co.fallbacks.push(FallbackNote {
            field: "zero,full".into(),
            reason: reason.into(),
        });
        co
    }

    pub fn anchors(&self) -> &[CovOutAnchor] {
        &self.anchors
    }

    /// Interpolated anchor at year `t` (held constant outside anchors).
    pub fn params_at(&self, t: f64) -> Option<CovOutAnchor> {
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
        let half = match (self.anchors[lo].half, self.anchors[hi].half) {
            (Some(a), Some(b)) => Some(lerp(a, b)),
            (a, b) => a.or(b),
        };
        Some(CovOutAnchor {
            t,
            zero: lerp(self.anchors[lo].zero, self.anchors[hi].zero),
            full: lerp(self.anchors[lo].full, self.anchors[hi].full),
            half,
        })
    }

    /// Target-parameter value at the given coverage fraction.
    pub fn evaluate(&self, coverage_fraction: f64, t: f64) -> Option<f64> {
        let pars = self.params_at(t)?;
        let c = coverage_fraction.clamp(0.0, 1.0);
        let frac = match pars.half {
            Some(h) if h > 0.0 => 2.0 / (1.0 + (-2.0 * c / h).exp()) - 1.0,
            _ => c,
        };
        Some(pars.zero + (pars.full - pars.zero) * frac)
    }

    /// Zero-coverage value at year `t`.
    pub fn zero_at(&self, t: f64) -> Option<f64> {
        self.params_at(t).map(|p| p.zero)
    }

    /// Full-coverage value at year `t`.
    pub fn full_at(&self, t: f64) -> Option<f64> {
        self.evaluate(1.0, t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_endpoints() {
        let co = CovOut::new(vec![CovOutAnchor::linear(2015.0, 0.3, 0.8)]);
        assert!((co.evaluate(0.0, 2015.0).unwrap() - 0.3).abs() < 1e-12);
        assert!((co.evaluate(1.0, 2015.0).unwrap() - 0.8).abs() < 1e-12);
        assert!((co.evaluate(0.5, 2015.0).unwrap() - 0.55).abs() < 1e-12);
    }

    #[test]
    fn test_monotone_in_coverage() {
        let linear = CovOut::new(vec![CovOutAnchor::linear(2015.0, 0.3, 0.8)]);
        let saturating = CovOut::new(vec![CovOutAnchor::saturating(2015.0, 0.3, 0.8, 0.4)]);
        for co in [linear, saturating] {
            let mut prev = f64::NEG_INFINITY;
            for i in 0..=10 {
                let v = co.evaluate(i as f64 / 10.0, 2015.0).unwrap();
                assert!(v >= prev);
                prev = v;
            }
        }
    }

    #[test]
    fn test_saturating_starts_at_zero_value() {
        let co = CovOut::new(vec![CovOutAnchor::saturating(2015.0, 0.3, 0.8, 0.4)]);
        assert!((co.evaluate(0.0, 2015.0).unwrap() - 0.3).abs() < 1e-12);
        // Approaches but does not quite reach the full value at coverage 1.
        let at_one = co.evaluate(1.0, 2015.0).unwrap();
        assert!(at_one > 0.75 && at_one < 0.8);
    }

    #[test]
    fn test_decreasing_target_also_monotone() {
        // A needle-sharing style effect: higher coverage lowers the value.
        let co = CovOut::new(vec![CovOutAnchor::linear(2015.0, 0.5, 0.1)]);
        assert!(co.evaluate(0.9, 2015.0).unwrap() < co.evaluate(0.1, 2015.0).unwrap());
    }

    #[test]
    fn test_year_interpolation() {
        let co = CovOut::new(vec![
            CovOutAnchor::linear(2010.0, 0.2, 0.6),
            CovOutAnchor::linear(2020.0, 0.4, 0.8),
        ]);
        let pars = co.params_at(2015.0).unwrap();
        assert!((pars.zero - 0.3).abs() < 1e-12);
        assert!((pars.full - 0.7).abs() < 1e-12);
    }
}
