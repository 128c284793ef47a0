//! Error types shared across the workspace.
//!
//! Every failure carries a [`Locus`] naming the program, parameter,
//! population, and year it refers to, where these are known.

use serde::{Deserialize, Serialize};

/// Where in the model an error occurred.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Locus {
    pub program: Option<String>,
    pub parameter: Option<String>,
    pub population: Option<String>,
    pub year: Option<f64>,
}

impl Locus {
    pub fn parameter(name: impl Into<String>) -> Self {
        Locus {
            parameter: Some(name.into()),
            ..Locus::default()
        }
    }

    pub fn program(name: impl Into<String>) -> Self {
        Locus {
            program: Some(name.into()),
            ..Locus::default()
        }
    }

    pub fn population(name: impl Into<String>) -> Self {
        Locus {
            population: Some(name.into()),
            ..Locus::default()
        }
    }

    pub fn with_population(mut self, name: impl Into<String>) -> Self {
        self.population = Some(name.into());
        self
    }

    pub fn with_year(mut self, year: f64) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>) -> Self {
        self.parameter = Some(name.into());
        self
    }
}

impl std::fmt::Display for Locus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(p) = &self.program {
            parts.push(format!("program {}", p));
        }
        if let Some(p) = &self.parameter {
            parts.push(format!("parameter {}", p));
        }
        if let Some(p) = &self.population {
            parts.push(format!("population {}", p));
        }
        if let Some(y) = self.year {
            parts.push(format!("year {:.1}", y));
        }
        if parts.is_empty() {
            write!(f, "<unlocated>")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Failure modes of the engine, programs, and optimizer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown parameter key '{key}'")]
    UnknownKey { key: String },

    #[error("value {value} outside [{low}, {high}] for {locus}")]
    OutOfRange {
        value: f64,
        low: f64,
        high: f64,
        locus: Locus,
    },

    #[error("shape mismatch for {locus}: expected {expected}, got {actual}")]
    ShapeMismatch {
        expected: String,
        actual: String,
        locus: Locus,
    },

    #[error("infeasible: {reason} ({locus})")]
    Infeasible { reason: String, locus: Locus },

    #[error("numerical failure at {locus}: {reason}")]
    Numerical { reason: String, locus: Locus },

    #[error("no data for {locus}")]
    NoData { locus: Locus },

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {seconds:.1} s")]
    Timeout { seconds: f64 },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locus_display() {
        let locus = Locus::parameter("hivtest")
            .with_population("FSW")
            .with_year(2015.0);
        let text = locus.to_string();
        assert!(text.contains("hivtest"));
        assert!(text.contains("FSW"));
        assert!(text.contains("2015.0"));
    }

    #[test]
    fn test_error_messages() {
        let err = Error::OutOfRange {
            value: 1.5,
            low: 0.0,
            high: 1.0,
            locus: Locus::parameter("condom.reg"),
        };
        assert!(err.to_string().contains("condom.reg"));
        assert!(err.to_string().contains("1.5"));

        let err = Error::UnknownKey {
            key: "nonsense".into(),
        };
        assert!(err.to_string().contains("nonsense"));
    }
}
