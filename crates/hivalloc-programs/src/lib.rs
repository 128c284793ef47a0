//! Program economics for hivalloc: cost-coverage curves, coverage-outcome
//! curves, and program sets translating budget vectors into parameter
//! overlays for the simulation engine.

pub mod costcov;
pub mod covout;
pub mod program;
pub mod progset;

pub use costcov::{CostCov, CostCovAnchor, FallbackNote, DEFAULT_SATURATION, DEFAULT_UNITCOST};
pub use covout::{CovOut, CovOutAnchor};
pub use program::{CostCovDatum, Effect, PopTarget, Program};
pub use progset::ProgramSet;
