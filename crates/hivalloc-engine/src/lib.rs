//! The hivalloc simulation engine: model-parameter materialization, the
//! compartmental HIV simulator, and results extraction.

pub mod model;
pub mod modelpars;
pub mod results;

pub use model::{SimOutput, Simulator, NSTATES, SUS};
pub use modelpars::{ActType, ByAct, CondomPars, ModelPars};
pub use results::{ObjectiveKind, Objectives, ResultSeries, Results};
