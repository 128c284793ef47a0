//! Core data model for the hivalloc HIV epidemic and allocation engine:
//! populations, the simulation time grid, the parameter store, the
//! budget-overlay contract, the program catalog, and the raw-data contract
//! filled by external loaders.

pub mod catalog;
pub mod data;
pub mod error;
pub mod overlay;
pub mod params;
pub mod populations;
pub mod settings;

pub use catalog::{parse_catalog, CatalogEntry, PROGRAM_CATALOG};
pub use data::{CostCoverageData, RawData};
pub use error::{Error, Locus, Result};
pub use overlay::{OverlayEntry, ParameterOverlay};
pub use params::{
    is_coverage_key, key_spec, Anchors, Constants, Domain, InputKey, Par, ParameterSet, Range,
    StageVals,
};
pub use populations::{Population, PopulationSet};
pub use settings::{eligible_from_stage, Cd4Stage, TimeGrid, DEFAULT_DT, NCD4};
