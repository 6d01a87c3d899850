//! Domain models for sift.
//!
//! - `RunParameters`: immutable run description
//! - `SampleRecord` / `Split`: dataset units
//! - `Stage`: pipeline work attribution
//! - `CurationError`: error taxonomy

pub mod digest;
pub mod error;
pub mod params;
pub mod sample;
pub mod stage;

pub use error::{CurationError, Result};
pub use params::{
    CacheConfig, LoggingConfig, PreprocConfig, RunParameters, ScoringConfig, TrainingConfig,
};
pub use sample::{SampleRecord, Split};
pub use stage::Stage;
