//! Spatial normalization pipeline for Normflow.
//!
//! Expands subjects x tasks x smoothing widths into independent work units,
//! resolves each unit's inputs, resamples the BOLD and anatomical volumes into
//! template space with `antsApplyTransforms`, and places the results into a
//! per-subject sink tree.

pub mod collector;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod layout;
pub mod params;
pub mod resolve;
pub mod runner;
pub mod transform;

pub use collector::*;
pub use config::*;
pub use dispatch::*;
pub use errors::*;
pub use events::*;
pub use layout::*;
pub use params::*;
pub use resolve::*;
pub use runner::*;
pub use transform::*;
