//! Ambient building blocks shared by every Tollbooth crate: errors,
//! configuration, short-ID assignment, and the `{{var}}` interpolator.

pub mod errors;
pub mod configuration;
pub mod ids;
pub mod interpolate;
pub mod sanitize;

pub use errors::CoreError;
pub use configuration::Configuration;
