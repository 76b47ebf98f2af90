#![doc = include_str!("../README.md")]

mod config;
mod layer;

pub use config::{CoalesceConfig, DEFAULT_MAX_BODY_BYTES};
pub use layer::{Coalesce, CoalesceLayer};
// Public re-export so downstream crates can name registry and fingerprint
// types without a separate dependency on the core crate.
pub use coflight;
