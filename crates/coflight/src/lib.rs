#![doc = include_str!("../README.md")]

mod error;
mod fingerprint;
mod outcome;
mod registry;

pub use error::{Error, Result};
pub use fingerprint::{FINGERPRINT_LEN, Fingerprint};
pub use outcome::{CapturedResponse, Outcome};
pub use registry::{DEFAULT_TTL, Entry, FollowerHandle, LeaderToken, Registry};
