//! Configuration and routes for the demo server.
//!
//! ## Structure
//!
//! - [`config`] - CLI/env configuration and its conversion into the
//!   coalescing policy.
//! - [`routes`] - demo endpoints that make coalescing observable.

pub mod config;
pub mod routes;
