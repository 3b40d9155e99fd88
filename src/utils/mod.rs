//! Shared helpers.
//!
//! These are stateless helper functions used across the crate.

pub mod bootstrap;
pub mod retry;
