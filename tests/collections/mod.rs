//! Shared collection integration tests.
//!
//! Exercises feeds, sorted feeds, queues and jobs through a [`Registry`]
//! against any store. Each backend test binary connects a registry and runs
//! these with `run_collection_tests!`.

pub mod collection_tests;
