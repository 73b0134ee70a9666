//! DEALSCOUT: multi-site discount scanner
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod error;
pub mod types;
pub mod proxy;
pub mod session;
pub mod pacing;
pub mod market;
pub mod sites;
pub mod engine;
pub mod storage;
pub mod notify;
pub mod dashboard;
