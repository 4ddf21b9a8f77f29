//! Scenario tests
//!
//! End-to-end behaviour across the store, the registry, the capture layer
//! and the recovery orchestrator.

pub mod capture_tests;
pub mod containment_tests;
pub mod store_tests;
