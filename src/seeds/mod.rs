//! Database seeding functionality
//!
//! Brings the catalog tables in line with the adapters this process has
//! configured. Runs at every startup and is idempotent.

pub mod provider;

pub use provider::seed_providers;
