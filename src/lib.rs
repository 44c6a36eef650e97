//! # Credential Sync Library
//!
//! Ingests credentials issued by external skill registries, reconciles them
//! against internal learners and keeps the reconciliation durable under
//! partial failure.

pub mod adapters;
pub mod anchoring;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dlq;
pub mod error;
pub mod handlers;
pub mod matching;
pub mod models;
pub mod orchestrator;
pub mod repositories;
pub mod retry;
pub mod scheduler;
pub mod seeds;
pub mod server;
pub mod telemetry;
pub mod webhook_verification;
pub use migration;
