//! AgentScope server library
//!
//! Telemetry ingestion, bounded in-memory storage, budget enforcement, and
//! live distribution for a running AI-agent process.

pub mod api;
pub mod app;
pub mod core;
pub mod domain;
pub mod live;
pub mod persist;
pub mod store;
pub mod utils;
