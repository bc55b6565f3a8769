//! Finance Query Orchestrator
//!
//! Answers natural-language questions about working capital (DSO, DPO, cash
//! conversion cycle, overdue balances) from ledger data:
//! - Plans each request as a validated task graph over a capability catalog
//! - Runs independent tasks concurrently with retries and a request deadline
//! - Computes every figure deterministically in exact decimal arithmetic
//! - Reads each source once per request through shared snapshots
//! - Narrates results without ever letting a model supply a number
//! - Keeps a hashed audit record tracing every figure to its task
//!
//! PIPELINE:
//! INPUT → PLAN → EXECUTE → NARRATE → AUDIT

pub mod agent;
pub mod api;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod connectors;
pub mod engine;
pub mod error;
pub mod graph;
pub mod llm;
pub mod models;
pub mod narrator;
pub mod orchestrator;
pub mod period;
pub mod planner;
pub mod schema;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Result;

// Re-export common types
pub use agent::{Agent, Outcome};
pub use config::AgentConfig;
pub use models::*;
