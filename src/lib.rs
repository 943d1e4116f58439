//! ai-taskd: durable task queue, worker pool, tool-execution sessions and a
//! multi-backend router with fallback and cost accounting.

pub mod backends;
pub mod config;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod session;
pub mod store;
pub mod tasks;
pub mod tools;
pub mod worker;
